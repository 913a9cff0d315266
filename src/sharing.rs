//! Parameter sharing across recurrence steps.
//!
//! Every step-indexed role either owns one module that all steps read, or one
//! module per step. The collections are validated once when the networks are
//! built; afterwards [`StepModules::resolve`] is the only way a step reaches
//! its weights.
use std::fmt;

use crate::error::{ConvDrawError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    GeneratorCore,
    GeneratorPrior,
    GeneratorUpsampler,
    InferenceCore,
    InferencePosterior,
}

impl Role {
    /// Instances a per-step policy builds. The last step never goes through
    /// the regular upsamplers, it has a dedicated one.
    pub fn per_step_count(&self, generation_steps: usize) -> usize {
        match self {
            Role::GeneratorUpsampler => generation_steps.saturating_sub(1),
            _ => generation_steps,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::GeneratorCore => "generator core",
            Role::GeneratorPrior => "generator prior",
            Role::GeneratorUpsampler => "generator upsampler",
            Role::InferenceCore => "inference core",
            Role::InferencePosterior => "inference posterior",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SharingPolicy {
    pub generator_core: bool,
    pub generator_prior: bool,
    pub generator_upsampler: bool,
    pub inference_core: bool,
    pub inference_posterior: bool,
}

impl SharingPolicy {
    pub fn shared() -> Self {
        Self {
            generator_core: true,
            generator_prior: true,
            generator_upsampler: true,
            inference_core: true,
            inference_posterior: true,
        }
    }

    pub fn is_shared(&self, role: Role) -> bool {
        match role {
            Role::GeneratorCore => self.generator_core,
            Role::GeneratorPrior => self.generator_prior,
            Role::GeneratorUpsampler => self.generator_upsampler,
            Role::InferenceCore => self.inference_core,
            Role::InferencePosterior => self.inference_posterior,
        }
    }

    pub fn instances(&self, role: Role, generation_steps: usize) -> usize {
        if self.is_shared(role) {
            1
        } else {
            role.per_step_count(generation_steps)
        }
    }
}

#[derive(Debug)]
pub struct StepModules<T> {
    role: Role,
    shared: bool,
    generation_steps: usize,
    modules: Vec<T>,
}

impl<T> StepModules<T> {
    pub fn new(role: Role, policy: &SharingPolicy, generation_steps: usize, modules: Vec<T>) -> Result<Self> {
        let expected = policy.instances(role, generation_steps);
        if modules.len() != expected {
            return Err(ConvDrawError::SharingPolicy {
                role: role.to_string(),
                expected,
                actual: modules.len(),
            });
        }
        Ok(Self { role, shared: policy.is_shared(role), generation_steps, modules })
    }

    /// Builds as many instances as the policy asks for, passing each its index.
    pub fn build<F>(role: Role, policy: &SharingPolicy, generation_steps: usize, f: F) -> Result<Self>
    where
        F: FnMut(usize) -> T,
    {
        let modules = (0..policy.instances(role, generation_steps)).map(f).collect();
        Self::new(role, policy, generation_steps, modules)
    }

    /// The shared singleton, or the module owned by `step`.
    pub fn resolve(&self, step: usize) -> Result<&T> {
        let steps = self.role.per_step_count(self.generation_steps);
        if step >= steps {
            return Err(ConvDrawError::StepOutOfRange { step, steps });
        }
        let index = if self.shared { 0 } else { step };
        self.modules
            .get(index)
            .ok_or(ConvDrawError::StepOutOfRange { step, steps })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.modules.iter()
    }
}
