//! Convolutional LSTM cell shared by the generator and inference cores.
use tch::{nn, Device, Kind, Tensor};

use crate::{
    error::{ConvDrawError, Result},
    utils::{check_channels, check_same_shape, he_normal, INIT_SCALE},
};

/// Hidden and cell state of one recurrent core, `[batch, chz, h', w']` each.
#[derive(Debug)]
pub struct LstmState {
    pub h: Tensor,
    pub c: Tensor,
}

impl LstmState {
    pub fn zeros(batch_size: i64, channels: i64, size: [i64; 2], device: Device) -> Self {
        let shape = [batch_size, channels, size[0], size[1]];
        Self {
            h: Tensor::zeros(shape, (Kind::Float, device)),
            c: Tensor::zeros(shape, (Kind::Float, device)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConvLstmConfig {
    pub kernel_size: i64,
    pub stride: i64,
    pub padding: i64,
    /// Number of per-step batch norms applied to the cell input, 0 disables them.
    pub norm_steps: usize,
}

impl Default for ConvLstmConfig {
    fn default() -> Self {
        Self { kernel_size: 5, stride: 1, padding: 2, norm_steps: 0 }
    }
}

#[derive(Debug)]
pub struct ConvLstmCell {
    lstm_tanh: nn::Conv2D,
    lstm_i: nn::Conv2D,
    lstm_f: nn::Conv2D,
    lstm_o: nn::Conv2D,
    norms: Vec<nn::BatchNorm>,
    in_channels: i64,
    hidden_channels: i64,
    pub config: ConvLstmConfig,
}

impl ConvLstmCell {
    pub fn new(vs: nn::Path, in_channels: i64, hidden_channels: i64, config: ConvLstmConfig) -> Self {
        let k = config.kernel_size;
        let conv_cfg = nn::ConvConfig {
            stride: config.stride,
            padding: config.padding,
            ws_init: he_normal(in_channels, k, INIT_SCALE),
            ..Default::default()
        };
        let lstm_tanh = nn::conv2d(&vs / "lstm_tanh", in_channels, hidden_channels, k, conv_cfg);
        let lstm_i = nn::conv2d(&vs / "lstm_i", in_channels, hidden_channels, k, conv_cfg);
        let lstm_f = nn::conv2d(&vs / "lstm_f", in_channels, hidden_channels, k, conv_cfg);
        let lstm_o = nn::conv2d(&vs / "lstm_o", in_channels, hidden_channels, k, conv_cfg);
        let vs_norms = &vs / "norms";
        let norms = (0..config.norm_steps)
            .map(|index| nn::batch_norm2d(&vs_norms / index, in_channels, Default::default()))
            .collect();
        Self { lstm_tanh, lstm_i, lstm_f, lstm_o, norms, in_channels, hidden_channels, config }
    }

    pub fn in_channels(&self) -> i64 {
        self.in_channels
    }

    /// One cell update. `norm_step` selects the batch norm when the cell was
    /// built with per-step normalisation; it is ignored otherwise.
    pub fn forward(&self, xs: &Tensor, state: &LstmState, norm_step: usize, train: bool) -> Result<LstmState> {
        check_channels(xs, self.in_channels, "conv lstm input")?;
        check_channels(&state.h, self.hidden_channels, "conv lstm hidden state")?;
        check_same_shape(&state.h, &state.c, "conv lstm cell state")?;
        let (x_size, h_size) = (xs.size(), state.h.size());
        if x_size[0] != h_size[0] || x_size[2..] != h_size[2..] {
            return Err(ConvDrawError::ShapeMismatch {
                context: "conv lstm input vs state".to_string(),
                expected: vec![h_size[0], self.in_channels, h_size[2], h_size[3]],
                actual: x_size,
            });
        }

        let normalized;
        let lstm_in = if self.norms.is_empty() {
            xs
        } else {
            let norm = self.norms.get(norm_step).ok_or(ConvDrawError::StepOutOfRange {
                step: norm_step,
                steps: self.norms.len(),
            })?;
            normalized = xs.apply_t(norm, train);
            &normalized
        };

        let forget_gate = lstm_in.apply(&self.lstm_f).sigmoid();
        let input_gate = lstm_in.apply(&self.lstm_i).sigmoid();
        let candidate = lstm_in.apply(&self.lstm_tanh).tanh();
        let output_gate = lstm_in.apply(&self.lstm_o).sigmoid();
        let c = forget_gate * &state.c + input_gate * candidate;
        let h = output_gate * c.tanh();
        Ok(LstmState { h, c })
    }
}
