//! In-memory image dataset for the training driver.
use std::{fs, path::Path};

use anyhow::{bail, Context};
use tch::{Device, IndexOp, Kind, Tensor};

/// Images stored as `[n, 3, h, w]` floats scaled to `[-1, 1]`.
#[derive(Debug)]
pub struct ImageDataset {
    images: Tensor,
}

impl ImageDataset {
    pub fn new(images: Tensor) -> anyhow::Result<Self> {
        let size = images.size();
        if size.len() != 4 || size[1] != 3 {
            bail!("expected images shaped [n, 3, h, w], got {:?}", size);
        }
        Ok(Self { images })
    }

    /// Loads every `.npy` file of `dir`, in file name order. Each file holds
    /// `[n, h, w, 3]` pixels in `0..=255`.
    pub fn from_npy_dir<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        let mut files = fs::read_dir(dir)
            .with_context(|| format!("error listing {:?}", dir.to_string_lossy()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "npy"))
            .collect::<Vec<_>>();
        files.sort();
        if files.is_empty() {
            bail!("no .npy files in {:?}", dir.to_string_lossy());
        }
        let mut images = Vec::with_capacity(files.len());
        for path in files.iter() {
            let array = Tensor::read_npy(path)
                .with_context(|| format!("error reading {:?}", path.to_string_lossy()))?;
            let size = array.size();
            if size.len() != 4 || size[3] != 3 {
                bail!("expected {:?} to hold [n, h, w, 3] pixels, got {:?}", path.to_string_lossy(), size);
            }
            let array = array.to_kind(Kind::Float) / 255. * 2. - 1.;
            let array = array
                .f_permute([0, 3, 1, 2])
                .with_context(|| format!("error transposing {:?}", path.to_string_lossy()))?;
            images.push(array);
        }
        tracing::info!(files = files.len(), "loaded image dataset");
        let images = Tensor::f_cat(&images, 0)
            .with_context(|| format!("images in {:?} differ in size", dir.to_string_lossy()))?;
        Self::new(images)
    }

    pub fn len(&self) -> i64 {
        self.images.size()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    /// First `train_fraction` of the images for training, the rest held out.
    pub fn split(&self, train_fraction: f64) -> (ImageDataset, ImageDataset) {
        let n = self.len();
        let n_train = ((n as f64 * train_fraction) as i64).clamp(0, n);
        (
            ImageDataset { images: self.images.i(..n_train) },
            ImageDataset { images: self.images.i(n_train..) },
        )
    }

    /// Shuffled full batches moved to `device`; a trailing partial batch is
    /// dropped so every batch has the same size.
    pub fn batches(&self, batch_size: i64, device: Device) -> BatchIterator<'_> {
        let order = Tensor::randperm(self.len(), (Kind::Int64, Device::Cpu));
        BatchIterator { dataset: self, order, batch_size, index: 0, device }
    }
}

pub struct BatchIterator<'a> {
    dataset: &'a ImageDataset,
    order: Tensor,
    batch_size: i64,
    index: i64,
    device: Device,
}

impl<'a> BatchIterator<'a> {
    pub fn num_batches(&self) -> i64 {
        if self.batch_size <= 0 {
            return 0;
        }
        self.dataset.len() / self.batch_size
    }
}

impl<'a> Iterator for BatchIterator<'a> {
    type Item = Tensor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch_size <= 0 || self.index + self.batch_size > self.dataset.len() {
            return None;
        }
        let indices = self.order.i(self.index..self.index + self.batch_size);
        self.index += self.batch_size;
        Some(self.dataset.images.index_select(0, &indices).to(self.device))
    }
}
