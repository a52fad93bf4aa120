//! Structured buffers: one named, shape-checked array of `f64` per task slot.
//!
//! Layout is item-major: `[islands][individuals][task_size][width]`, so one
//! item's fields are contiguous and a backend can hand each item its own
//! `&mut [f64]` chunk.

use crate::batch::{BatchShape, DataItem};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    name: String,
    shape: BatchShape,
    width: usize,
    data: Vec<f64>,
}

impl Dataset {
    /// Zero-initialized buffer of exactly `shape.items() × width` values.
    pub fn allocate(name: &str, shape: BatchShape, width: usize) -> Self {
        Dataset {
            name: name.to_string(),
            shape,
            width,
            data: vec![0.0; shape.items() * width],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn task_size(&self) -> usize {
        self.shape.task_size
    }

    fn offset(&self, item: &DataItem) -> Result<usize> {
        if !self.shape.contains(item) {
            return Err(EngineError::InputContract(format!(
                "item {:?} outside batch {} of '{}'",
                item, self.shape, self.name
            )));
        }
        Ok(self.shape.index(item) * self.width)
    }

    /// Writes one item's fields. A width mismatch leaves the buffer untouched.
    pub fn write(&mut self, item: &DataItem, values: &[f64]) -> Result<()> {
        if values.len() != self.width {
            return Err(EngineError::shape(&self.name, self.width, values.len()));
        }
        let off = self.offset(item)?;
        self.data[off..off + self.width].copy_from_slice(values);
        Ok(())
    }

    /// Always exactly `width` values.
    pub fn read(&self, item: &DataItem) -> Result<&[f64]> {
        let off = self.offset(item)?;
        Ok(&self.data[off..off + self.width])
    }

    /// Replaces the whole buffer; `values` must cover every item.
    pub fn load(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.data.len() {
            return Err(EngineError::shape(&self.name, self.data.len(), values.len()));
        }
        self.data.copy_from_slice(values);
        Ok(())
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }
}
