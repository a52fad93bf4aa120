//! The task contract: a named group of structured buffers for one stage.
//!
//! Every slot a stage uses is declared up front with its per-item width.
//! Writes are checked against that width before anything is allocated or
//! touched, and outputs only become readable after a successful launch.

use std::collections::{HashMap, HashSet};

use crate::backend::Backend;
use crate::batch::{BatchShape, DataItem};
use crate::dataset::Dataset;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    /// Must be populated before `launch`.
    Input,
    /// Read when present, ignored otherwise.
    OptionalInput,
    /// Allocated by `prepare_outputs`, overwritten by `launch`.
    Output,
    /// Read and overwritten in place by `launch`.
    InOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSpec {
    pub name: &'static str,
    pub width: usize,
    pub role: SlotRole,
}

impl SlotSpec {
    pub const fn new(name: &'static str, width: usize, role: SlotRole) -> Self {
        SlotSpec { name, width, role }
    }

    fn is_output(&self) -> bool {
        matches!(self.role, SlotRole::Output | SlotRole::InOut)
    }
}

#[derive(Debug)]
pub struct Task {
    name: String,
    shape: BatchShape,
    backend: Backend,
    specs: Vec<SlotSpec>,
    datasets: HashMap<&'static str, Dataset>,
    produced: HashSet<&'static str>,
}

impl Task {
    pub fn new(name: &str, shape: BatchShape, backend: Backend, specs: Vec<SlotSpec>) -> Self {
        Task {
            name: name.to_string(),
            shape,
            backend,
            specs,
            datasets: HashMap::new(),
            produced: HashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn spec(&self, slot: &str) -> Result<SlotSpec> {
        self.specs
            .iter()
            .find(|s| s.name == slot)
            .copied()
            .ok_or_else(|| EngineError::missing(&self.name, slot))
    }

    pub fn width(&self, slot: &str) -> Result<usize> {
        self.spec(slot).map(|s| s.width)
    }

    fn dataset_entry(&mut self, spec: SlotSpec) -> &mut Dataset {
        let shape = self.shape;
        self.datasets
            .entry(spec.name)
            .or_insert_with(|| Dataset::allocate(spec.name, shape, spec.width))
    }

    /// Writes one item of an input slot, allocating the slot on first use.
    /// A written in/out slot stops counting as output until the next launch.
    pub fn set_inputs(&mut self, slot: &str, item: &DataItem, values: &[f64]) -> Result<()> {
        let spec = self.spec(slot)?;
        if values.len() != spec.width {
            return Err(EngineError::shape(spec.name, spec.width, values.len()));
        }
        if !self.shape.contains(item) {
            return Err(EngineError::InputContract(format!(
                "item {:?} outside batch {} of stage '{}'",
                item, self.shape, self.name
            )));
        }
        self.dataset_entry(spec).write(item, values)?;
        self.produced.remove(spec.name);
        Ok(())
    }

    /// Replaces a whole input slot at once (item-major, `items × width` values).
    pub fn load_inputs(&mut self, slot: &str, values: &[f64]) -> Result<()> {
        let spec = self.spec(slot)?;
        let expected = self.shape.items() * spec.width;
        if values.len() != expected {
            return Err(EngineError::shape(spec.name, expected, values.len()));
        }
        self.dataset_entry(spec).load(values)?;
        self.produced.remove(spec.name);
        Ok(())
    }

    /// Allocates (or keeps) the buffer of an output slot, sized to the batch.
    pub fn prepare_dataset(&mut self, slot: &str) -> Result<()> {
        let spec = self.spec(slot)?;
        self.dataset_entry(spec);
        Ok(())
    }

    /// Reads one item of a slot produced by the last successful launch.
    pub fn get_outputs(&self, slot: &str, item: &DataItem) -> Result<&[f64]> {
        self.outputs(slot)?.read(item)
    }

    /// The whole buffer of a slot produced by the last successful launch.
    pub fn outputs(&self, slot: &str) -> Result<&Dataset> {
        if !self.produced.contains(slot) {
            return Err(EngineError::missing(&self.name, slot));
        }
        self.datasets
            .get(slot)
            .ok_or_else(|| EngineError::missing(&self.name, slot))
    }

    pub fn dataset(&self, slot: &str) -> Option<&Dataset> {
        self.datasets.get(slot)
    }

    pub fn has_dataset(&self, slot: &str) -> bool {
        self.datasets.contains_key(slot)
    }

    /// A buffer the launch cannot run without.
    pub fn require(&self, slot: &str) -> Result<&Dataset> {
        self.datasets.get(slot).ok_or_else(|| {
            tracing::error!(stage = %self.name, slot, "could not find dataset");
            EngineError::missing(&self.name, slot)
        })
    }

    /// Checks every required slot at once, logging each missing one.
    pub fn require_all(&self) -> Result<()> {
        let missing: Vec<&'static str> = self
            .specs
            .iter()
            .filter(|s| s.role != SlotRole::OptionalInput && !self.datasets.contains_key(s.name))
            .map(|s| s.name)
            .collect();
        for slot in &missing {
            tracing::error!(stage = %self.name, slot = *slot, "could not find dataset");
        }
        match missing.first() {
            Some(slot) => Err(EngineError::missing(&self.name, slot)),
            None => Ok(()),
        }
    }

    /// Moves a buffer out so a launch can write it while reading the others.
    pub fn take(&mut self, slot: &str) -> Result<Dataset> {
        let spec = self.spec(slot)?;
        self.datasets.remove(spec.name).ok_or_else(|| {
            tracing::error!(stage = %self.name, slot, "could not find dataset");
            EngineError::missing(&self.name, slot)
        })
    }

    pub fn restore(&mut self, dataset: Dataset) -> Result<()> {
        let spec = self.spec(dataset.name())?;
        if dataset.shape() != self.shape || dataset.width() != spec.width {
            return Err(EngineError::shape(spec.name, spec.width, dataset.width()));
        }
        self.datasets.insert(spec.name, dataset);
        Ok(())
    }

    /// Starts a launch: nothing counts as produced until it succeeds.
    pub fn begin_launch(&mut self) {
        self.produced.clear();
    }

    pub fn finish_launch(&mut self) {
        self.produced = self
            .specs
            .iter()
            .filter(|s| s.is_output())
            .map(|s| s.name)
            .collect();
    }

    /// Drops every buffer and adopts `shape`. Buffers are re-created at the
    /// new size on the next write or `prepare_outputs`.
    pub fn reshape(&mut self, shape: BatchShape) {
        if shape != self.shape {
            tracing::debug!(stage = %self.name, from = %self.shape, to = %shape, "reallocating buffers");
        }
        self.shape = shape;
        self.datasets.clear();
        self.produced.clear();
    }
}

/// One computational stage over the whole batch.
pub trait Stage {
    fn task(&self) -> &Task;

    fn task_mut(&mut self) -> &mut Task;

    /// Allocates the stage's output buffers; required before the first launch.
    fn prepare_outputs(&mut self) -> Result<()>;

    /// Runs the stage for every item. On error no output is readable.
    fn launch(&mut self) -> Result<()>;

    fn name(&self) -> &str {
        self.task().name()
    }

    fn set_inputs(&mut self, slot: &str, item: &DataItem, values: &[f64]) -> Result<()> {
        self.task_mut().set_inputs(slot, item, values)
    }

    fn get_outputs(&self, slot: &str, item: &DataItem) -> Result<&[f64]> {
        self.task().get_outputs(slot, item)
    }

    fn reshape(&mut self, shape: BatchShape) {
        self.task_mut().reshape(shape)
    }
}
