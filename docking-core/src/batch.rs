//! Logical launch shape of a batch: islands × individuals × tasks per individual.
//!
//! Backends only see this shape; how they split it into threads or blocks is
//! their own business.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of one item (one trajectory) inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DataItem {
    pub island: usize,
    pub individual: usize,
    pub task: usize,
}

impl DataItem {
    pub fn new(island: usize, individual: usize, task: usize) -> Self {
        DataItem { island, individual, task }
    }

    /// Item `task` 0 of a candidate; used by stages with one item per candidate.
    pub fn point(island: usize, individual: usize) -> Self {
        DataItem::new(island, individual, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchShape {
    pub islands: usize,
    pub individuals: usize,
    pub task_size: usize,
}

impl BatchShape {
    pub fn new(islands: usize, individuals: usize, task_size: usize) -> Self {
        BatchShape { islands, individuals, task_size }
    }

    /// Shape for a population laid out as `islands × individuals`, with
    /// `task_size` independent trajectories per candidate.
    pub fn from_population<T>(population: &[Vec<T>], task_size: usize) -> Self {
        let individuals = population.iter().map(Vec::len).max().unwrap_or(0);
        BatchShape::new(population.len(), individuals, task_size)
    }

    pub fn candidates(&self) -> usize {
        self.islands * self.individuals
    }

    /// Number of items (trajectories) in the batch.
    pub fn items(&self) -> usize {
        self.candidates() * self.task_size
    }

    pub fn is_empty(&self) -> bool {
        self.items() == 0
    }

    pub fn contains(&self, item: &DataItem) -> bool {
        item.island < self.islands && item.individual < self.individuals && item.task < self.task_size
    }

    /// Flat, item-major index of `item`. Caller checks `contains` first.
    pub fn index(&self, item: &DataItem) -> usize {
        (item.island * self.individuals + item.individual) * self.task_size + item.task
    }

    pub fn item_at(&self, index: usize) -> DataItem {
        let task = index % self.task_size;
        let candidate = index / self.task_size;
        DataItem::new(candidate / self.individuals, candidate % self.individuals, task)
    }

    pub fn iter(&self) -> impl Iterator<Item = DataItem> + '_ {
        (0..self.items()).map(move |i| self.item_at(i))
    }
}

impl fmt::Display for BatchShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{}×{}", self.islands, self.individuals, self.task_size)
    }
}
