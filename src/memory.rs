//! Per-run arenas of the Flow VM.
//!
//! A Runner owns two arenas: a string arena for every byte buffer created
//! during one run (concatenation, substrings, conversions, regex groups, the
//! URL codec, native helpers) and an object arena for dynamically created
//! arrays.  Registers only ever borrow into these arenas or into the
//! program's constant pools; dropping the Runner releases everything at
//! once.  Growth is accounted against configurable limits so a runaway
//! handler exhausts its budget instead of the host's memory.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::FlowNumber;

/// Default byte budget per arena per run.
pub const DEFAULT_ARENA_LIMIT_BYTES: usize = 16 * 1024 * 1024;

/// Approximate per-object overhead charged on top of payload bytes.
const OBJECT_BASE_BYTES: usize = 32;

/// Caller-configurable arena budgets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ArenaLimits {
    pub string_bytes: usize,
    pub object_bytes: usize,
}

impl Default for ArenaLimits {
    fn default() -> Self {
        Self {
            string_bytes: DEFAULT_ARENA_LIMIT_BYTES,
            object_bytes: DEFAULT_ARENA_LIMIT_BYTES,
        }
    }
}

/// Usage snapshot surfaced for observability.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct ArenaMetrics {
    pub bytes_current: usize,
    pub bytes_peak: usize,
    pub allocations: usize,
}

impl ArenaMetrics {
    fn grow(&mut self, bytes: usize, limit: usize) -> Result<(), MemoryError> {
        let projected = self.bytes_current.saturating_add(bytes);
        if projected > limit {
            return Err(MemoryError::LimitExceeded {
                used: self.bytes_current,
                requested: bytes,
                limit,
            });
        }
        self.bytes_current = projected;
        self.bytes_peak = self.bytes_peak.max(projected);
        self.allocations += 1;
        Ok(())
    }
}

/// Arena owning every string created during one run.
///
/// Index 0 is always the empty string, so the VM has a per-run sentinel to
/// hand out without allocating.
#[derive(Debug)]
pub struct StringArena {
    buffers: Vec<Box<[u8]>>,
    limit: usize,
    metrics: ArenaMetrics,
}

impl StringArena {
    pub fn new(limit: usize) -> Self {
        Self {
            buffers: vec![Box::default()],
            limit,
            metrics: ArenaMetrics::default(),
        }
    }

    /// Index of the shared empty string.
    pub fn empty(&self) -> usize {
        0
    }

    pub fn alloc(&mut self, bytes: &[u8]) -> Result<usize, MemoryError> {
        self.metrics.grow(bytes.len() + OBJECT_BASE_BYTES, self.limit)?;
        self.buffers.push(bytes.into());
        Ok(self.buffers.len() - 1)
    }

    pub fn alloc_owned(&mut self, bytes: Vec<u8>) -> Result<usize, MemoryError> {
        self.metrics.grow(bytes.len() + OBJECT_BASE_BYTES, self.limit)?;
        self.buffers.push(bytes.into_boxed_slice());
        Ok(self.buffers.len() - 1)
    }

    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.buffers.get(index).map(|b| &b[..])
    }

    pub fn metrics(&self) -> ArenaMetrics {
        self.metrics
    }
}

/// Heap object held by the object arena: a homogeneous array.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayObject {
    Numbers(Vec<FlowNumber>),
    Strings(Vec<Box<[u8]>>),
}

impl ArrayObject {
    pub fn len(&self) -> usize {
        match self {
            ArrayObject::Numbers(items) => items.len(),
            ArrayObject::Strings(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Arena owning every array object created during one run.
#[derive(Debug)]
pub struct ObjectArena {
    objects: Vec<ArrayObject>,
    limit: usize,
    metrics: ArenaMetrics,
}

impl ObjectArena {
    pub fn new(limit: usize) -> Self {
        Self {
            objects: Vec::new(),
            limit,
            metrics: ArenaMetrics::default(),
        }
    }

    pub fn alloc_numbers(&mut self, len: usize) -> Result<usize, MemoryError> {
        self.metrics
            .grow(len * std::mem::size_of::<FlowNumber>() + OBJECT_BASE_BYTES, self.limit)?;
        self.objects.push(ArrayObject::Numbers(vec![0; len]));
        Ok(self.objects.len() - 1)
    }

    pub fn alloc_strings(&mut self, len: usize) -> Result<usize, MemoryError> {
        self.metrics
            .grow(len * std::mem::size_of::<Box<[u8]>>() + OBJECT_BASE_BYTES, self.limit)?;
        self.objects.push(ArrayObject::Strings(vec![Box::default(); len]));
        Ok(self.objects.len() - 1)
    }

    /// Charge for string payload copied into a string array slot.
    pub fn charge(&mut self, bytes: usize) -> Result<(), MemoryError> {
        self.metrics.grow(bytes, self.limit)
    }

    pub fn get(&self, index: usize) -> Option<&ArrayObject> {
        self.objects.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut ArrayObject> {
        self.objects.get_mut(index)
    }

    pub fn metrics(&self) -> ArenaMetrics {
        self.metrics
    }
}

/// Arena-level errors; the interpreter treats them as fatal for the run.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("arena limit exceeded: used {used} bytes, attempted {requested} additional bytes (limit {limit})")]
    LimitExceeded {
        used: usize,
        requested: usize,
        limit: usize,
    },
}
