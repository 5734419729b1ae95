//! Moving Average Smoothing

use crate::error::ValidationError;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use tracing::trace;

/// Default number of samples averaged per PID
pub const DEFAULT_WINDOW: usize = 8;

/// Fixed-capacity moving average; the oldest sample is evicted when full
#[derive(Debug, Clone)]
pub struct SmoothingBuffer {
    window: VecDeque<f64>,
    capacity: usize,
}

impl SmoothingBuffer {
    /// Create a buffer averaging the last `capacity` samples
    pub fn new(capacity: usize) -> Result<Self, ValidationError> {
        if capacity == 0 {
            return Err(ValidationError::InvalidCapacity(capacity));
        }
        Ok(Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Add a sample and return the mean of the window after insertion
    pub fn push(&mut self, value: f64) -> f64 {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.mean().unwrap_or(value)
    }

    /// Mean of the current window
    pub fn mean(&self) -> Option<f64> {
        if self.window.is_empty() {
            return None;
        }
        Some(self.window.iter().sum::<f64>() / self.window.len() as f64)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.window.len() == self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.window.clear();
    }
}

/// One buffer per key, created on the first sample
#[derive(Debug, Clone)]
pub struct SmoothingSet<K> {
    capacity: usize,
    buffers: HashMap<K, SmoothingBuffer>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> SmoothingSet<K> {
    pub fn new(capacity: usize) -> Result<Self, ValidationError> {
        // rejects a zero capacity
        SmoothingBuffer::new(capacity)?;
        Ok(Self {
            capacity,
            buffers: HashMap::new(),
        })
    }

    /// Push a sample for `key` and return its smoothed value
    pub fn push(&mut self, key: &K, value: f64) -> f64 {
        let capacity = self.capacity;
        let buffer = self.buffers.entry(key.clone()).or_insert_with(|| {
            trace!("Creating smoothing window for {:?}", key);
            SmoothingBuffer {
                window: VecDeque::with_capacity(capacity),
                capacity,
            }
        });
        buffer.push(value)
    }

    pub fn get(&self, key: &K) -> Option<&SmoothingBuffer> {
        self.buffers.get(key)
    }

    /// Drop the window of a deselected key
    pub fn remove(&mut self, key: &K) -> Option<SmoothingBuffer> {
        self.buffers.remove(key)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
