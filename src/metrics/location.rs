//! Rolling window of one call-site.
//!
//! This module keeps the most recent points of a call-site in FIFO order,
//! evicting the oldest point once the window is full.

use crate::core::{CallStack, MemoryUsage};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Bounded history of one call-site's counters.
#[derive(Debug, Clone)]
pub struct LocationData {
    call_stack: CallStack,
    capacity: usize,
    timestamps: VecDeque<DateTime<Utc>>,
    usage: VecDeque<MemoryUsage>,
}

impl LocationData {
    /// Create an empty window holding at most `capacity` points
    pub fn new(call_stack: CallStack, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            call_stack,
            capacity,
            timestamps: VecDeque::with_capacity(capacity),
            usage: VecDeque::with_capacity(capacity),
        }
    }

    /// Append a point, dropping the oldest one when full
    pub fn push(&mut self, observed_at: DateTime<Utc>, usage: MemoryUsage) {
        if self.timestamps.len() == self.capacity {
            self.timestamps.pop_front();
            self.usage.pop_front();
        }
        self.timestamps.push_back(observed_at);
        self.usage.push_back(usage);
    }

    pub fn call_stack(&self) -> &CallStack {
        &self.call_stack
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Points in insertion order, oldest first
    pub fn points(&self) -> impl Iterator<Item = (DateTime<Utc>, &MemoryUsage)> {
        self.timestamps.iter().copied().zip(self.usage.iter())
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        self.timestamps.iter().copied()
    }

    pub fn usage(&self) -> impl Iterator<Item = &MemoryUsage> {
        self.usage.iter()
    }
}
