// src/pool.rs
use crate::request::{Phase, RequestDescriptor};

/// Worker-local free list of request descriptors.
///
/// Descriptors are interchangeable once cleaned, so this is a plain
/// LIFO stack. Capacity is bounded: under a burst the pool absorbs up
/// to `capacity` descriptors and destroys the rest, so retained memory
/// never tracks the burst peak. Single-threaded by construction (one
/// pool per worker), no locking.
pub struct RequestPool {
    free: Vec<Box<RequestDescriptor>>,
    capacity: usize,
    hits: usize,
    misses: usize,
    rejected: usize,
}

impl RequestPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity.min(256)),
            capacity,
            hits: 0,
            misses: 0,
            rejected: 0,
        }
    }

    /// Pop a recycled descriptor, or construct one when the list is
    /// empty. The result is always in `Nothing` phase with empty
    /// buffers, ready to be armed.
    pub fn acquire(&mut self) -> Box<RequestDescriptor> {
        match self.free.pop() {
            Some(req) => {
                self.hits += 1;
                req
            }
            None => {
                self.misses += 1;
                Box::new(RequestDescriptor::new())
            }
        }
    }

    /// Return a descriptor for reuse. It must already be clean; a full
    /// pool destroys it instead of retaining it.
    pub fn recycle(&mut self, req: Box<RequestDescriptor>) {
        debug_assert_eq!(req.phase, Phase::Nothing);
        debug_assert!(req.header_in.is_empty());
        debug_assert!(req.handler.is_none());

        if self.free.len() < self.capacity {
            self.free.push(req);
        } else {
            self.rejected += 1;
            // dropped: bounded retention beats a perfect hit rate
        }
    }

    pub fn len(&self) -> usize {
        self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// (hits, misses, rejected)
    pub fn stats(&self) -> (usize, usize, usize) {
        (self.hits, self.misses, self.rejected)
    }
}
