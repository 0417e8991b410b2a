//! Fixed-size slab pool for relay copy loops.
//!
//! Every slab is exactly `slab_size` bytes. Returning anything shorter is
//! rejected, which catches callers that handed back a slice of the slab
//! instead of the slab itself.

use std::sync::Mutex;

pub const DEFAULT_SLAB_SIZE: usize = 32 * 1024;

/// Pool of reusable byte slabs.
pub struct BufferPool {
    slab_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(slab_size: usize) -> Self {
        Self {
            slab_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Take a slab from the pool, allocating if empty. The returned vector
    /// always has `len == capacity == slab_size`.
    pub fn get(&self) -> Vec<u8> {
        if let Some(buf) = self.free.lock().expect("pool lock poisoned").pop() {
            return buf;
        }
        vec![0u8; self.slab_size]
    }

    /// Return a slab. Slabs whose length no longer matches the slab size are
    /// discarded instead of being reused.
    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.slab_size || buf.capacity() < self.slab_size {
            return;
        }
        self.free.lock().expect("pool lock poisoned").push(buf);
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_SLAB_SIZE)
    }
}
