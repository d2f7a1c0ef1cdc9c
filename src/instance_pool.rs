//! Growable per-instance attribute storage.
//!
//! Each pool holds three parallel arrays that map one-to-one onto instance
//! vertex buffers:
//!
//! - transform: `[x, y, z, scale]`
//! - rotation: quaternion `[x, y, z, w]`
//! - identity: `[instance_id, signed_type_color]`
//!
//! Capacity grows in whole chunks and never shrinks, so an oscillating agent
//! count does not reallocate GPU buffers every frame. Instance order carries
//! no meaning; each frame is a linear append from zero.

use glam::{Quat, Vec3};

use crate::agent::InstanceId;

#[derive(Debug, Clone)]
pub struct InstancedBufferPool {
    label: String,
    chunk_size: usize,
    capacity: usize,
    used: usize,
    transforms: Vec<[f32; 4]>,
    rotations: Vec<[f32; 4]>,
    identities: Vec<[f32; 2]>,
    dirty: bool,
    /// Bumped whenever `capacity` changes so GPU mirrors know to reallocate.
    allocation: u64,
}

impl InstancedBufferPool {
    pub fn new(label: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            label: label.into(),
            chunk_size: chunk_size.max(1),
            capacity: 0,
            used: 0,
            transforms: Vec::new(),
            rotations: Vec::new(),
            identities: Vec::new(),
            dirty: false,
            allocation: 0,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn allocation(&self) -> u64 {
        self.allocation
    }

    /// Start a frame expecting about `expected` instances.
    pub fn begin_frame(&mut self, expected: usize) {
        self.ensure_capacity(expected);
        self.used = 0;
    }

    /// Append one instance at the write cursor, growing by a chunk if full.
    pub fn add_instance(&mut self, transform: [f32; 4], rotation: [f32; 4], identity: [f32; 2]) {
        if self.used == self.capacity {
            self.ensure_capacity(self.used + 1);
        }
        let i = self.used;
        self.transforms[i] = transform;
        self.rotations[i] = rotation;
        self.identities[i] = identity;
        self.used += 1;
    }

    /// Convenience wrapper over [`add_instance`](Self::add_instance).
    pub fn push(
        &mut self,
        position: Vec3,
        scale: f32,
        rotation: Quat,
        instance_id: InstanceId,
        type_color: f32,
    ) {
        self.add_instance(
            [position.x, position.y, position.z, scale],
            rotation.to_array(),
            [instance_id as f32, type_color],
        );
    }

    /// Publish this frame's instances for upload.
    pub fn end_frame(&mut self) {
        self.dirty = true;
    }

    /// Returns whether there is unuploaded data and clears the flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn transforms(&self) -> &[[f32; 4]] {
        &self.transforms[..self.used]
    }

    pub fn rotations(&self) -> &[[f32; 4]] {
        &self.rotations[..self.used]
    }

    pub fn identities(&self) -> &[[f32; 2]] {
        &self.identities[..self.used]
    }

    /// Grow to the next chunk multiple at or above `required`, keeping existing data.
    fn ensure_capacity(&mut self, required: usize) {
        if required <= self.capacity {
            return;
        }
        let new_capacity = required.div_ceil(self.chunk_size) * self.chunk_size;
        log::debug!(
            "Growing instance pool '{}' from {} to {}",
            self.label,
            self.capacity,
            new_capacity
        );
        // Vec::resize keeps the prefix, which is the forward copy
        self.transforms.resize(new_capacity, [0.0; 4]);
        self.rotations.resize(new_capacity, [0.0, 0.0, 0.0, 1.0]);
        self.identities.resize(new_capacity, [-1.0, 0.0]);
        self.capacity = new_capacity;
        self.allocation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_frame_rounds_to_chunk() {
        let mut pool = InstancedBufferPool::new("test", 256);
        pool.begin_frame(1);
        assert_eq!(pool.capacity(), 256);
        pool.begin_frame(257);
        assert_eq!(pool.capacity(), 512);
        pool.begin_frame(512);
        assert_eq!(pool.capacity(), 512);
    }

    #[test]
    fn test_capacity_never_shrinks() {
        let mut pool = InstancedBufferPool::new("test", 100);
        let mut max_seen = 0;
        let mut last_capacity = 0;
        for k in [5, 950, 3, 0, 1200, 40, 1201, 7] {
            pool.begin_frame(k);
            max_seen = max_seen.max(k);
            assert!(pool.capacity() >= last_capacity);
            assert!(pool.capacity() >= max_seen);
            last_capacity = pool.capacity();
        }
        assert_eq!(pool.capacity(), 1300);
    }

    #[test]
    fn test_add_beyond_expected_grows_and_keeps_data() {
        let mut pool = InstancedBufferPool::new("test", 4);
        pool.begin_frame(2);
        for i in 0..6 {
            pool.push(Vec3::new(i as f32, 0.0, 0.0), 1.0, Quat::IDENTITY, i, 1.0);
        }
        pool.end_frame();
        assert_eq!(pool.used(), 6);
        assert_eq!(pool.capacity(), 8);
        assert!(pool.used() <= pool.capacity());
        assert_eq!(pool.transforms()[0], [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(pool.transforms()[5], [5.0, 0.0, 0.0, 1.0]);
        assert_eq!(pool.identities()[3], [3.0, 1.0]);
    }

    #[test]
    fn test_begin_frame_resets_cursor_and_dirty_flag() {
        let mut pool = InstancedBufferPool::new("test", 8);
        pool.begin_frame(3);
        pool.add_instance([1.0; 4], [0.0, 0.0, 0.0, 1.0], [9.0, -2.0]);
        assert!(!pool.take_dirty());
        pool.end_frame();
        assert!(pool.take_dirty());
        assert!(!pool.take_dirty());

        pool.begin_frame(3);
        assert_eq!(pool.used(), 0);
        assert!(pool.transforms().is_empty());
    }

    #[test]
    fn test_allocation_counter_tracks_growth() {
        let mut pool = InstancedBufferPool::new("test", 16);
        pool.begin_frame(10);
        let a = pool.allocation();
        pool.begin_frame(12);
        assert_eq!(pool.allocation(), a);
        pool.begin_frame(17);
        assert_eq!(pool.allocation(), a + 1);
    }
}
