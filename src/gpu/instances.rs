//! GPU mirrors of instance pools and shared geometry.

use wgpu::util::DeviceExt;

use crate::gpu::mesh::Vertex;
use crate::instance_pool::InstancedBufferPool;

/// Vertex buffer layouts for the three per-instance streams, slots 1 to 3.
pub fn instance_layouts() -> [wgpu::VertexBufferLayout<'static>; 3] {
    const TRANSFORM: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![2 => Float32x4];
    const ROTATION: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![3 => Float32x4];
    const IDENTITY: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![4 => Float32x2];

    [
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<[f32; 4]>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &TRANSFORM,
        },
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<[f32; 4]>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &ROTATION,
        },
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Instance,
            attributes: &IDENTITY,
        },
    ]
}

/// Device-side copy of one [`InstancedBufferPool`].
///
/// Buffers are sized to the pool's capacity and recreated only when the pool
/// reallocates. Between reallocations uploads write the used prefix in place.
pub struct GpuInstanceBuffers {
    transforms: wgpu::Buffer,
    rotations: wgpu::Buffer,
    identities: wgpu::Buffer,
    allocation: u64,
    count: u32,
}

impl GpuInstanceBuffers {
    pub fn new(device: &wgpu::Device, pool: &InstancedBufferPool) -> Self {
        let capacity = pool.capacity().max(1) as u64;
        let make = |suffix: &str, stride: u64| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("{} {}", pool.label(), suffix)),
                size: capacity * stride,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        Self {
            transforms: make("Transforms", 16),
            rotations: make("Rotations", 16),
            identities: make("Identities", 8),
            allocation: pool.allocation(),
            count: 0,
        }
    }

    /// Bring the mirror up to date. Returns true if anything was uploaded.
    pub fn sync(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, pool: &mut InstancedBufferPool) -> bool {
        if pool.allocation() != self.allocation {
            log::debug!("Reallocating GPU buffers for '{}' ({} instances)", pool.label(), pool.capacity());
            *self = Self::new(device, pool);
        }
        if !pool.take_dirty() {
            return false;
        }
        self.count = pool.used() as u32;
        if self.count > 0 {
            queue.write_buffer(&self.transforms, 0, bytemuck::cast_slice(pool.transforms()));
            queue.write_buffer(&self.rotations, 0, bytemuck::cast_slice(pool.rotations()));
            queue.write_buffer(&self.identities, 0, bytemuck::cast_slice(pool.identities()));
        }
        true
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn bind(&self, pass: &mut wgpu::RenderPass<'_>) {
        pass.set_vertex_buffer(1, self.transforms.slice(..));
        pass.set_vertex_buffer(2, self.rotations.slice(..));
        pass.set_vertex_buffer(3, self.identities.slice(..));
    }
}

/// Vertex and index buffers for a mesh drawn by instance.
pub struct GpuGeometry {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    num_indices: u32,
}

impl GpuGeometry {
    pub fn new(device: &wgpu::Device, label: &str, vertices: &[Vertex], indices: &[u32]) -> Self {
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{} Vertex Buffer", label)),
            contents: bytemuck::cast_slice(vertices),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(&format!("{} Index Buffer", label)),
            contents: bytemuck::cast_slice(indices),
            usage: wgpu::BufferUsages::INDEX,
        });
        Self {
            vertex_buffer,
            index_buffer,
            num_indices: indices.len() as u32,
        }
    }

    pub fn num_indices(&self) -> u32 {
        self.num_indices
    }

    pub fn bind(&self, pass: &mut wgpu::RenderPass<'_>) {
        pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
        pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
    }
}

/// A vertex/index pair that grows to fit each frame's contents.
pub struct DynamicBuffer {
    label: &'static str,
    usage: wgpu::BufferUsages,
    buffer: wgpu::Buffer,
    len: u64,
}

impl DynamicBuffer {
    pub fn new(device: &wgpu::Device, label: &'static str, usage: wgpu::BufferUsages) -> Self {
        let usage = usage | wgpu::BufferUsages::COPY_DST;
        Self {
            label,
            usage,
            buffer: Self::allocate(device, label, usage, 1024),
            len: 0,
        }
    }

    fn allocate(device: &wgpu::Device, label: &str, usage: wgpu::BufferUsages, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage,
            mapped_at_creation: false,
        })
    }

    /// Replace the contents, growing to the next power of two when needed.
    pub fn write(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, data: &[u8]) {
        let needed = data.len() as u64;
        if needed > self.buffer.size() {
            let size = needed.next_power_of_two();
            self.buffer = Self::allocate(device, self.label, self.usage, size);
        }
        // write_buffer requires a 4-byte multiple
        if needed > 0 && needed % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            queue.write_buffer(&self.buffer, 0, data);
        }
        self.len = needed;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The written prefix. Check [`is_empty`](Self::is_empty) first.
    pub fn slice(&self) -> wgpu::BufferSlice<'_> {
        self.buffer.slice(..self.len)
    }
}
