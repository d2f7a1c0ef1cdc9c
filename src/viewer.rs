//! Headless viewer: scene engine, render pipeline and camera in one place.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent::{AgentRecord, InstanceId};
use crate::asset_queue::AssetProvider;
use crate::camera::Camera;
use crate::config::{RenderStyle, ViewerConfig};
use crate::engine::SceneEngine;
use crate::error::PipelineError;
use crate::gpu::renderer::RenderPipeline;
use crate::scene_manager::ReconcileStats;

pub const OUTPUT_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// Request a device without a surface.
pub async fn request_headless_device() -> Result<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
        .ok_or_else(|| anyhow::anyhow!("No adapter found"))?;

    log::info!("Using adapter {:?}", adapter.get_info().name);
    let (device, queue) = adapter
        .request_device(&wgpu::DeviceDescriptor::default(), None)
        .await
        .context("Failed to create device")?;
    Ok((device, queue))
}

struct OutputTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl OutputTexture {
    fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Viewer Output Texture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OUTPUT_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self { texture, view }
    }
}

pub struct Viewer {
    engine: SceneEngine,
    renderer: RenderPipeline,
    camera: Camera,
    output: OutputTexture,
}

impl Viewer {
    pub async fn headless(
        config: ViewerConfig,
        provider: Arc<dyn AssetProvider>,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let (device, queue) = request_headless_device().await?;
        let width = width.max(1);
        let height = height.max(1);
        let camera = Camera::framing_bounds(config.volume_bounds);
        let renderer = RenderPipeline::new(device, queue, OUTPUT_FORMAT, width, height, config.render.clone())
            .context("Failed to build render pipeline")?;
        let engine = SceneEngine::new(config, provider)?;
        let output = OutputTexture::new(renderer.device(), width, height);
        Ok(Self {
            engine,
            renderer,
            camera,
            output,
        })
    }

    pub fn engine(&self) -> &SceneEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut SceneEngine {
        &mut self.engine
    }

    pub fn renderer(&self) -> &RenderPipeline {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut RenderPipeline {
        &mut self.renderer
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn apply_frame(&mut self, records: &[AgentRecord]) -> ReconcileStats {
        self.engine.apply_frame(records)
    }

    /// Install finished assets and ease the camera toward the followed agent.
    pub fn tick(&mut self) -> bool {
        let changed = self.engine.tick();
        let moving = match self.engine.manager().followed_position() {
            Some(position) => self.camera.animate_follow(position),
            None => false,
        };
        changed || moving
    }

    pub fn render(&mut self) {
        self.engine.set_view_position(self.camera.position);
        self.renderer.render(&self.output.view, &mut self.engine, &self.camera);
    }

    /// Instance under pixel `(x, y)`.
    ///
    /// The instanced style reads the identity target of the last rendered
    /// frame; the generic style casts a ray against agent bounding spheres.
    pub fn hit_test(&self, x: u32, y: u32) -> Result<Option<InstanceId>, PipelineError> {
        match self.engine.style() {
            RenderStyle::Instanced => self.renderer.hit_test(x, y),
            RenderStyle::Generic => {
                let (width, height) = self.renderer.size();
                if x >= width || y >= height {
                    return Err(PipelineError::OutOfBounds { x, y, width, height });
                }
                Ok(self
                    .engine
                    .pick_with_ray(&self.camera, x as f32, y as f32, width, height))
            }
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.renderer.resize(width, height);
        let (width, height) = self.renderer.size();
        self.output = OutputTexture::new(self.renderer.device(), width, height);
    }

    pub fn reset_for_new_trajectory(&mut self) {
        self.engine.reset_for_new_trajectory();
        self.renderer.clear_geometry_cache();
    }

    /// Copy the last rendered frame to tightly packed RGBA8 rows.
    pub fn read_output_rgba(&self) -> Result<Vec<u8>, PipelineError> {
        let device = self.renderer.device();
        let queue = self.renderer.queue();
        let (width, height) = self.renderer.size();

        let unpadded_bytes_per_row = 4 * width;
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(align) * align;

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Viewer Output Buffer"),
            size: (padded_bytes_per_row * height) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Viewer Output Copy"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &self.output.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        queue.submit(Some(encoder.finish()));

        let slice = buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |v| {
            let _ = tx.send(v);
        });
        device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| PipelineError::Readback(e.to_string()))?
            .map_err(|e| PipelineError::Readback(e.to_string()))?;

        let mut pixels = Vec::with_capacity((unpadded_bytes_per_row * height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in 0..height {
                let start = (row * padded_bytes_per_row) as usize;
                pixels.extend_from_slice(&data[start..start + unpadded_bytes_per_row as usize]);
            }
        }
        buffer.unmap();
        Ok(pixels)
    }
}
