//! Offscreen targets shared by the render passes.

use crate::gpu::pass_plan::Target;

pub const AGENT_INFO_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
pub const GBUFFER_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba32Float;
pub const OCCLUSION_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

pub struct RenderTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

/// Every target except the caller's output, all at the same size.
pub struct RenderTargets {
    pub agent_info: RenderTarget,
    pub normal: RenderTarget,
    pub position: RenderTarget,
    pub gbuffer_depth: RenderTarget,
    pub ssao1: RenderTarget,
    pub ssao2: RenderTarget,
    pub ssao1_blurred: RenderTarget,
    pub ssao2_blurred: RenderTarget,
    pub blur_intermediate: RenderTarget,
    pub overlay_depth: RenderTarget,
    width: u32,
    height: u32,
}

impl RenderTargets {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let width = width.max(1);
        let height = height.max(1);
        let sampled = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        let make = |label: &str, format, usage| create_target(device, label, format, usage, width, height);

        Self {
            // Read back for hit testing
            agent_info: make(
                "Agent Info Target",
                AGENT_INFO_FORMAT,
                sampled | wgpu::TextureUsages::COPY_SRC,
            ),
            normal: make("Normal Target", GBUFFER_FORMAT, sampled),
            position: make("Position Target", GBUFFER_FORMAT, sampled),
            gbuffer_depth: make(
                "GBuffer Depth",
                DEPTH_FORMAT,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            ),
            ssao1: make("SSAO1 Target", OCCLUSION_FORMAT, sampled),
            ssao2: make("SSAO2 Target", OCCLUSION_FORMAT, sampled),
            ssao1_blurred: make("SSAO1 Blurred Target", OCCLUSION_FORMAT, sampled),
            ssao2_blurred: make("SSAO2 Blurred Target", OCCLUSION_FORMAT, sampled),
            blur_intermediate: make("Blur Intermediate Target", OCCLUSION_FORMAT, sampled),
            overlay_depth: make(
                "Overlay Depth",
                DEPTH_FORMAT,
                wgpu::TextureUsages::RENDER_ATTACHMENT,
            ),
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The target behind a plan slot. `Output` belongs to the caller.
    pub fn get(&self, target: Target) -> Option<&RenderTarget> {
        match target {
            Target::AgentInfo => Some(&self.agent_info),
            Target::Normal => Some(&self.normal),
            Target::Position => Some(&self.position),
            Target::GBufferDepth => Some(&self.gbuffer_depth),
            Target::Ssao1 => Some(&self.ssao1),
            Target::Ssao2 => Some(&self.ssao2),
            Target::Ssao1Blurred => Some(&self.ssao1_blurred),
            Target::Ssao2Blurred => Some(&self.ssao2_blurred),
            Target::BlurIntermediate => Some(&self.blur_intermediate),
            Target::OverlayDepth => Some(&self.overlay_depth),
            Target::Output => None,
        }
    }
}

fn create_target(
    device: &wgpu::Device,
    label: &str,
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
    width: u32,
    height: u32,
) -> RenderTarget {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    RenderTarget { texture, view }
}
