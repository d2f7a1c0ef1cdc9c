//! Multi-pass agent renderer.
//!
//! Executes a [`PassPlan`] each frame: identity gbuffer, two ambient
//! occlusion radii with depth-aware separable blur, palette composite,
//! contour, then path and bounding-box overlays. Hit testing reads back one
//! pixel of the agent info target written by the last frame.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use wgpu::util::DeviceExt;

use crate::agent::InstanceId;
use crate::camera::Camera;
use crate::config::{RenderParams, RenderStyle};
use crate::engine::SceneEngine;
use crate::error::PipelineError;
use crate::gpu::fiber::{FiberBatch, TUBE_SIDES};
use crate::gpu::instances::{DynamicBuffer, GpuGeometry, GpuInstanceBuffers};
use crate::gpu::mesh::{self, LineVertex};
use crate::gpu::pass_plan::{BlurAxis, Occlusion, PassKind, PassPlan};
use crate::gpu::picking::{decode_identity_pixel, IdentityReadback, AGENT_INFO_CLEAR};
use crate::gpu::pipeline::{self, QUAD_VERTICES};
use crate::gpu::targets::{RenderTargets, DEPTH_FORMAT, OCCLUSION_FORMAT};
use crate::render_agent::GeometryKey;

/// Samples per occlusion evaluation. Must match `KERNEL_SIZE` in the shader.
pub const SSAO_KERNEL_SIZE: usize = 64;

/// Sphere tessellation shared by sphere agents, atoms and fiber endcaps.
const SPHERE_LAT_SEGMENTS: u32 = 16;
const SPHERE_LON_SEGMENTS: u32 = 24;

/// How strongly the followed agent is tinted toward the follow color.
const FOLLOW_TINT: f32 = 0.2;

const BOUNDS_COLOR: [f32; 3] = [0.4, 0.4, 0.4];

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct CameraUniforms {
    view: [[f32; 4]; 4],
    proj: [[f32; 4]; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct SsaoUniforms {
    proj: [[f32; 4]; 4],
    samples: [[f32; 4]; SSAO_KERNEL_SIZE],
    params: [f32; 4],
    size: [f32; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct BlurUniforms {
    direction_and_radius: [f32; 4], // xy = direction, z = radius, w = depth cutoff
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct CompositeUniforms {
    background: [f32; 4],
    follow_color: [f32; 4],
    params: [f32; 4], // x = followed instance
    palette: [[f32; 4]; 256],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct ContourUniforms {
    outline: [f32; 4],
    follow: [f32; 4],
    params: [f32; 4], // x = outline thickness, y = follow thickness, z = followed instance
}

/// Hemisphere sample kernel, denser toward the center.
///
/// Deterministic so that identical frames shade identically.
pub fn ssao_kernel() -> [[f32; 4]; SSAO_KERNEL_SIZE] {
    let mut kernel = [[0.0; 4]; SSAO_KERNEL_SIZE];
    let n = SSAO_KERNEL_SIZE as f32;
    for (i, sample) in kernel.iter_mut().enumerate() {
        // Hammersley point mapped onto the +z hemisphere
        let u = (i as f32 + 0.5) / n;
        let v = (i as u32).reverse_bits() as f32 / 4_294_967_296.0;
        let phi = std::f32::consts::TAU * v;
        let cos_theta = 1.0 - u;
        let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
        let t = i as f32 / n;
        let scale = 0.1 + 0.9 * t * t;
        *sample = [
            phi.cos() * sin_theta * scale,
            phi.sin() * sin_theta * scale,
            cos_theta * scale,
            0.0,
        ];
    }
    kernel
}

fn occlusion_slot(o: Occlusion) -> usize {
    match o {
        Occlusion::Near => 0,
        Occlusion::Far => 1,
    }
}

fn blur_slot(o: Occlusion, axis: BlurAxis) -> usize {
    occlusion_slot(o) * 2
        + match axis {
            BlurAxis::Horizontal => 0,
            BlurAxis::Vertical => 1,
        }
}

fn uniform_buffer(device: &wgpu::Device, label: &str, size: usize) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: size as u64,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn bind_uniform_and_textures(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    uniform: &wgpu::Buffer,
    views: &[&wgpu::TextureView],
) -> wgpu::BindGroup {
    let mut entries = vec![wgpu::BindGroupEntry {
        binding: 0,
        resource: uniform.as_entire_binding(),
    }];
    entries.extend(views.iter().enumerate().map(|(i, view)| wgpu::BindGroupEntry {
        binding: i as u32 + 1,
        resource: wgpu::BindingResource::TextureView(view),
    }));
    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &entries,
    })
}

fn color_attachment(view: &wgpu::TextureView, load: wgpu::LoadOp<wgpu::Color>) -> Option<wgpu::RenderPassColorAttachment<'_>> {
    Some(wgpu::RenderPassColorAttachment {
        view,
        resolve_target: None,
        ops: wgpu::Operations {
            load,
            store: wgpu::StoreOp::Store,
        },
    })
}

fn depth_attachment(view: &wgpu::TextureView, load: wgpu::LoadOp<f32>) -> Option<wgpu::RenderPassDepthStencilAttachment<'_>> {
    Some(wgpu::RenderPassDepthStencilAttachment {
        view,
        depth_ops: Some(wgpu::Operations {
            load,
            store: wgpu::StoreOp::Store,
        }),
        stencil_ops: None,
    })
}

struct PassLayouts {
    ssao: wgpu::BindGroupLayout,
    blur: wgpu::BindGroupLayout,
    composite: wgpu::BindGroupLayout,
    contour: wgpu::BindGroupLayout,
}

struct PassUniforms {
    ssao: [wgpu::Buffer; 2],
    blur: [wgpu::Buffer; 4],
    composite: wgpu::Buffer,
    contour: wgpu::Buffer,
}

/// Bind groups that reference the size-dependent targets.
struct PassBindGroups {
    ssao: [wgpu::BindGroup; 2],
    blur: [wgpu::BindGroup; 4],
    composite: wgpu::BindGroup,
    contour: wgpu::BindGroup,
}

impl PassBindGroups {
    fn new(device: &wgpu::Device, layouts: &PassLayouts, uniforms: &PassUniforms, t: &RenderTargets) -> Self {
        let ssao = |o: Occlusion, label| {
            bind_uniform_and_textures(
                device,
                label,
                &layouts.ssao,
                &uniforms.ssao[occlusion_slot(o)],
                &[&t.normal.view, &t.position.view],
            )
        };
        let blur = |o: Occlusion, axis: BlurAxis, source: &wgpu::TextureView, label| {
            bind_uniform_and_textures(
                device,
                label,
                &layouts.blur,
                &uniforms.blur[blur_slot(o, axis)],
                &[source, &t.position.view],
            )
        };

        Self {
            ssao: [
                ssao(Occlusion::Near, "SSAO1 Bind Group"),
                ssao(Occlusion::Far, "SSAO2 Bind Group"),
            ],
            blur: [
                blur(Occlusion::Near, BlurAxis::Horizontal, &t.ssao1.view, "Blur1 H Bind Group"),
                blur(Occlusion::Near, BlurAxis::Vertical, &t.blur_intermediate.view, "Blur1 V Bind Group"),
                blur(Occlusion::Far, BlurAxis::Horizontal, &t.ssao2.view, "Blur2 H Bind Group"),
                blur(Occlusion::Far, BlurAxis::Vertical, &t.blur_intermediate.view, "Blur2 V Bind Group"),
            ],
            composite: bind_uniform_and_textures(
                device,
                "Composite Bind Group",
                &layouts.composite,
                &uniforms.composite,
                &[&t.agent_info.view, &t.ssao1_blurred.view, &t.ssao2_blurred.view],
            ),
            contour: bind_uniform_and_textures(
                device,
                "Contour Bind Group",
                &layouts.contour,
                &uniforms.contour,
                &[&t.blur_intermediate.view, &t.agent_info.view],
            ),
        }
    }
}

pub struct RenderPipeline {
    device: wgpu::Device,
    queue: wgpu::Queue,
    format: wgpu::TextureFormat,
    targets: RenderTargets,
    params: RenderParams,

    camera_buffer: wgpu::Buffer,
    camera_bind_group: wgpu::BindGroup,

    gbuffer_pipeline: wgpu::RenderPipeline,
    ssao_pipeline: wgpu::RenderPipeline,
    blur_pipeline: wgpu::RenderPipeline,
    composite_pipeline: wgpu::RenderPipeline,
    contour_pipeline: wgpu::RenderPipeline,
    line_pipeline: wgpu::RenderPipeline,

    layouts: PassLayouts,
    uniforms: PassUniforms,
    bind_groups: PassBindGroups,
    quad_vertex_buffer: wgpu::Buffer,
    ssao_kernel: [[f32; 4]; SSAO_KERNEL_SIZE],

    // Geometry and per-frame instance mirrors
    sphere: GpuGeometry,
    meshes: HashMap<String, GpuGeometry>,
    mesh_instances: HashMap<GeometryKey, GpuInstanceBuffers>,
    endcap_instances: Option<GpuInstanceBuffers>,
    fiber_instances: Option<GpuInstanceBuffers>,
    fiber_batch: FiberBatch,
    fiber_vertices: DynamicBuffer,
    fiber_indices: DynamicBuffer,
    line_vertices: DynamicBuffer,
    line_count: u32,
    show_bounds: bool,

    instanced_plan: PassPlan,
    generic_plan: PassPlan,
    readback: IdentityReadback,
}

impl RenderPipeline {
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        params: RenderParams,
    ) -> Result<Self, PipelineError> {
        let instanced_plan = PassPlan::for_style(RenderStyle::Instanced);
        let generic_plan = PassPlan::for_style(RenderStyle::Generic);
        instanced_plan.validate()?;
        generic_plan.validate()?;

        let targets = RenderTargets::new(&device, width, height);

        // === Camera ===

        let camera_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Camera Layout"),
            entries: &[pipeline::uniform_entry(
                0,
                wgpu::ShaderStages::VERTEX_FRAGMENT,
            )],
        });
        let camera_buffer = uniform_buffer(
            &device,
            "Camera Uniform Buffer",
            std::mem::size_of::<CameraUniforms>(),
        );
        let camera_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Camera Bind Group"),
            layout: &camera_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: camera_buffer.as_entire_binding(),
            }],
        });

        // === Pipelines ===

        let layouts = PassLayouts {
            ssao: pipeline::create_fullscreen_layout(&device, "SSAO Layout", 2),
            blur: pipeline::create_fullscreen_layout(&device, "Blur Layout", 2),
            composite: pipeline::create_fullscreen_layout(&device, "Composite Layout", 3),
            contour: pipeline::create_fullscreen_layout(&device, "Contour Layout", 2),
        };

        let gbuffer_pipeline = pipeline::create_gbuffer_pipeline(&device, &camera_layout);
        let ssao_pipeline = pipeline::create_fullscreen_pipeline(
            &device,
            "SSAO",
            include_str!("shader_ssao.wgsl"),
            &layouts.ssao,
            OCCLUSION_FORMAT,
            None,
        );
        let blur_pipeline = pipeline::create_fullscreen_pipeline(
            &device,
            "Blur",
            include_str!("shader_blur.wgsl"),
            &layouts.blur,
            OCCLUSION_FORMAT,
            None,
        );
        let composite_pipeline = pipeline::create_fullscreen_pipeline(
            &device,
            "Composite",
            include_str!("shader_composite.wgsl"),
            &layouts.composite,
            OCCLUSION_FORMAT,
            None,
        );
        // Contour always writes depth so the overlay can test against the scene
        let contour_pipeline = pipeline::create_fullscreen_pipeline(
            &device,
            "Contour",
            include_str!("shader_contour.wgsl"),
            &layouts.contour,
            format,
            Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: wgpu::CompareFunction::Always,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
        );
        let line_pipeline = pipeline::create_overlay_line_pipeline(&device, &camera_layout, format);

        // === Uniforms ===

        let uniforms = PassUniforms {
            ssao: [
                uniform_buffer(&device, "SSAO1 Uniform Buffer", std::mem::size_of::<SsaoUniforms>()),
                uniform_buffer(&device, "SSAO2 Uniform Buffer", std::mem::size_of::<SsaoUniforms>()),
            ],
            // One buffer per blur pass; a shared buffer would only hold the last write
            blur: [
                uniform_buffer(&device, "Blur1 H Uniform Buffer", std::mem::size_of::<BlurUniforms>()),
                uniform_buffer(&device, "Blur1 V Uniform Buffer", std::mem::size_of::<BlurUniforms>()),
                uniform_buffer(&device, "Blur2 H Uniform Buffer", std::mem::size_of::<BlurUniforms>()),
                uniform_buffer(&device, "Blur2 V Uniform Buffer", std::mem::size_of::<BlurUniforms>()),
            ],
            composite: uniform_buffer(
                &device,
                "Composite Uniform Buffer",
                std::mem::size_of::<CompositeUniforms>(),
            ),
            contour: uniform_buffer(
                &device,
                "Contour Uniform Buffer",
                std::mem::size_of::<ContourUniforms>(),
            ),
        };
        let bind_groups = PassBindGroups::new(&device, &layouts, &uniforms, &targets);

        let quad_vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Fullscreen Quad Buffer"),
            contents: bytemuck::cast_slice(QUAD_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let (sphere_vertices, sphere_indices) =
            mesh::create_sphere_geometry(SPHERE_LAT_SEGMENTS, SPHERE_LON_SEGMENTS);
        let sphere = GpuGeometry::new(&device, "Sphere", &sphere_vertices, &sphere_indices);

        let fiber_vertices = DynamicBuffer::new(&device, "Fiber Vertex Buffer", wgpu::BufferUsages::VERTEX);
        let fiber_indices = DynamicBuffer::new(&device, "Fiber Index Buffer", wgpu::BufferUsages::INDEX);
        let line_vertices = DynamicBuffer::new(&device, "Overlay Line Buffer", wgpu::BufferUsages::VERTEX);
        let readback = IdentityReadback::new(&device);

        log::info!(
            "Render pipeline ready at {}x{} ({:?})",
            targets.width(),
            targets.height(),
            format
        );

        let renderer = Self {
            device,
            queue,
            format,
            targets,
            params,
            camera_buffer,
            camera_bind_group,
            gbuffer_pipeline,
            ssao_pipeline,
            blur_pipeline,
            composite_pipeline,
            contour_pipeline,
            line_pipeline,
            layouts,
            uniforms,
            bind_groups,
            quad_vertex_buffer,
            ssao_kernel: ssao_kernel(),
            sphere,
            meshes: HashMap::new(),
            mesh_instances: HashMap::new(),
            endcap_instances: None,
            fiber_instances: None,
            fiber_batch: FiberBatch::default(),
            fiber_vertices,
            fiber_indices,
            line_vertices,
            line_count: 0,
            show_bounds: true,
            instanced_plan,
            generic_plan,
            readback,
        };
        renderer.write_blur_uniforms();
        renderer.clear_agent_info();
        Ok(renderer)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    pub fn size(&self) -> (u32, u32) {
        (self.targets.width(), self.targets.height())
    }

    pub fn params(&self) -> &RenderParams {
        &self.params
    }

    pub fn set_params(&mut self, params: RenderParams) {
        self.params = params;
        self.write_blur_uniforms();
    }

    pub fn set_show_bounds(&mut self, show: bool) {
        self.show_bounds = show;
    }

    pub fn plan(&self, style: RenderStyle) -> &PassPlan {
        match style {
            RenderStyle::Instanced => &self.instanced_plan,
            RenderStyle::Generic => &self.generic_plan,
        }
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if (width.max(1), height.max(1)) == self.size() {
            return;
        }
        self.targets = RenderTargets::new(&self.device, width, height);
        self.bind_groups = PassBindGroups::new(&self.device, &self.layouts, &self.uniforms, &self.targets);
        self.clear_agent_info();
        log::debug!("Render targets resized to {}x{}", self.targets.width(), self.targets.height());
    }

    /// Forget uploaded meshes. Call when asset names may now refer to different data.
    pub fn clear_geometry_cache(&mut self) {
        self.meshes.clear();
        self.mesh_instances.clear();
    }

    /// Render the engine's current instances into `output`.
    pub fn render(&mut self, output: &wgpu::TextureView, engine: &mut SceneEngine, camera: &Camera) {
        self.prepare(engine, camera);

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Agent Render Encoder"),
        });
        for kind in self.plan(engine.style()).passes() {
            self.encode_pass(&mut encoder, *kind, output);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Instance id under pixel `(x, y)` in the last rendered frame.
    pub fn hit_test(&self, x: u32, y: u32) -> Result<Option<InstanceId>, PipelineError> {
        let (width, height) = self.size();
        if x >= width || y >= height {
            return Err(PipelineError::OutOfBounds { x, y, width, height });
        }
        let pixel = self.readback.read_pixel(
            &self.device,
            &self.queue,
            &self.targets.agent_info.texture,
            x,
            y,
        )?;
        Ok(decode_identity_pixel(pixel))
    }

    /// Fill the agent-info target with the background sentinel so hit tests
    /// before the next frame report no agent.
    fn clear_agent_info(&self) {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Agent Info Clear Encoder"),
        });
        {
            let _clear = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("agent_info_clear"),
                color_attachments: &[color_attachment(
                    &self.targets.agent_info.view,
                    wgpu::LoadOp::Clear(AGENT_INFO_CLEAR),
                )],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }

    fn write_blur_uniforms(&self) {
        let p = &self.params;
        for (o, radius) in [(Occlusion::Near, p.blur_radius1), (Occlusion::Far, p.blur_radius2)] {
            for (axis, dir) in [(BlurAxis::Horizontal, [1.0, 0.0]), (BlurAxis::Vertical, [0.0, 1.0])] {
                let uniforms = BlurUniforms {
                    direction_and_radius: [dir[0], dir[1], radius, p.blur_depth_cutoff],
                };
                self.queue.write_buffer(
                    &self.uniforms.blur[blur_slot(o, axis)],
                    0,
                    bytemuck::bytes_of(&uniforms),
                );
            }
        }
    }

    /// Upload everything this frame draws.
    fn prepare(&mut self, engine: &mut SceneEngine, camera: &Camera) {
        let (width, height) = self.size();
        let aspect = width as f32 / height as f32;
        let view = camera.view_matrix();
        let proj = camera.projection_matrix(aspect);
        let p = &self.params;

        let camera_uniforms = CameraUniforms {
            view: view.to_cols_array_2d(),
            proj: proj.to_cols_array_2d(),
        };
        self.queue.write_buffer(&self.camera_buffer, 0, bytemuck::bytes_of(&camera_uniforms));

        for (o, radius, threshold, falloff) in [
            (Occlusion::Near, p.ao_radius1, p.ao_threshold1, p.ao_falloff1),
            (Occlusion::Far, p.ao_radius2, p.ao_threshold2, p.ao_falloff2),
        ] {
            let uniforms = SsaoUniforms {
                proj: proj.to_cols_array_2d(),
                samples: self.ssao_kernel,
                params: [radius, threshold, falloff, 0.0],
                size: [width as f32, height as f32, 0.0, 0.0],
            };
            self.queue.write_buffer(
                &self.uniforms.ssao[occlusion_slot(o)],
                0,
                bytemuck::bytes_of(&uniforms),
            );
        }

        let followed = engine.manager().followed().map(|id| id as f32).unwrap_or(-1.0);
        let mut palette = [[0.0; 4]; 256];
        for (dst, src) in palette.iter_mut().zip(engine.colors().gpu_palette()) {
            *dst = src;
        }
        let bg = p.background_color;
        let composite = CompositeUniforms {
            background: [bg[0], bg[1], bg[2], 1.0],
            follow_color: [p.follow_color[0], p.follow_color[1], p.follow_color[2], FOLLOW_TINT],
            params: [followed, 0.0, 0.0, 0.0],
            palette,
        };
        self.queue.write_buffer(&self.uniforms.composite, 0, bytemuck::bytes_of(&composite));

        let contour = ContourUniforms {
            outline: [p.outline_color[0], p.outline_color[1], p.outline_color[2], p.outline_alpha],
            follow: [p.follow_color[0], p.follow_color[1], p.follow_color[2], p.follow_alpha],
            params: [p.outline_thickness, p.follow_thickness, followed, 0.0],
        };
        self.queue.write_buffer(&self.uniforms.contour, 0, bytemuck::bytes_of(&contour));

        self.upload_meshes(engine);
        self.sync_instances(engine);
        self.upload_fibers(engine);
        self.upload_lines(engine);
    }

    fn upload_meshes(&mut self, engine: &SceneEngine) {
        for key in engine.manager().mesh_pools().keys() {
            let GeometryKey::Mesh(name) = key else {
                continue;
            };
            if self.meshes.contains_key(name) {
                continue;
            }
            let Some(asset) = engine.assets().get(name).and_then(|g| g.as_mesh()) else {
                continue;
            };
            if asset.indices.is_empty() {
                log::warn!("Mesh '{}' has no triangles", name);
                continue;
            }
            log::debug!("Uploading mesh '{}' ({} triangles)", name, asset.triangle_count());
            self.meshes.insert(
                name.clone(),
                GpuGeometry::new(&self.device, name, &asset.vertices, &asset.indices),
            );
        }
    }

    fn sync_instances(&mut self, engine: &mut SceneEngine) {
        let manager = engine.manager_mut();
        let pools = manager.mesh_pools_mut();
        self.mesh_instances.retain(|key, _| pools.contains_key(key));
        for (key, pool) in pools.iter_mut() {
            let gpu = self
                .mesh_instances
                .entry(key.clone())
                .or_insert_with(|| GpuInstanceBuffers::new(&self.device, pool));
            gpu.sync(&self.device, &self.queue, pool);
        }

        let endcaps = manager.endcap_pool_mut();
        self.endcap_instances
            .get_or_insert_with(|| GpuInstanceBuffers::new(&self.device, endcaps))
            .sync(&self.device, &self.queue, endcaps);

        let fibers = manager.fiber_pool_mut();
        self.fiber_instances
            .get_or_insert_with(|| GpuInstanceBuffers::new(&self.device, fibers))
            .sync(&self.device, &self.queue, fibers);
    }

    fn upload_fibers(&mut self, engine: &SceneEngine) {
        self.fiber_batch.clear();
        for fiber in engine.manager().fibers() {
            self.fiber_batch.push_tube(&fiber.points, fiber.radius, TUBE_SIDES);
        }
        self.fiber_vertices.write(
            &self.device,
            &self.queue,
            bytemuck::cast_slice(&self.fiber_batch.vertices),
        );
        self.fiber_indices.write(
            &self.device,
            &self.queue,
            bytemuck::cast_slice(&self.fiber_batch.indices),
        );
    }

    fn upload_lines(&mut self, engine: &SceneEngine) {
        let mut lines: Vec<LineVertex> = engine.paths().line_vertices();
        if self.show_bounds {
            let b = engine.config().volume_bounds;
            lines.extend(mesh::create_box_lines(
                Vec3::new(b[0], b[1], b[2]),
                Vec3::new(b[3], b[4], b[5]),
                BOUNDS_COLOR,
            ));
        }
        self.line_count = lines.len() as u32;
        self.line_vertices
            .write(&self.device, &self.queue, bytemuck::cast_slice(&lines));
    }

    fn encode_pass(&self, encoder: &mut wgpu::CommandEncoder, kind: PassKind, output: &wgpu::TextureView) {
        let t = &self.targets;
        let bg = self.params.background_color;
        let background = wgpu::Color {
            r: bg[0] as f64,
            g: bg[1] as f64,
            b: bg[2] as f64,
            a: 1.0,
        };

        match kind {
            PassKind::GBuffer => self.encode_gbuffer(encoder),
            PassKind::Ssao(o) => {
                let Some(target) = self.plan_output(kind) else {
                    return;
                };
                self.fullscreen(
                    encoder,
                    kind.name(),
                    target,
                    wgpu::LoadOp::Clear(wgpu::Color::WHITE),
                    None,
                    &self.ssao_pipeline,
                    &self.bind_groups.ssao[occlusion_slot(o)],
                );
            }
            PassKind::Blur(o, axis) => {
                let Some(target) = self.plan_output(kind) else {
                    return;
                };
                self.fullscreen(
                    encoder,
                    kind.name(),
                    target,
                    wgpu::LoadOp::Clear(wgpu::Color::WHITE),
                    None,
                    &self.blur_pipeline,
                    &self.bind_groups.blur[blur_slot(o, axis)],
                );
            }
            PassKind::ClearOcclusion => {
                for view in [&t.ssao1_blurred.view, &t.ssao2_blurred.view] {
                    let _clear = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some(kind.name()),
                        color_attachments: &[color_attachment(view, wgpu::LoadOp::Clear(wgpu::Color::WHITE))],
                        depth_stencil_attachment: None,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                }
            }
            PassKind::Composite => self.fullscreen(
                encoder,
                kind.name(),
                self.plan_output(kind).unwrap_or(&t.blur_intermediate.view),
                wgpu::LoadOp::Clear(background),
                None,
                &self.composite_pipeline,
                &self.bind_groups.composite,
            ),
            PassKind::Contour => self.fullscreen(
                encoder,
                kind.name(),
                output,
                wgpu::LoadOp::Clear(background),
                Some((&t.overlay_depth.view, wgpu::LoadOp::Clear(1.0))),
                &self.contour_pipeline,
                &self.bind_groups.contour,
            ),
            PassKind::Overlay => {
                if self.line_count == 0 {
                    return;
                }
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some(kind.name()),
                    color_attachments: &[color_attachment(output, wgpu::LoadOp::Load)],
                    depth_stencil_attachment: depth_attachment(&t.overlay_depth.view, wgpu::LoadOp::Load),
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(&self.line_pipeline);
                pass.set_bind_group(0, &self.camera_bind_group, &[]);
                pass.set_vertex_buffer(0, self.line_vertices.slice());
                pass.draw(0..self.line_count, 0..1);
            }
        }
    }

    /// The offscreen target a fullscreen pass renders into.
    fn plan_output(&self, kind: PassKind) -> Option<&wgpu::TextureView> {
        kind.outputs()
            .first()
            .and_then(|target| self.targets.get(*target))
            .map(|target| &target.view)
    }

    fn encode_gbuffer(&self, encoder: &mut wgpu::CommandEncoder) {
        let t = &self.targets;
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("gbuffer"),
            color_attachments: &[
                color_attachment(&t.agent_info.view, wgpu::LoadOp::Clear(AGENT_INFO_CLEAR)),
                color_attachment(&t.normal.view, wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)),
                color_attachment(&t.position.view, wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)),
            ],
            depth_stencil_attachment: depth_attachment(&t.gbuffer_depth.view, wgpu::LoadOp::Clear(1.0)),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(&self.gbuffer_pipeline);
        pass.set_bind_group(0, &self.camera_bind_group, &[]);

        for (key, instances) in &self.mesh_instances {
            if instances.count() == 0 {
                continue;
            }
            let geometry = match key {
                GeometryKey::Sphere => Some(&self.sphere),
                GeometryKey::Mesh(name) => self.meshes.get(name),
            };
            let Some(geometry) = geometry else {
                continue;
            };
            geometry.bind(&mut pass);
            instances.bind(&mut pass);
            pass.draw_indexed(0..geometry.num_indices(), 0, 0..instances.count());
        }

        if let Some(endcaps) = self.endcap_instances.as_ref().filter(|e| e.count() > 0) {
            self.sphere.bind(&mut pass);
            endcaps.bind(&mut pass);
            pass.draw_indexed(0..self.sphere.num_indices(), 0, 0..endcaps.count());
        }

        let Some(fibers) = self.fiber_instances.as_ref() else {
            return;
        };
        if self.fiber_indices.is_empty() || fibers.count() == 0 {
            return;
        }
        pass.set_vertex_buffer(0, self.fiber_vertices.slice());
        pass.set_index_buffer(self.fiber_indices.slice(), wgpu::IndexFormat::Uint32);
        fibers.bind(&mut pass);
        for (i, range) in self.fiber_batch.ranges.iter().enumerate() {
            let instance = i as u32;
            if range.is_empty() || instance >= fibers.count() {
                continue;
            }
            pass.draw_indexed(range.clone(), 0, instance..instance + 1);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fullscreen(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        label: &str,
        target: &wgpu::TextureView,
        load: wgpu::LoadOp<wgpu::Color>,
        depth: Option<(&wgpu::TextureView, wgpu::LoadOp<f32>)>,
        pipeline: &wgpu::RenderPipeline,
        bind_group: &wgpu::BindGroup,
    ) {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &[color_attachment(target, load)],
            depth_stencil_attachment: depth.and_then(|(view, load)| depth_attachment(view, load)),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.set_vertex_buffer(0, self.quad_vertex_buffer.slice(..));
        pass.draw(0..QUAD_VERTICES.len() as u32, 0..1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssao_kernel_stays_in_unit_hemisphere() {
        let kernel = ssao_kernel();
        for s in kernel.iter() {
            let v = Vec3::new(s[0], s[1], s[2]);
            assert!(s[2] >= 0.0);
            assert!(v.length() <= 1.0 + 1e-5);
            assert!(v.length() >= 0.1 - 1e-5);
        }
        assert_eq!(kernel, ssao_kernel());
    }

    #[test]
    fn test_uniform_layouts_match_shaders() {
        assert_eq!(std::mem::size_of::<CameraUniforms>(), 128);
        assert_eq!(std::mem::size_of::<SsaoUniforms>(), 64 + 64 * 16 + 32);
        assert_eq!(std::mem::size_of::<CompositeUniforms>(), 48 + 256 * 16);
        assert_eq!(std::mem::size_of::<ContourUniforms>() % 16, 0);
        assert_eq!(std::mem::size_of::<BlurUniforms>(), 16);
    }

    #[test]
    fn test_blur_slots_are_distinct() {
        let mut slots: Vec<usize> = [Occlusion::Near, Occlusion::Far]
            .iter()
            .flat_map(|o| [blur_slot(*o, BlurAxis::Horizontal), blur_slot(*o, BlurAxis::Vertical)])
            .collect();
        slots.sort();
        assert_eq!(slots, vec![0, 1, 2, 3]);
    }
}
