//! Identity-buffer read-back for hit testing.

use crate::agent::InstanceId;
use crate::error::PipelineError;

/// Clear value of the agent-info target: no type, no instance, sentinel depth.
pub const AGENT_INFO_CLEAR: wgpu::Color = wgpu::Color {
    r: 0.0,
    g: -1.0,
    b: 0.0,
    a: -1.0,
};

/// Bytes per pixel of the `Rgba32Float` agent-info target.
const PIXEL_BYTES: u64 = 16;

/// Decode one agent-info pixel.
///
/// Background pixels carry the `-1` depth sentinel. Agent pixels always have
/// a nonzero type color, so a pixel with type color 0 was never written by
/// the identity pass (a freshly created texture reads back as all zeros).
pub fn decode_identity_pixel(pixel: [f32; 4]) -> Option<InstanceId> {
    if pixel[0] == 0.0 || pixel[3] == -1.0 || pixel[1] < 0.0 {
        return None;
    }
    Some(pixel[1].round() as InstanceId)
}

/// Staging buffer for a single-pixel copy.
pub struct IdentityReadback {
    buffer: wgpu::Buffer,
}

impl IdentityReadback {
    pub fn new(device: &wgpu::Device) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Identity Readback Buffer"),
            size: wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Self { buffer }
    }

    /// Copy pixel `(x, y)` of `texture` to the CPU and wait for it.
    pub fn read_pixel(
        &self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        texture: &wgpu::Texture,
        x: u32,
        y: u32,
    ) -> Result<[f32; 4], PipelineError> {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Identity Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: 0 },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &self.buffer,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT),
                    rows_per_image: Some(1),
                },
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        queue.submit(Some(encoder.finish()));

        let slice = self.buffer.slice(..PIXEL_BYTES);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| PipelineError::Readback(e.to_string()))?
            .map_err(|e| PipelineError::Readback(e.to_string()))?;

        let pixel = {
            let data = slice.get_mapped_range();
            let values: &[f32] = bytemuck::cast_slice(&data);
            [values[0], values[1], values[2], values[3]]
        };
        self.buffer.unmap();
        Ok(pixel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_pixel_is_no_agent() {
        let clear = [
            AGENT_INFO_CLEAR.r as f32,
            AGENT_INFO_CLEAR.g as f32,
            AGENT_INFO_CLEAR.b as f32,
            AGENT_INFO_CLEAR.a as f32,
        ];
        assert_eq!(decode_identity_pixel(clear), None);
    }

    #[test]
    fn test_unwritten_pixel_is_no_agent() {
        assert_eq!(decode_identity_pixel([0.0; 4]), None);
        assert_eq!(decode_identity_pixel([0.0, 5.0, -3.0, 0.4]), None);
    }

    #[test]
    fn test_agent_pixel_decodes_instance() {
        assert_eq!(decode_identity_pixel([3.0, 41.0, -12.0, 0.7]), Some(41));
        assert_eq!(decode_identity_pixel([-2.0, 0.0, -5.0, 0.2]), Some(0));
        // Interpolation noise rounds to the nearest id
        assert_eq!(decode_identity_pixel([1.0, 6.9999, -1.0, 0.5]), Some(7));
    }
}
