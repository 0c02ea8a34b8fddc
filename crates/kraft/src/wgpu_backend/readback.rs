use crossbeam_channel::bounded;

use super::context::WgpuBackend;
use super::texture::WgpuTexture;
use crate::error::KraftError;

const BYTES_PER_PIXEL: u32 = 4;

/// Copies an RGBA8 texture back to the CPU, blocking until the GPU is done.
/// Rows come back tightly packed.
pub fn read_rgba(gpu: &WgpuBackend, texture: &WgpuTexture) -> Result<Vec<u8>, KraftError> {
    let size = texture.size();
    let unpadded_bytes_per_row = size.width * BYTES_PER_PIXEL;
    let alignment = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(alignment) * alignment;

    let device = gpu.device();
    let readback = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("kraft readback buffer"),
        size: u64::from(padded_bytes_per_row) * u64::from(size.height),
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("kraft readback encoder"),
    });
    encoder.copy_texture_to_buffer(
        texture.texture.as_image_copy(),
        wgpu::TexelCopyBufferInfo {
            buffer: &readback,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_bytes_per_row),
                rows_per_image: Some(size.height),
            },
        },
        wgpu::Extent3d {
            width: size.width,
            height: size.height,
            depth_or_array_layers: 1,
        },
    );
    gpu.queue().submit(Some(encoder.finish()));

    let slice = readback.slice(..);
    let (sender, receiver) = bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|err| KraftError::backend(format!("failed waiting for GPU readback: {err}")))?;
    receiver
        .recv()
        .map_err(|_| KraftError::backend("GPU map callback never fired"))?
        .map_err(|err| KraftError::backend(format!("GPU buffer mapping failed: {err}")))?;

    let mapped = slice.get_mapped_range();
    let mut pixels = Vec::with_capacity((unpadded_bytes_per_row * size.height) as usize);
    for row in mapped
        .chunks(padded_bytes_per_row as usize)
        .take(size.height as usize)
    {
        pixels.extend_from_slice(&row[..unpadded_bytes_per_row as usize]);
    }
    drop(mapped);
    readback.unmap();
    Ok(pixels)
}
