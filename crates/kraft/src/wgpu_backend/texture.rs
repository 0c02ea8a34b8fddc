use std::fmt;

use super::context::{WgpuBackend, TEXTURE_FORMAT};
use crate::buffer::{GlBuffer, Size};
use crate::error::KraftError;

/// A texture plus the default view effects sample and render through.
#[derive(Clone)]
pub struct WgpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
}

impl WgpuTexture {
    pub fn size(&self) -> Size {
        let extent = self.texture.size();
        Size::new(extent.width, extent.height)
    }
}

impl fmt::Debug for WgpuTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuTexture")
            .field("size", &self.size())
            .field("format", &self.texture.format())
            .finish()
    }
}

fn create_texture(device: &wgpu::Device, label: &str, size: Size) -> WgpuTexture {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width: size.width.max(1),
            height: size.height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: TEXTURE_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    WgpuTexture { texture, view }
}

/// Offscreen render target. Resizing recreates the texture.
pub struct TextureBuffer {
    label: String,
    size: Size,
    screen_coordinate: bool,
    texture: Option<WgpuTexture>,
}

impl TextureBuffer {
    pub fn new(gpu: &WgpuBackend, label: &str, size: Size) -> Self {
        Self {
            label: label.to_string(),
            size,
            screen_coordinate: false,
            texture: Some(create_texture(gpu.device(), label, size)),
        }
    }

    /// Marks the buffer as using window orientation, so effects flip Y when
    /// drawing into it.
    pub fn with_screen_coordinates(mut self, screen_coordinate: bool) -> Self {
        self.screen_coordinate = screen_coordinate;
        self
    }

    /// Uploads tightly packed RGBA8 pixels, e.g. a decoded image used as a
    /// pipeline input.
    pub fn write_rgba(&self, gpu: &WgpuBackend, pixels: &[u8]) -> Result<(), KraftError> {
        let texture = self
            .texture
            .as_ref()
            .ok_or_else(|| KraftError::TextureUnavailable(self.label.clone()))?;
        let expected = self.size.width as usize * self.size.height as usize * 4;
        if pixels.len() != expected {
            return Err(KraftError::backend(format!(
                "buffer '{}' expects {expected} bytes of RGBA data, got {}",
                self.label,
                pixels.len()
            )));
        }
        gpu.queue().write_texture(
            texture.texture.as_image_copy(),
            pixels,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(self.size.width * 4),
                rows_per_image: Some(self.size.height),
            },
            wgpu::Extent3d {
                width: self.size.width,
                height: self.size.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }
}

impl GlBuffer<WgpuBackend> for TextureBuffer {
    fn label(&self) -> &str {
        &self.label
    }

    fn size(&self) -> Size {
        self.size
    }

    fn is_screen_coordinate(&self) -> bool {
        self.screen_coordinate
    }

    fn texture(&self) -> Option<WgpuTexture> {
        self.texture.clone()
    }

    fn before_draw(&mut self, _gpu: &mut WgpuBackend) -> Result<(), KraftError> {
        if self.texture.is_none() {
            return Err(KraftError::TextureUnavailable(self.label.clone()));
        }
        Ok(())
    }

    fn after_draw(&mut self, _gpu: &mut WgpuBackend) -> Result<(), KraftError> {
        Ok(())
    }

    fn resize(&mut self, gpu: &mut WgpuBackend, size: Size) -> Result<(), KraftError> {
        if size == self.size && self.texture.is_some() {
            return Ok(());
        }
        if let Some(old) = self.texture.take() {
            old.texture.destroy();
        }
        self.texture = Some(create_texture(gpu.device(), &self.label, size));
        self.size = size;
        tracing::debug!(buffer = %self.label, %size, "recreated texture buffer");
        Ok(())
    }

    fn delete(&mut self, _gpu: &mut WgpuBackend) {
        if let Some(texture) = self.texture.take() {
            texture.texture.destroy();
        }
    }
}
