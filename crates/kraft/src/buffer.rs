use std::fmt;

use crate::error::KraftError;

/// Pixel dimensions of a drawable target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// The native graphics state owned by the GPU worker.
///
/// Exactly one value of this type lives on the worker thread. Every job the
/// [`GpuContext`](crate::context::GpuContext) runs receives it mutably after
/// [`make_current`](GpuBackend::make_current) succeeded.
pub trait GpuBackend: Send + 'static {
    /// Handle an effect samples from and a buffer exposes as its contents.
    type Texture: Clone + Send + fmt::Debug + 'static;

    fn make_current(&mut self) -> Result<(), KraftError>;

    /// Allocates an offscreen buffer, used for the ping-pong scratch pair.
    fn allocate_buffer(
        &mut self,
        label: &str,
        size: Size,
    ) -> Result<Box<dyn GlBuffer<Self>>, KraftError>;

    /// Copies `source` into `target`, used when an effect is bypassed.
    fn copy_texture(
        &mut self,
        source: &Self::Texture,
        target: &mut dyn GlBuffer<Self>,
    ) -> Result<(), KraftError>;

    /// Destroys the native context. Called once, by the worker, on shutdown.
    fn terminate(&mut self);
}

/// A drawable target: offscreen texture, pixel buffer or window surface.
///
/// Buffers are leaves in the ownership graph. Whoever created one owns it and
/// is responsible for calling [`delete`](GlBuffer::delete) from the GPU
/// worker exactly once.
pub trait GlBuffer<B: GpuBackend>: Send {
    fn label(&self) -> &str;

    fn size(&self) -> Size;

    /// Window surfaces use screen coordinates and flip Y relative to textures.
    fn is_screen_coordinate(&self) -> bool {
        false
    }

    /// Contents of the buffer as something an effect can sample.
    fn texture(&self) -> Option<B::Texture>;

    /// Makes this buffer the active render target.
    fn before_draw(&mut self, gpu: &mut B) -> Result<(), KraftError>;

    /// Finishes drawing, presenting window surfaces.
    fn after_draw(&mut self, gpu: &mut B) -> Result<(), KraftError>;

    /// Reallocates backing storage at a new size. Surfaces reconfigure instead.
    fn resize(&mut self, gpu: &mut B, size: Size) -> Result<(), KraftError>;

    fn delete(&mut self, gpu: &mut B);
}
