//! `wgpu` implementation of the backend seam.
//!
//! - `context` creates a headless adapter, device and queue and implements
//!   [`GpuBackend`](crate::buffer::GpuBackend).
//! - `texture` provides offscreen [`TextureBuffer`] targets, which also back
//!   the serial pipeline's scratch pair.
//! - `uniforms` lays named uniforms out in a WGSL uniform buffer and uploads
//!   each changed value with one `write_buffer` call.
//! - `effect` compiles WGSL fragment bodies into fullscreen-triangle effects.
//! - `readback` copies a texture back to the CPU for export.

mod context;
mod effect;
mod readback;
mod texture;
mod uniforms;

pub use context::{spawn_headless, WgpuBackend};
pub use effect::FullscreenEffect;
pub use readback::read_rgba;
pub use texture::{TextureBuffer, WgpuTexture};
pub use uniforms::{encode_value, UniformBlock, UniformField, UniformLayout};
