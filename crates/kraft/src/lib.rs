//! Shader-effect pipeline execution engine.
//!
//! A [`GpuContext`] owns the one serialized GPU stream. A [`Pipeline`]
//! schedules frames on it: sample inputs, drain work queued from other
//! threads, then draw. [`SerialPipeline`] chains effects through a pair of
//! ping-pong scratch buffers into a final target, and [`UniformProgram`]
//! keeps unchanged uniform values from being uploaded twice.
//!
//! Backends plug in through [`GpuBackend`] and [`GlBuffer`]. A headless
//! `wgpu` backend ships behind the default `wgpu-backend` feature.

pub mod actions;
pub mod buffer;
pub mod context;
pub mod effect;
pub mod error;
pub mod input;
pub mod pipeline;
pub mod resource;
pub mod serial;
pub mod time;
pub mod uniform;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub use buffer::{GlBuffer, GpuBackend, Size};
pub use context::GpuContext;
pub use effect::{DrawPass, Effect, EffectHandle, EffectId, Routing, Switchable, TwoInputEffect};
pub use error::KraftError;
pub use input::{
    bounce, sampled, CachedInput, ConstantInput, FloatInputExt, FnInput, Input, MappedInput,
    MutableInput, SampledInput, SampledInputExt,
};
pub use kraftconfig::{ErrorMode, KraftConfig};
pub use pipeline::{ChainExecutor, DeferredSender, FrameStatus, Phase, Pipeline, Sampling};
pub use resource::{scoped, KraftResource, ResourceSet};
pub use serial::{SerialChain, SerialPipeline};
pub use time::{Clock, ManualClock, MonotonicClock, TimeInput, TimerState};
pub use tokio_util::sync::CancellationToken;
pub use uniform::{
    FloatArray, Mat3, Mat4, Uniform, UniformData, UniformKind, UniformLocation, UniformProgram,
    UniformSink, UniformValue,
};
