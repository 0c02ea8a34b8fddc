//! Drawing stages.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use tracing::trace;

use crate::buffer::{GlBuffer, GpuBackend};
use crate::error::KraftError;

/// Upcasting helper so pipelines can hand back concrete effects.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// What one stage reads and where it writes.
pub struct DrawPass<'a, B: GpuBackend> {
    /// Stage input textures. Stage 0 receives the externally bound inputs,
    /// later stages the previous stage's output.
    pub inputs: &'a [B::Texture],
    pub target: &'a mut dyn GlBuffer<B>,
}

impl<B: GpuBackend> DrawPass<'_, B> {
    pub fn primary(&self) -> Option<&B::Texture> {
        self.inputs.first()
    }
}

/// A single texture-in, texture-out drawing stage.
///
/// Effects hold no reference to the pipeline running them. Everything they
/// touch on the GPU arrives through `gpu` and `pass`.
pub trait Effect<B: GpuBackend>: AsAny + Send {
    fn name(&self) -> &str;

    /// Draws into `pass.target`. The target is already active.
    fn draw(&mut self, gpu: &mut B, pass: DrawPass<'_, B>) -> Result<(), KraftError>;

    /// Releases GPU state. With `recursively`, also releases buffers the effect owns.
    fn delete(&mut self, gpu: &mut B, recursively: bool);
}

/// Stable identity of an effect inside one pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectId(pub u64);

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "effect#{}", self.0)
    }
}

/// Typed handle returned by `add_effect`, used to bind inputs to the concrete effect.
pub struct EffectHandle<E> {
    id: EffectId,
    _marker: PhantomData<fn() -> E>,
}

impl<E> EffectHandle<E> {
    pub(crate) fn new(id: EffectId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> EffectId {
        self.id
    }
}

impl<E> Clone for EffectHandle<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for EffectHandle<E> {}

impl<E> fmt::Debug for EffectHandle<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EffectHandle").field(&self.id).finish()
    }
}

pub(crate) fn downcast_effect<B, E>(effect: &mut Box<dyn Effect<B>>) -> Option<&mut E>
where
    B: GpuBackend,
    E: Effect<B>,
{
    AsAny::as_any_mut(&mut **effect).downcast_mut::<E>()
}

/// An effect combining two textures, e.g. a blend or a transition.
pub trait TwoInputEffect<B: GpuBackend>: Send + 'static {
    fn name(&self) -> &str;

    fn draw_pair(
        &mut self,
        gpu: &mut B,
        first: &B::Texture,
        second: &B::Texture,
        target: &mut dyn GlBuffer<B>,
    ) -> Result<(), KraftError>;

    fn delete(&mut self, gpu: &mut B, recursively: bool);
}

/// Whether a [`Switchable`] draws or forwards one of its inputs untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Routing {
    #[default]
    Active,
    Bypass {
        pass_first: bool,
    },
}

/// Wraps a two-input effect with a runtime bypass switch.
///
/// The second input comes from the pass when the stage receives two inputs,
/// otherwise from [`set_secondary`](Switchable::set_secondary).
pub struct Switchable<B: GpuBackend, E> {
    inner: E,
    routing: Routing,
    secondary: Option<B::Texture>,
}

impl<B: GpuBackend, E: TwoInputEffect<B>> Switchable<B, E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            routing: Routing::Active,
            secondary: None,
        }
    }

    pub fn routing(&self) -> Routing {
        self.routing
    }

    pub fn set_routing(&mut self, routing: Routing) {
        self.routing = routing;
    }

    pub fn set_secondary(&mut self, texture: Option<B::Texture>) {
        self.secondary = texture;
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut E {
        &mut self.inner
    }
}

impl<B: GpuBackend, E: TwoInputEffect<B>> Effect<B> for Switchable<B, E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn draw(&mut self, gpu: &mut B, pass: DrawPass<'_, B>) -> Result<(), KraftError> {
        let first = pass
            .inputs
            .first()
            .cloned()
            .ok_or_else(|| KraftError::TextureUnavailable(format!("{} primary input", self.name())))?;
        let second = pass
            .inputs
            .get(1)
            .cloned()
            .or_else(|| self.secondary.clone())
            .ok_or_else(|| {
                KraftError::TextureUnavailable(format!("{} secondary input", self.name()))
            })?;

        match self.routing {
            Routing::Active => self.inner.draw_pair(gpu, &first, &second, pass.target),
            Routing::Bypass { pass_first } => {
                trace!(effect = self.inner.name(), pass_first, "bypassing effect");
                let source = if pass_first { &first } else { &second };
                gpu.copy_texture(source, pass.target)
            }
        }
    }

    fn delete(&mut self, gpu: &mut B, recursively: bool) {
        self.inner.delete(gpu, recursively);
    }
}
