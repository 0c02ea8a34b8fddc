//! Serial ping-pong chain.
//!
//! For effects `e0..eN-1` and final target `T`, stage `i` writes to `T` when
//! `i == N-1`, otherwise to `scratch[i % 2]` (B1 for even, B2 for odd). Stage
//! `i > 0` reads what stage `i-1` wrote, `scratch[(i-1) % 2]`, so the read
//! side trails the write side by one stage:
//!
//! ```text
//! stage    0    1    2    3    4
//! reads    in   B1   B2   B1   B2
//! writes   B1   B2   B1   B2   T
//! ```
//!
//! A stage never reads and writes the same buffer because consecutive
//! indices have different parity. The scratch pair is only needed for two or
//! more effects and always matches the target's size.

use std::sync::Arc;

use kraftconfig::{ErrorMode, PipelineSettings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::buffer::{GlBuffer, GpuBackend, Size};
use crate::context::GpuContext;
use crate::effect::{downcast_effect, DrawPass, Effect, EffectHandle, EffectId};
use crate::error::KraftError;
use crate::input::SampledInput;
use crate::pipeline::{ChainExecutor, FrameStatus, Pipeline, Sampling};
use crate::resource::ResourceSet;

pub const SCRATCH_LABELS: [&str; 2] = ["scratch-b1", "scratch-b2"];

struct ScratchPair<B: GpuBackend> {
    buffers: [Box<dyn GlBuffer<B>>; 2],
    size: Size,
}

impl<B: GpuBackend> ScratchPair<B> {
    fn allocate(gpu: &mut B, size: Size) -> Result<Self, KraftError> {
        let first = gpu.allocate_buffer(SCRATCH_LABELS[0], size)?;
        let second = match gpu.allocate_buffer(SCRATCH_LABELS[1], size) {
            Ok(buffer) => buffer,
            Err(err) => {
                let mut first = first;
                first.delete(gpu);
                return Err(err);
            }
        };
        debug!(%size, "allocated scratch buffers");
        Ok(Self {
            buffers: [first, second],
            size,
        })
    }

    fn delete(mut self, gpu: &mut B) {
        for buffer in self.buffers.iter_mut() {
            buffer.delete(gpu);
        }
        debug!(size = %self.size, "deleted scratch buffers");
    }
}

/// State of a serial pipeline: ordered effects, the final target, the
/// externally bound stage-0 inputs and the scratch pair.
///
/// A target replaced by a later one is not deleted; it waits in `displaced`
/// until the host takes it back or the pipeline is destroyed.
pub struct SerialChain<B: GpuBackend> {
    effects: Vec<(EffectId, Box<dyn Effect<B>>)>,
    next_id: u64,
    target: Option<Box<dyn GlBuffer<B>>>,
    displaced: Vec<Box<dyn GlBuffer<B>>>,
    inputs: Vec<B::Texture>,
    scratch: Option<ScratchPair<B>>,
}

impl<B: GpuBackend> Default for SerialChain<B> {
    fn default() -> Self {
        Self {
            effects: Vec::new(),
            next_id: 0,
            target: None,
            displaced: Vec::new(),
            inputs: Vec::new(),
            scratch: None,
        }
    }
}

impl<B: GpuBackend> SerialChain<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn effect_names(&self) -> Vec<String> {
        self.effects
            .iter()
            .map(|(_, effect)| effect.name().to_string())
            .collect()
    }

    pub fn target_size(&self) -> Option<Size> {
        self.target.as_ref().map(|target| target.size())
    }

    pub fn target_texture(&self) -> Option<B::Texture> {
        self.target.as_ref().and_then(|target| target.texture())
    }

    pub fn scratch_size(&self) -> Option<Size> {
        self.scratch.as_ref().map(|pair| pair.size)
    }

    fn push(&mut self, effect: Box<dyn Effect<B>>) -> EffectId {
        let id = EffectId(self.next_id);
        self.next_id += 1;
        self.effects.push((id, effect));
        id
    }

    fn take_effect(&mut self, id: EffectId) -> Option<Box<dyn Effect<B>>> {
        let index = self.effects.iter().position(|(existing, _)| *existing == id)?;
        Some(self.effects.remove(index).1)
    }

    fn effect_mut<E: Effect<B>>(&mut self, id: EffectId) -> Option<&mut E> {
        self.effects
            .iter_mut()
            .find(|(existing, _)| *existing == id)
            .and_then(|(_, effect)| downcast_effect::<B, E>(effect))
    }

    fn replace_target(
        &mut self,
        gpu: &mut B,
        buffer: Box<dyn GlBuffer<B>>,
    ) -> Result<(), KraftError> {
        let size = buffer.size();
        debug!(target = buffer.label(), %size, "target buffer set");
        if let Some(previous) = self.target.replace(buffer) {
            trace!(previous = previous.label(), "previous target displaced");
            self.displaced.push(previous);
        }
        self.refresh_scratch(gpu, size)
    }

    fn resize(&mut self, gpu: &mut B, size: Size) -> Result<(), KraftError> {
        let Some(target) = self.target.as_mut() else {
            debug!(%size, "resize ignored without a target buffer");
            return Ok(());
        };
        if target.size() != size {
            target.resize(gpu, size)?;
        }
        self.refresh_scratch(gpu, size)
    }

    /// Reallocates an existing scratch pair whose size no longer matches.
    fn refresh_scratch(&mut self, gpu: &mut B, size: Size) -> Result<(), KraftError> {
        match self.scratch.take() {
            Some(pair) if pair.size != size => {
                pair.delete(gpu);
                self.scratch = Some(ScratchPair::allocate(gpu, size)?);
            }
            unchanged => self.scratch = unchanged,
        }
        Ok(())
    }
}

fn ensure_scratch<'a, B: GpuBackend>(
    slot: &'a mut Option<ScratchPair<B>>,
    gpu: &mut B,
    size: Size,
) -> Result<&'a mut ScratchPair<B>, KraftError> {
    if slot.as_ref().is_some_and(|pair| pair.size != size) {
        if let Some(stale) = slot.take() {
            stale.delete(gpu);
        }
    }
    if slot.is_none() {
        *slot = Some(ScratchPair::allocate(gpu, size)?);
    }
    slot.as_mut()
        .ok_or_else(|| KraftError::backend("scratch buffers missing after allocation"))
}

impl<B: GpuBackend> ChainExecutor<B> for SerialChain<B> {
    fn execute(
        &mut self,
        gpu: &mut B,
        cancel: &CancellationToken,
    ) -> Result<FrameStatus, KraftError> {
        let Self {
            effects,
            target,
            inputs,
            scratch,
            ..
        } = self;
        let target = target.as_mut().ok_or(KraftError::MissingTargetBuffer)?;
        let count = effects.len();
        if count == 0 {
            debug!("no effects to draw");
            return Ok(FrameStatus::Completed);
        }
        let mut scratch = if count > 1 {
            Some(ensure_scratch(scratch, gpu, target.size())?)
        } else {
            None
        };

        for (index, (_, effect)) in effects.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                debug!(stage = index, "frame cancelled between stages");
                return Ok(FrameStatus::Cancelled);
            }

            let stage_inputs = match (index, scratch.as_deref()) {
                (0, _) => inputs.clone(),
                (_, Some(pair)) => {
                    let source = &pair.buffers[(index - 1) % 2];
                    let texture = source
                        .texture()
                        .ok_or_else(|| KraftError::TextureUnavailable(source.label().to_string()))?;
                    vec![texture]
                }
                (_, None) => return Err(KraftError::backend("scratch buffers missing")),
            };

            let destination: &mut dyn GlBuffer<B> = match scratch.as_deref_mut() {
                Some(pair) if index + 1 < count => &mut *pair.buffers[index % 2],
                _ => &mut **target,
            };

            trace!(
                effect = effect.name(),
                stage = index,
                destination = destination.label(),
                "drawing stage"
            );
            destination.before_draw(gpu)?;
            effect.draw(
                gpu,
                DrawPass {
                    inputs: &stage_inputs,
                    target: &mut *destination,
                },
            )?;
            destination.after_draw(gpu)?;
        }
        Ok(FrameStatus::Completed)
    }

    fn destroy(&mut self, gpu: &mut B) {
        let mut owned = ResourceSet::new(true);
        for (_, effect) in self.effects.drain(..) {
            owned.register(effect);
        }
        if let Some(pair) = self.scratch.take() {
            for buffer in pair.buffers {
                owned.register(buffer);
            }
        }
        if let Some(target) = self.target.take() {
            owned.register(target);
        }
        for buffer in self.displaced.drain(..) {
            owned.register(buffer);
        }
        owned.clear(gpu);
        self.inputs.clear();
    }
}

/// A pipeline drawing its effects one after another through the scratch pair.
pub type SerialPipeline<B> = Pipeline<B, SerialChain<B>>;

impl<B: GpuBackend> Pipeline<B, SerialChain<B>> {
    pub fn serial(
        context: GpuContext<B>,
        settings: &PipelineSettings,
        fallback_mode: ErrorMode,
    ) -> Self {
        Self::new(context, SerialChain::new(), settings, fallback_mode)
    }

    /// Appends an effect to the end of the chain.
    pub fn add_effect<E: Effect<B>>(&self, effect: E) -> EffectHandle<E> {
        let id = self.with_chain_mut(|chain| chain.push(Box::new(effect)));
        debug!(effect = %id, "effect added");
        EffectHandle::new(id)
    }

    /// Unbinds the effect's inputs now and deletes it on the GPU worker
    /// before the next frame.
    pub fn remove_effect<E>(&self, handle: EffectHandle<E>) {
        let id = handle.id();
        let unbound = self.unbind(id);
        debug!(effect = %id, unbound, "effect removal queued");
        self.submit(move |gpu: &mut B, chain: &mut SerialChain<B>| {
            if let Some(mut effect) = chain.take_effect(id) {
                effect.delete(gpu, true);
                debug!(effect = %id, "effect removed");
            }
            Ok(())
        });
    }

    /// Binds `input` to one effect; `apply` receives the concrete effect.
    pub fn connect_effect_input<E, T, I, F>(
        &self,
        handle: EffectHandle<E>,
        input: Arc<I>,
        sampling: Sampling,
        mut apply: F,
    ) where
        E: Effect<B>,
        T: Send + 'static,
        I: SampledInput<T> + 'static,
        F: FnMut(&mut E, T) -> Result<(), KraftError> + Send + 'static,
    {
        let id = handle.id();
        self.bind(
            Some(id),
            input,
            sampling,
            move |chain: &mut SerialChain<B>, value: T| match chain.effect_mut::<E>(id) {
                Some(effect) => apply(effect, value),
                None => Ok(()),
            },
        );
    }

    /// Mutates an effect from the calling thread, e.g. to flip its routing.
    pub fn with_effect<E: Effect<B>, R>(
        &self,
        handle: EffectHandle<E>,
        f: impl FnOnce(&mut E) -> R,
    ) -> Option<R> {
        self.with_chain_mut(|chain| chain.effect_mut::<E>(handle.id()).map(f))
    }

    pub fn set_input_texture(&self, texture: B::Texture) {
        self.set_input_textures(vec![texture]);
    }

    pub fn set_input_textures(&self, textures: Vec<B::Texture>) {
        self.with_chain_mut(|chain| chain.inputs = textures);
    }

    /// Hands the final target to the pipeline. The swap and any scratch
    /// reallocation happen on the GPU worker before the next frame, so this is
    /// safe from any thread. The previous target is kept, not deleted; get it
    /// back with [`take_displaced_targets`](Self::take_displaced_targets).
    pub fn set_target_buffer(&self, buffer: Box<dyn GlBuffer<B>>) {
        self.submit(move |gpu: &mut B, chain: &mut SerialChain<B>| {
            chain.replace_target(gpu, buffer)
        });
    }

    /// Resizes the target and the scratch pair before the next frame.
    pub fn resize(&self, size: Size) {
        self.submit(move |gpu: &mut B, chain: &mut SerialChain<B>| chain.resize(gpu, size));
    }

    /// Returns the targets replaced since the last call, oldest first. Targets
    /// never taken back are released by `destroy`.
    pub fn take_displaced_targets(&self) -> Vec<Box<dyn GlBuffer<B>>> {
        self.with_chain_mut(|chain| std::mem::take(&mut chain.displaced))
    }

    /// `set_target_buffer` followed by `run`.
    pub fn draw_to(&self, buffer: Box<dyn GlBuffer<B>>) -> Result<FrameStatus, KraftError> {
        self.set_target_buffer(buffer);
        self.run()
    }

    pub fn target_texture(&self) -> Option<B::Texture> {
        self.with_chain(|chain| chain.target_texture())
    }
}
