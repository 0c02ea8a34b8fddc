//! The frame scheduler shared by every pipeline variant.
//!
//! Each [`Pipeline::run`] is one job on the GPU worker that walks
//! `Idle → Sampling → DrainingDeferred → Executing → Idle`:
//!
//! - **Sampling** samples every internal input once, then runs the setup
//!   actions bound with `connect_input` so sampled values reach effect state.
//! - **DrainingDeferred** runs, in FIFO order, the tasks other threads queued
//!   through [`DeferredSender`] since the previous frame.
//! - **Executing** hands the GPU to the chain (see [`ChainExecutor`]).
//!
//! Tasks queued while a frame is executing land in the next frame.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use kraftconfig::{ErrorMode, KraftConfig, PipelineSettings};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn, Span};

use crate::buffer::GpuBackend;
use crate::context::GpuContext;
use crate::effect::EffectId;
use crate::error::KraftError;
use crate::input::SampledInput;

/// What a concrete pipeline does in the `Executing` phase.
pub trait ChainExecutor<B: GpuBackend>: Send + 'static {
    /// Draws one frame. Implementations check `cancel` between stages.
    fn execute(
        &mut self,
        gpu: &mut B,
        cancel: &CancellationToken,
    ) -> Result<FrameStatus, KraftError>;

    /// Releases every effect and buffer the chain owns.
    fn destroy(&mut self, gpu: &mut B);
}

/// Outcome of one [`Pipeline::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Completed,
    /// The caller cancelled; the frame may be partially drawn.
    Cancelled,
    /// A non-fatal error was logged and swallowed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Sampling = 1,
    DrainingDeferred = 2,
    Executing = 3,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Sampling,
            2 => Phase::DrainingDeferred,
            3 => Phase::Executing,
            _ => Phase::Idle,
        }
    }
}

/// Who drives `sample()` on a connected input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sampling {
    /// The pipeline samples the input once at the start of every frame.
    #[default]
    Internal,
    /// The host samples it on its own cadence, e.g. a video decoder.
    External,
}

type DeferredTask<B, S> = Box<dyn FnOnce(&mut B, &mut S) -> Result<(), KraftError> + Send>;
type DeferredQueue<B, S> = Arc<Mutex<VecDeque<DeferredTask<B, S>>>>;
type SetupAction<S> = Box<dyn FnMut(&mut S) -> Result<(), KraftError> + Send>;

/// Cloneable handle for queueing GPU work from any thread.
pub struct DeferredSender<B: GpuBackend, S> {
    queue: DeferredQueue<B, S>,
    destroyed: Arc<AtomicBool>,
}

impl<B: GpuBackend, S> Clone for DeferredSender<B, S> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            destroyed: Arc::clone(&self.destroyed),
        }
    }
}

impl<B: GpuBackend, S: Send + 'static> DeferredSender<B, S> {
    /// Queues `task` to run on the GPU worker before the next frame executes.
    /// Returns `false`, dropping the task, once the pipeline is destroyed.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut B, &mut S) -> Result<(), KraftError> + Send + 'static,
    {
        if self.destroyed.load(Ordering::Acquire) {
            warn!("deferred task dropped: pipeline already destroyed");
            return false;
        }
        lock(&self.queue).push_back(Box::new(task));
        true
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }
}

struct Binding<S> {
    owner: Option<EffectId>,
    /// Identity of the input plus its sampler, for internally sampled inputs.
    sampler: Option<(usize, Box<dyn Fn() + Send>)>,
    apply: SetupAction<S>,
}

struct Frame<S> {
    chain: S,
    bindings: Vec<Binding<S>>,
}

impl<S> Frame<S> {
    fn sample_and_apply(&mut self) -> Result<usize, KraftError> {
        let mut sampled = HashSet::new();
        for binding in &self.bindings {
            if let Some((key, sample)) = &binding.sampler {
                if sampled.insert(*key) {
                    sample();
                }
            }
        }
        for binding in &mut self.bindings {
            (binding.apply)(&mut self.chain)?;
        }
        Ok(sampled.len())
    }
}

/// Schedules frames of a chain `S` on a shared [`GpuContext`].
pub struct Pipeline<B: GpuBackend, S: ChainExecutor<B>> {
    label: String,
    context: GpuContext<B>,
    frame: Arc<Mutex<Frame<S>>>,
    deferred: DeferredQueue<B, S>,
    phase: Arc<AtomicU8>,
    destroyed: Arc<AtomicBool>,
    cancel: CancellationToken,
    error_mode: ErrorMode,
    frame_budget: Option<Duration>,
    span: Span,
}

impl<B: GpuBackend, S: ChainExecutor<B>> Pipeline<B, S> {
    /// `fallback_mode` applies when `settings` carries no error-mode override.
    pub fn new(
        context: GpuContext<B>,
        chain: S,
        settings: &PipelineSettings,
        fallback_mode: ErrorMode,
    ) -> Self {
        let span = tracing::info_span!(
            "pipeline",
            label = %settings.label,
            context = %context.label()
        );
        Self {
            label: settings.label.clone(),
            context,
            frame: Arc::new(Mutex::new(Frame {
                chain,
                bindings: Vec::new(),
            })),
            deferred: Arc::new(Mutex::new(VecDeque::new())),
            phase: Arc::new(AtomicU8::new(Phase::Idle as u8)),
            destroyed: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            error_mode: settings.error_mode.unwrap_or(fallback_mode),
            frame_budget: settings.frame_budget,
            span,
        }
    }

    pub fn from_config(context: GpuContext<B>, chain: S, config: &KraftConfig) -> Self {
        Self::new(context, chain, &config.pipeline, config.errors.mode)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn context(&self) -> &GpuContext<B> {
        &self.context
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.error_mode
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Token observed by [`run`](Pipeline::run). Cancelling it aborts the
    /// frame in flight and every later frame; use
    /// [`run_with`](Pipeline::run_with) for per-frame tokens.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn deferred_sender(&self) -> DeferredSender<B, S> {
        DeferredSender {
            queue: Arc::clone(&self.deferred),
            destroyed: Arc::clone(&self.destroyed),
        }
    }

    /// Queues a task for the GPU worker. Safe from any thread. Returns
    /// `false` once the pipeline is destroyed.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut B, &mut S) -> Result<(), KraftError> + Send + 'static,
    {
        self.deferred_sender().submit(task)
    }

    /// Binds `input` to the chain. `apply` runs every frame with the input's
    /// current value, after internal inputs were sampled.
    pub fn connect_input<T, I, F>(&self, input: Arc<I>, sampling: Sampling, apply: F)
    where
        T: Send + 'static,
        I: SampledInput<T> + 'static,
        F: FnMut(&mut S, T) -> Result<(), KraftError> + Send + 'static,
    {
        self.bind(None, input, sampling, apply);
    }

    pub(crate) fn bind<T, I, F>(
        &self,
        owner: Option<EffectId>,
        input: Arc<I>,
        sampling: Sampling,
        mut apply: F,
    ) where
        T: Send + 'static,
        I: SampledInput<T> + 'static,
        F: FnMut(&mut S, T) -> Result<(), KraftError> + Send + 'static,
    {
        let sampler = match sampling {
            Sampling::Internal => {
                let key = Arc::as_ptr(&input) as *const () as usize;
                let source = Arc::clone(&input);
                let sample: Box<dyn Fn() + Send> = Box::new(move || {
                    source.sample();
                });
                Some((key, sample))
            }
            Sampling::External => None,
        };
        let binding = Binding {
            owner,
            sampler,
            apply: Box::new(move |chain: &mut S| apply(chain, input.get())),
        };
        lock(&self.frame).bindings.push(binding);
    }

    /// Drops every input binding owned by `owner`.
    pub(crate) fn unbind(&self, owner: EffectId) -> usize {
        let mut frame = lock(&self.frame);
        let before = frame.bindings.len();
        frame.bindings.retain(|binding| binding.owner != Some(owner));
        before - frame.bindings.len()
    }

    /// Reads chain state on the calling thread, waiting for any frame in flight.
    pub fn with_chain<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&lock(&self.frame).chain)
    }

    /// Mutates chain state that needs no GPU call, e.g. effect parameters.
    pub(crate) fn with_chain_mut<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut lock(&self.frame).chain)
    }

    /// Runs one frame observing the pipeline's own cancel token.
    pub fn run(&self) -> Result<FrameStatus, KraftError> {
        self.run_with(&self.cancel)
    }

    /// Runs one frame, aborting between stages once `cancel` fires.
    pub fn run_with(&self, cancel: &CancellationToken) -> Result<FrameStatus, KraftError> {
        let _entered = self.span.enter();
        if self.is_destroyed() {
            return Err(KraftError::PipelineDestroyed(self.label.clone()));
        }
        if cancel.is_cancelled() {
            debug!("frame cancelled before it started");
            return Ok(FrameStatus::Cancelled);
        }

        let started = Instant::now();
        let frame = Arc::clone(&self.frame);
        let deferred = Arc::clone(&self.deferred);
        let phase = Arc::clone(&self.phase);
        let token = cancel.clone();
        let span = self.span.clone();
        let outcome = self
            .context
            .use_context(move |gpu: &mut B| {
                let _entered = span.enter();
                run_frame(gpu, &frame, &deferred, &phase, &token)
            })
            .and_then(|result| result);
        self.phase.store(Phase::Idle as u8, Ordering::Release);

        let elapsed = started.elapsed();
        if let Some(budget) = self.frame_budget {
            if elapsed > budget {
                warn!(
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    budget_ms = budget.as_secs_f64() * 1000.0,
                    "frame exceeded its budget"
                );
            }
        }
        self.settle(outcome)
    }

    /// Drains deferred tasks, then releases every effect and buffer the chain
    /// owns. Later runs fail with [`KraftError::PipelineDestroyed`].
    pub fn destroy(&self) -> Result<(), KraftError> {
        let _entered = self.span.enter();
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(KraftError::PipelineDestroyed(self.label.clone()));
        }
        let frame = Arc::clone(&self.frame);
        let deferred = Arc::clone(&self.deferred);
        let span = self.span.clone();
        self.context.use_context(move |gpu: &mut B| {
            let _entered = span.enter();
            let mut frame = lock(&frame);
            let tasks = std::mem::take(&mut *lock(&deferred));
            for task in tasks {
                if let Err(err) = task(gpu, &mut frame.chain) {
                    warn!(error = %err, "deferred task failed during destroy");
                }
            }
            frame.bindings.clear();
            frame.chain.destroy(gpu);
            debug!("pipeline destroyed");
        })
    }

    fn settle(&self, outcome: Result<FrameStatus, KraftError>) -> Result<FrameStatus, KraftError> {
        match outcome {
            Ok(FrameStatus::Cancelled) => {
                debug!("frame cancelled");
                Ok(FrameStatus::Cancelled)
            }
            Ok(status) => Ok(status),
            Err(err) if err.is_fatal() => {
                error!(error = %err, "frame aborted");
                Err(err)
            }
            Err(err) => {
                error!(error = %err, details = ?err, mode = ?self.error_mode, "frame failed");
                match self.error_mode {
                    ErrorMode::Propagate => Err(err),
                    ErrorMode::Swallow => Ok(FrameStatus::Failed),
                }
            }
        }
    }
}

impl<B: GpuBackend, S: ChainExecutor<B>> fmt::Debug for Pipeline<B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("label", &self.label)
            .field("phase", &self.phase())
            .field("destroyed", &self.is_destroyed())
            .field("error_mode", &self.error_mode)
            .finish()
    }
}

struct PhaseGuard<'a>(&'a AtomicU8);

impl PhaseGuard<'_> {
    fn enter(&self, next: Phase) {
        let previous = Phase::from_u8(self.0.swap(next as u8, Ordering::AcqRel));
        trace!(from = ?previous, to = ?next, "pipeline phase");
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.enter(Phase::Idle);
    }
}

fn run_frame<B, S>(
    gpu: &mut B,
    frame: &Mutex<Frame<S>>,
    deferred: &Mutex<VecDeque<DeferredTask<B, S>>>,
    phase: &AtomicU8,
    cancel: &CancellationToken,
) -> Result<FrameStatus, KraftError>
where
    B: GpuBackend,
    S: ChainExecutor<B>,
{
    let mut frame = lock(frame);
    let phase = PhaseGuard(phase);

    phase.enter(Phase::Sampling);
    let sampled = frame.sample_and_apply()?;
    trace!(inputs = sampled, "sampled inputs");
    if cancel.is_cancelled() {
        return Ok(FrameStatus::Cancelled);
    }

    phase.enter(Phase::DrainingDeferred);
    let mut tasks = std::mem::take(&mut *lock(deferred));
    if !tasks.is_empty() {
        trace!(tasks = tasks.len(), "draining deferred tasks");
    }
    while let Some(task) = tasks.pop_front() {
        if let Err(err) = task(gpu, &mut frame.chain) {
            // Keep the rest for the next frame, ahead of anything queued since.
            let mut queue = lock(deferred);
            tasks.append(&mut queue);
            *queue = tasks;
            return Err(err);
        }
    }
    if cancel.is_cancelled() {
        return Ok(FrameStatus::Cancelled);
    }

    phase.enter(Phase::Executing);
    frame.chain.execute(gpu, cancel)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
