//! The single serialized GPU execution stream.
//!
//! ```text
//!   caller thread(s)                       GPU worker thread
//!   ───────────────                        ─────────────────
//!   use_context(f) ──Message::Run(job)──▶  backend.make_current()
//!        │                                 f(&mut backend)
//!        ◀────────── reply (bounded 1) ─── catch_unwind result
//!   terminate()   ──Message::Terminate──▶  backend.terminate(); exit
//! ```
//!
//! The worker owns the backend outright, so nothing outside a job can touch
//! native GPU state.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use kraftconfig::ContextSettings;
use tracing::{debug, warn, Span};

use crate::buffer::GpuBackend;
use crate::error::KraftError;

type Job<B> = Box<dyn FnOnce(&mut B) + Send>;

enum Message<B> {
    Run(Job<B>),
    Terminate,
}

/// Handle to the GPU worker. Clones share the same worker.
pub struct GpuContext<B: GpuBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: GpuBackend> Clone for GpuContext<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<B: GpuBackend> {
    label: String,
    sender: Mutex<Option<Sender<Message<B>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Signalled once the worker has terminated the backend.
    stopped: Receiver<()>,
    worker_id: ThreadId,
    shutdown_timeout: Duration,
}

impl<B: GpuBackend> GpuContext<B> {
    /// Moves an already created backend onto a fresh worker thread.
    pub fn spawn(backend: B, settings: &ContextSettings) -> Result<Self, KraftError> {
        Self::spawn_with(settings, move || Ok(backend))
    }

    /// Creates the backend on the worker thread itself, for native contexts
    /// that are bound to the thread that created them.
    pub fn spawn_with<F>(settings: &ContextSettings, init: F) -> Result<Self, KraftError>
    where
        F: FnOnce() -> Result<B, KraftError> + Send + 'static,
    {
        let label = settings.label.clone();
        let (sender, receiver) = if settings.queue_capacity == 0 {
            unbounded()
        } else {
            bounded(settings.queue_capacity)
        };
        let (ready_tx, ready_rx) = bounded::<Result<(), KraftError>>(1);
        let (stopped_tx, stopped_rx) = bounded::<()>(1);
        let span = tracing::info_span!("gpu_context", label = %label);

        let worker_label = label.clone();
        let handle = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                let backend = match init() {
                    Ok(backend) => {
                        let _ = ready_tx.send(Ok(()));
                        backend
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                worker_loop(backend, receiver, &worker_label, span);
                let _ = stopped_tx.send(());
            })
            .map_err(|err| KraftError::WorkerSpawn {
                label: label.clone(),
                message: err.to_string(),
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = handle.join();
                return Err(err);
            }
            Err(_) => {
                let _ = handle.join();
                return Err(KraftError::WorkerSpawn {
                    label,
                    message: "worker exited before initialising the backend".into(),
                });
            }
        }

        debug!(label = %label, "GPU worker started");
        let worker_id = handle.thread().id();
        Ok(Self {
            inner: Arc::new(Inner {
                label,
                sender: Mutex::new(Some(sender)),
                worker: Mutex::new(Some(handle)),
                stopped: stopped_rx,
                worker_id,
                shutdown_timeout: settings.shutdown_timeout,
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_terminated(&self) -> bool {
        self.inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Runs `f` on the GPU worker with the backend made current, blocking the
    /// caller until it finishes.
    pub fn use_context<R, F>(&self, f: F) -> Result<R, KraftError>
    where
        F: FnOnce(&mut B) -> R + Send + 'static,
        R: Send + 'static,
    {
        if thread::current().id() == self.inner.worker_id {
            return Err(KraftError::ReentrantContextUse(self.inner.label.clone()));
        }

        let (reply_tx, reply_rx) = bounded::<Result<R, KraftError>>(1);
        let label = self.inner.label.clone();
        let job: Job<B> = Box::new(move |backend: &mut B| {
            let outcome = match backend.make_current() {
                Ok(()) => panic::catch_unwind(AssertUnwindSafe(|| f(backend))).map_err(
                    |payload| KraftError::WorkerPanicked {
                        label,
                        message: panic_message(payload.as_ref()),
                    },
                ),
                Err(err) => Err(err),
            };
            let _ = reply_tx.send(outcome);
        });

        self.send(Message::Run(job))?;
        reply_rx
            .recv()
            .map_err(|_| KraftError::ContextTerminated(self.inner.label.clone()))?
    }

    /// Stops the worker and destroys the native context.
    ///
    /// Calling this twice is a lifecycle error and reports
    /// [`KraftError::ContextTerminated`].
    pub fn terminate(&self) -> Result<(), KraftError> {
        self.inner.shutdown()
    }

    fn send(&self, message: Message<B>) -> Result<(), KraftError> {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .cloned()
            .ok_or_else(|| KraftError::ContextTerminated(self.inner.label.clone()))?;
        sender
            .send(message)
            .map_err(|_| KraftError::ContextTerminated(self.inner.label.clone()))
    }
}

impl<B: GpuBackend> Inner<B> {
    fn shutdown(&self) -> Result<(), KraftError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| KraftError::ContextTerminated(self.label.clone()))?;
        let _ = sender.send(Message::Terminate);
        drop(sender);

        if thread::current().id() == self.worker_id {
            return Ok(());
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // Disconnected means the worker unwound without signalling.
            match self.stopped.recv_timeout(self.shutdown_timeout) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    let _ = handle.join();
                    debug!(label = %self.label, "GPU worker joined");
                }
                Err(RecvTimeoutError::Timeout) => warn!(
                    label = %self.label,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "GPU worker did not stop before the shutdown timeout; detaching"
                ),
            }
        }
        Ok(())
    }
}

impl<B: GpuBackend> Drop for Inner<B> {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn worker_loop<B: GpuBackend>(
    mut backend: B,
    receiver: Receiver<Message<B>>,
    label: &str,
    span: Span,
) {
    let _entered = span.enter();
    for message in receiver.iter() {
        match message {
            Message::Run(job) => job(&mut backend),
            Message::Terminate => break,
        }
    }
    backend.terminate();
    debug!(label, "GPU worker stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
