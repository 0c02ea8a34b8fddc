//! Scoped release of GPU-owned objects.

use tracing::debug;

use crate::buffer::{GlBuffer, GpuBackend};
use crate::effect::Effect;

/// Anything holding GPU-side state that must be released on the worker.
pub trait KraftResource<B: GpuBackend>: Send {
    /// Releases the GPU state. `recursively` also releases owned children.
    fn release(&mut self, gpu: &mut B, recursively: bool);
}

impl<B: GpuBackend> KraftResource<B> for Box<dyn GlBuffer<B>> {
    fn release(&mut self, gpu: &mut B, _recursively: bool) {
        self.delete(gpu);
    }
}

impl<B: GpuBackend> KraftResource<B> for Box<dyn Effect<B>> {
    fn release(&mut self, gpu: &mut B, recursively: bool) {
        self.delete(gpu, recursively);
    }
}

/// Flat registry for bulk release.
///
/// The set owns what is registered, so a resource cannot be registered twice
/// and cannot be released by anyone else.
pub struct ResourceSet<B: GpuBackend> {
    resources: Vec<Box<dyn KraftResource<B>>>,
    recursively: bool,
}

impl<B: GpuBackend> ResourceSet<B> {
    pub fn new(recursively: bool) -> Self {
        Self {
            resources: Vec::new(),
            recursively,
        }
    }

    pub fn register<R>(&mut self, resource: R)
    where
        R: KraftResource<B> + 'static,
    {
        self.resources.push(Box::new(resource));
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Releases every registered resource and empties the set.
    pub fn clear(&mut self, gpu: &mut B) {
        let count = self.resources.len();
        for mut resource in self.resources.drain(..) {
            resource.release(gpu, self.recursively);
        }
        if count > 0 {
            debug!(count, "released resource set");
        }
    }
}

impl<B: GpuBackend> KraftResource<B> for ResourceSet<B> {
    fn release(&mut self, gpu: &mut B, _recursively: bool) {
        self.clear(gpu);
    }
}

struct ReleaseGuard<'a, B: GpuBackend, R: KraftResource<B>> {
    gpu: &'a mut B,
    resource: R,
    recursively: bool,
}

impl<B: GpuBackend, R: KraftResource<B>> Drop for ReleaseGuard<'_, B, R> {
    fn drop(&mut self) {
        self.resource.release(self.gpu, self.recursively);
    }
}

/// Runs `f` with `resource` and releases it afterwards, including when `f` panics.
pub fn scoped<B, R, T, F>(gpu: &mut B, resource: R, recursively: bool, f: F) -> T
where
    B: GpuBackend,
    R: KraftResource<B>,
    F: FnOnce(&mut B, &mut R) -> T,
{
    let mut guard = ReleaseGuard {
        gpu,
        resource,
        recursively,
    };
    let ReleaseGuard { gpu, resource, .. } = &mut guard;
    f(gpu, resource)
}
