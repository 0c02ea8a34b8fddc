//! Pull-based value sources sampled once per frame.
//!
//! An [`Input`] is read with `get()`. A [`SampledInput`] additionally caches
//! its value: `sample()` recomputes and stores it, `get()` returns the stored
//! value. Between two `sample()` calls `get()` never changes, which is what
//! lets several effects read "the same instant" during one frame.

use std::sync::{Arc, Mutex, PoisonError};

pub trait Input<T>: Send + Sync {
    fn get(&self) -> T;
}

pub trait SampledInput<T>: Input<T> {
    /// Recomputes the value, caches it and returns it.
    fn sample(&self) -> T;
}

/// Combinators for any shared sampled input.
pub trait SampledInputExt<T> {
    fn map<O, F>(&self, mapping: F) -> Arc<MappedInput<T, O>>
    where
        O: Clone + Send + 'static,
        F: Fn(T) -> O + Send + Sync + 'static;
}

impl<T, S> SampledInputExt<T> for Arc<S>
where
    T: Clone + Send + 'static,
    S: SampledInput<T> + 'static,
{
    fn map<O, F>(&self, mapping: F) -> Arc<MappedInput<T, O>>
    where
        O: Clone + Send + 'static,
        F: Fn(T) -> O + Send + Sync + 'static,
    {
        let source: Arc<dyn SampledInput<T>> = self.clone();
        Arc::new(MappedInput::new(source, mapping))
    }
}

/// Float-only combinators.
pub trait FloatInputExt {
    /// Folds an unbounded value into a triangle wave between `low` and `high`.
    /// See [`bounce`] for the exact formula.
    fn bounce_between(&self, low: f32, high: f32) -> Arc<MappedInput<f32, f32>>;
}

impl<S> FloatInputExt for Arc<S>
where
    S: SampledInput<f32> + 'static,
{
    fn bounce_between(&self, low: f32, high: f32) -> Arc<MappedInput<f32, f32>> {
        self.map(move |value| bounce(value, low, high))
    }
}

/// Triangle wave over `value`, rising from `low` to `high` and back at one
/// unit per unit of input.
///
/// With `range = high - low` and `phase = value mod 2*range` (euclidean, so
/// negative input folds the same way):
///
/// ```text
/// phase <  range  →  low  + phase             rising edge
/// phase >= range  →  high - (phase - range)   falling edge, mirrored at high
/// ```
///
/// A non-positive range collapses to `low`.
pub fn bounce(value: f32, low: f32, high: f32) -> f32 {
    let range = high - low;
    if range <= 0.0 || !value.is_finite() {
        return low;
    }
    let phase = value.rem_euclid(2.0 * range);
    if phase < range {
        low + phase
    } else {
        high - (phase - range)
    }
}

/// A shared sampled input pulling from `source` once per `sample()`.
pub fn sampled<T, F>(source: F) -> Arc<CachedInput<T>>
where
    T: Clone + Send + 'static,
    F: Fn() -> T + Send + Sync + 'static,
{
    Arc::new(CachedInput::from_fn(source))
}

/// Wraps a closure as a stateless [`Input`].
pub struct FnInput<F> {
    source: F,
}

impl<F> FnInput<F> {
    pub fn new(source: F) -> Self {
        Self { source }
    }
}

impl<T, F> Input<T> for FnInput<F>
where
    F: Fn() -> T + Send + Sync,
{
    fn get(&self) -> T {
        (self.source)()
    }
}

/// Caches any [`Input`] so it is only pulled when sampled.
pub struct CachedInput<T> {
    source: Arc<dyn Input<T>>,
    cached: Mutex<T>,
}

impl<T: Clone + Send> CachedInput<T> {
    pub fn new(source: Arc<dyn Input<T>>) -> Self {
        let initial = source.get();
        Self {
            source,
            cached: Mutex::new(initial),
        }
    }

    /// Shorthand for caching a closure.
    pub fn from_fn<F>(source: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
        T: 'static,
    {
        Self::new(Arc::new(FnInput::new(source)))
    }
}

impl<T: Clone + Send> Input<T> for CachedInput<T> {
    fn get(&self) -> T {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T: Clone + Send> SampledInput<T> for CachedInput<T> {
    fn sample(&self) -> T {
        let value = self.source.get();
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = value.clone();
        value
    }
}

/// A value that never changes.
#[derive(Debug, Clone)]
pub struct ConstantInput<T>(pub T);

impl<T: Clone + Send + Sync> Input<T> for ConstantInput<T> {
    fn get(&self) -> T {
        self.0.clone()
    }
}

impl<T: Clone + Send + Sync> SampledInput<T> for ConstantInput<T> {
    fn sample(&self) -> T {
        self.0.clone()
    }
}

/// A value the host sets directly, e.g. from a slider or a decoder callback.
/// New values become visible at the next `sample()`.
pub struct MutableInput<T> {
    latest: Mutex<T>,
    cached: Mutex<T>,
}

impl<T: Clone + Send> MutableInput<T> {
    pub fn new(initial: T) -> Self {
        Self {
            latest: Mutex::new(initial.clone()),
            cached: Mutex::new(initial),
        }
    }

    pub fn set(&self, value: T) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

impl<T: Clone + Send> Input<T> for MutableInput<T> {
    fn get(&self) -> T {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T: Clone + Send> SampledInput<T> for MutableInput<T> {
    fn sample(&self) -> T {
        let value = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = value.clone();
        value
    }
}

/// Lazily maps a source input. The source is shared, not owned: dropping the
/// mapped input leaves the source untouched.
pub struct MappedInput<I, O> {
    source: Arc<dyn SampledInput<I>>,
    mapping: Box<dyn Fn(I) -> O + Send + Sync>,
    cached: Mutex<O>,
}

impl<I, O> MappedInput<I, O>
where
    O: Clone + Send,
{
    pub fn new<F>(source: Arc<dyn SampledInput<I>>, mapping: F) -> Self
    where
        F: Fn(I) -> O + Send + Sync + 'static,
    {
        let initial = mapping(source.get());
        Self {
            source,
            mapping: Box::new(mapping),
            cached: Mutex::new(initial),
        }
    }
}

impl<I, O> Input<O> for MappedInput<I, O>
where
    O: Clone + Send,
{
    fn get(&self) -> O {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<I, O> SampledInput<O> for MappedInput<I, O>
where
    O: Clone + Send,
{
    fn sample(&self) -> O {
        let value = (self.mapping)(self.source.sample());
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = value.clone();
        value
    }
}
