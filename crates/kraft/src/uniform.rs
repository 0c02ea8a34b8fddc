//! Uniform upload cache.
//!
//! Each uniform is a typed [`Uniform<T>`] slot holding the last value and its
//! content hash. [`UniformProgram::set`] compares hashes and, only on change,
//! registers a draw-time upload keyed by the slot name. Setting a value three
//! times before a draw therefore results in at most one GPU call.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use tracing::trace;

use crate::actions::DrawActions;
use crate::error::KraftError;

/// Backend-specific handle of a resolved uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformKind {
    Float,
    Int,
    Vec2,
    Vec3,
    Vec4,
    Mat3,
    Mat4,
    FloatArray { components: u8, len: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Mat3([f32; 9]),
    Mat4([f32; 16]),
    FloatArray { components: u8, values: Vec<f32> },
}

impl UniformValue {
    pub fn kind(&self) -> UniformKind {
        match self {
            UniformValue::Float(_) => UniformKind::Float,
            UniformValue::Int(_) => UniformKind::Int,
            UniformValue::Vec2(_) => UniformKind::Vec2,
            UniformValue::Vec3(_) => UniformKind::Vec3,
            UniformValue::Vec4(_) => UniformKind::Vec4,
            UniformValue::Mat3(_) => UniformKind::Mat3,
            UniformValue::Mat4(_) => UniformKind::Mat4,
            UniformValue::FloatArray { components, values } => UniformKind::FloatArray {
                components: *components,
                len: values.len() / usize::from((*components).max(1)),
            },
        }
    }

    /// Backing floats for vector and matrix kinds. Integers have none.
    pub fn floats(&self) -> &[f32] {
        match self {
            UniformValue::Float(value) => std::slice::from_ref(value),
            UniformValue::Int(_) => &[],
            UniformValue::Vec2(values) => values,
            UniformValue::Vec3(values) => values,
            UniformValue::Vec4(values) => values,
            UniformValue::Mat3(values) => values,
            UniformValue::Mat4(values) => values,
            UniformValue::FloatArray { values, .. } => values,
        }
    }

    /// Hash over the raw numeric contents.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        std::mem::discriminant(self).hash(&mut hasher);
        match self {
            UniformValue::Int(value) => value.hash(&mut hasher),
            UniformValue::FloatArray { components, values } => {
                components.hash(&mut hasher);
                hash_floats(values, &mut hasher);
            }
            other => hash_floats(other.floats(), &mut hasher),
        }
        hasher.finish()
    }

    pub fn validate(&self, name: &str) -> Result<(), KraftError> {
        if let UniformValue::FloatArray { components, values } = self {
            let shape_error = |reason: String| KraftError::InvalidUniformShape {
                name: name.to_string(),
                reason,
            };
            if !(1..=4).contains(components) {
                return Err(shape_error(format!(
                    "component count {components} is outside 1..=4"
                )));
            }
            if values.is_empty() {
                return Err(shape_error("array is empty".into()));
            }
            if values.len() % usize::from(*components) != 0 {
                return Err(shape_error(format!(
                    "{} floats do not divide into vec{components} elements",
                    values.len()
                )));
            }
        }
        Ok(())
    }
}

fn hash_floats(values: &[f32], hasher: &mut DefaultHasher) {
    values.len().hash(hasher);
    for value in values {
        value.to_bits().hash(hasher);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat3(pub [f32; 9]);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mat4(pub [f32; 16]);

impl Mat4 {
    pub const IDENTITY: Mat4 = Mat4([
        1.0, 0.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]);
}

/// Packed array of `vecN` elements, e.g. a blur kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatArray {
    pub components: u8,
    pub values: Vec<f32>,
}

impl FloatArray {
    pub fn new(components: u8, values: Vec<f32>) -> Self {
        Self { components, values }
    }
}

/// Rust types that can be stored in a uniform slot.
pub trait UniformData: Clone + Send + 'static {
    fn to_uniform(&self) -> UniformValue;
}

impl UniformData for UniformValue {
    fn to_uniform(&self) -> UniformValue {
        self.clone()
    }
}

impl UniformData for f32 {
    fn to_uniform(&self) -> UniformValue {
        UniformValue::Float(*self)
    }
}

impl UniformData for i32 {
    fn to_uniform(&self) -> UniformValue {
        UniformValue::Int(*self)
    }
}

impl UniformData for bool {
    fn to_uniform(&self) -> UniformValue {
        UniformValue::Int(i32::from(*self))
    }
}

impl UniformData for [f32; 2] {
    fn to_uniform(&self) -> UniformValue {
        UniformValue::Vec2(*self)
    }
}

impl UniformData for [f32; 3] {
    fn to_uniform(&self) -> UniformValue {
        UniformValue::Vec3(*self)
    }
}

impl UniformData for [f32; 4] {
    fn to_uniform(&self) -> UniformValue {
        UniformValue::Vec4(*self)
    }
}

impl UniformData for Mat3 {
    fn to_uniform(&self) -> UniformValue {
        UniformValue::Mat3(self.0)
    }
}

impl UniformData for Mat4 {
    fn to_uniform(&self) -> UniformValue {
        UniformValue::Mat4(self.0)
    }
}

impl UniformData for FloatArray {
    fn to_uniform(&self) -> UniformValue {
        UniformValue::FloatArray {
            components: self.components,
            values: self.values.clone(),
        }
    }
}

/// A typed uniform slot owned by one effect.
#[derive(Debug, Clone)]
pub struct Uniform<T> {
    name: String,
    required: bool,
    last_value: Option<T>,
    last_hash: Option<u64>,
}

impl<T: UniformData> Uniform<T> {
    /// A uniform the program must declare; a missing one is a configuration error.
    pub fn required(name: impl Into<String>) -> Self {
        Self::with_requirement(name, true)
    }

    /// A uniform the shader may have optimised away.
    pub fn optional(name: impl Into<String>) -> Self {
        Self::with_requirement(name, false)
    }

    fn with_requirement(name: impl Into<String>, required: bool) -> Self {
        Self {
            name: name.into(),
            required,
            last_value: None,
            last_hash: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn value(&self) -> Option<&T> {
        self.last_value.as_ref()
    }
}

/// The GPU call layer for one program: resolves names and uploads values.
pub trait UniformSink: Send + 'static {
    fn label(&self) -> &str;

    fn resolve(&mut self, name: &str) -> Option<UniformLocation>;

    fn upload(&mut self, location: UniformLocation, value: &UniformValue)
        -> Result<(), KraftError>;
}

/// A program's uniform state: location cache plus pending draw-time uploads.
pub struct UniformProgram<S: UniformSink> {
    sink: S,
    locations: HashMap<String, Option<UniformLocation>>,
    pending: DrawActions<UniformProgram<S>>,
    /// Uniforms whose last upload failed; their slot hash is not on the GPU.
    stale: HashSet<String>,
}

impl<S: UniformSink> UniformProgram<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            locations: HashMap::new(),
            pending: DrawActions::new(),
            stale: HashSet::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn pending_uploads(&self) -> usize {
        self.pending.len()
    }

    /// Stores `value` in `slot`, scheduling an upload when its content changed.
    /// Returns whether an upload was scheduled.
    pub fn set<T: UniformData>(
        &mut self,
        slot: &mut Uniform<T>,
        value: T,
    ) -> Result<bool, KraftError> {
        let uniform = value.to_uniform();
        uniform.validate(&slot.name)?;
        let hash = uniform.content_hash();
        let stale = self.stale.remove(&slot.name);
        if slot.last_hash == Some(hash) && !stale {
            return Ok(false);
        }

        slot.last_hash = Some(hash);
        slot.last_value = Some(value);

        let name = slot.name.clone();
        let required = slot.required;
        self.pending
            .set(slot.name.clone(), move |program: &mut UniformProgram<S>| {
                program.upload(&name, required, &uniform)
            });
        Ok(true)
    }

    /// Performs every pending upload. Call on the GPU worker right before drawing.
    ///
    /// On error the uploads after the failed one stay pending, and the failed
    /// uniform is uploaded again the next time it is set, even to the same value.
    pub fn flush(&mut self) -> Result<usize, KraftError> {
        let mut pending = std::mem::take(&mut self.pending);
        let result = pending.run(self);
        if !pending.is_empty() {
            trace!(
                program = self.sink.label(),
                kept = pending.len(),
                "uploads kept for the next flush"
            );
            self.pending = pending;
        }
        result
    }

    /// Drops cached locations, e.g. after the program was relinked.
    pub fn invalidate_locations(&mut self) {
        self.locations.clear();
    }

    fn upload(
        &mut self,
        name: &str,
        required: bool,
        value: &UniformValue,
    ) -> Result<(), KraftError> {
        let uploaded = match self.location(name, required) {
            Ok(Some(location)) => self.sink.upload(location, value),
            Ok(None) => {
                trace!(program = self.sink.label(), uniform = name, "skipping inactive uniform");
                Ok(())
            }
            Err(err) => Err(err),
        };
        if uploaded.is_err() {
            self.stale.insert(name.to_string());
        }
        uploaded
    }

    fn location(&mut self, name: &str, required: bool) -> Result<Option<UniformLocation>, KraftError> {
        let location = match self.locations.get(name) {
            Some(cached) => *cached,
            None => {
                let resolved = self.sink.resolve(name);
                self.locations.insert(name.to_string(), resolved);
                resolved
            }
        };
        if location.is_none() && required {
            return Err(KraftError::UnresolvedUniform {
                program: self.sink.label().to_string(),
                name: name.to_string(),
            });
        }
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct SpySink {
        known: Vec<&'static str>,
        resolves: usize,
        uploads: Vec<(UniformLocation, UniformValue)>,
        fail_once: Option<UniformLocation>,
    }

    impl UniformSink for SpySink {
        fn label(&self) -> &str {
            "spy"
        }

        fn resolve(&mut self, name: &str) -> Option<UniformLocation> {
            self.resolves += 1;
            self.known
                .iter()
                .position(|known| *known == name)
                .map(|index| UniformLocation(index as u32))
        }

        fn upload(
            &mut self,
            location: UniformLocation,
            value: &UniformValue,
        ) -> Result<(), KraftError> {
            if self.fail_once == Some(location) {
                self.fail_once = None;
                return Err(KraftError::backend("upload rejected"));
            }
            self.uploads.push((location, value.clone()));
            Ok(())
        }
    }

    fn program() -> UniformProgram<SpySink> {
        UniformProgram::new(SpySink {
            known: vec!["color", "time"],
            ..SpySink::default()
        })
    }

    #[test]
    fn identical_values_upload_once() {
        let mut program = program();
        let mut color = Uniform::required("color");
        assert!(program.set(&mut color, [1.0, 0.0, 0.0, 1.0]).unwrap());
        assert!(!program.set(&mut color, [1.0, 0.0, 0.0, 1.0]).unwrap());
        assert!(!program.set(&mut color, [1.0, 0.0, 0.0, 1.0]).unwrap());
        assert_eq!(program.flush().unwrap(), 1);
        assert_eq!(program.sink().uploads.len(), 1);
    }

    #[test]
    fn changing_values_collapse_to_last() {
        let mut program = program();
        let mut time = Uniform::required("time");
        program.set(&mut time, 1.0_f32).unwrap();
        program.set(&mut time, 2.0_f32).unwrap();
        program.set(&mut time, 3.0_f32).unwrap();
        program.flush().unwrap();
        assert_eq!(
            program.sink().uploads,
            vec![(UniformLocation(1), UniformValue::Float(3.0))]
        );
        assert_eq!(time.value(), Some(&3.0));
    }

    #[test]
    fn unchanged_value_after_flush_is_not_reuploaded() {
        let mut program = program();
        let mut time = Uniform::required("time");
        program.set(&mut time, 0.5_f32).unwrap();
        program.flush().unwrap();
        program.set(&mut time, 0.5_f32).unwrap();
        assert_eq!(program.flush().unwrap(), 0);
        assert_eq!(program.sink().uploads.len(), 1);
    }

    #[test]
    fn locations_resolve_once() {
        let mut program = program();
        let mut time = Uniform::required("time");
        for frame in 0..4 {
            program.set(&mut time, frame as f32).unwrap();
            program.flush().unwrap();
        }
        assert_eq!(program.sink().resolves, 1);
        assert_eq!(program.sink().uploads.len(), 4);
    }

    #[test]
    fn missing_required_uniform_fails_on_flush() {
        let mut program = program();
        let mut radius = Uniform::required("radius");
        program.set(&mut radius, 4.0_f32).unwrap();
        let err = program.flush().unwrap_err();
        assert_eq!(
            err,
            KraftError::UnresolvedUniform {
                program: "spy".into(),
                name: "radius".into(),
            }
        );
    }

    #[test]
    fn failed_upload_is_retried_with_the_rest() {
        let mut program = program();
        program.sink_mut().fail_once = Some(UniformLocation(0));
        let mut color = Uniform::required("color");
        let mut time = Uniform::required("time");

        program.set(&mut color, [1.0, 0.0, 0.0, 1.0]).unwrap();
        program.set(&mut time, 2.0_f32).unwrap();
        assert_eq!(program.flush().unwrap_err(), KraftError::backend("upload rejected"));
        assert!(program.sink().uploads.is_empty());
        assert_eq!(program.pending_uploads(), 1);

        assert!(program.set(&mut color, [1.0, 0.0, 0.0, 1.0]).unwrap());
        assert!(!program.set(&mut time, 2.0_f32).unwrap());
        assert_eq!(program.flush().unwrap(), 2);
        assert_eq!(
            program.sink().uploads,
            vec![
                (UniformLocation(1), UniformValue::Float(2.0)),
                (UniformLocation(0), UniformValue::Vec4([1.0, 0.0, 0.0, 1.0])),
            ]
        );

        assert!(!program.set(&mut color, [1.0, 0.0, 0.0, 1.0]).unwrap());
        assert_eq!(program.flush().unwrap(), 0);
    }

    #[test]
    fn missing_optional_uniform_is_skipped() {
        let mut program = program();
        let mut radius = Uniform::optional("radius");
        program.set(&mut radius, 4.0_f32).unwrap();
        assert_eq!(program.flush().unwrap(), 1);
        assert!(program.sink().uploads.is_empty());
    }

    #[test]
    fn malformed_array_is_rejected_before_caching() {
        let mut program = program();
        let mut kernel = Uniform::required("color");
        let err = program
            .set(&mut kernel, FloatArray::new(4, vec![1.0, 2.0, 3.0]))
            .unwrap_err();
        assert!(matches!(err, KraftError::InvalidUniformShape { .. }));
        assert!(kernel.value().is_none());
        assert_eq!(program.pending_uploads(), 0);
    }

    #[test]
    fn hashes_cover_backing_arrays() {
        let a = Mat4::IDENTITY.to_uniform();
        let mut shifted = Mat4::IDENTITY;
        shifted.0[12] = 0.25;
        let b = shifted.to_uniform();
        assert_ne!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash(), Mat4::IDENTITY.to_uniform().content_hash());
        assert_ne!(
            UniformValue::Float(1.0).content_hash(),
            UniformValue::Int(1).content_hash()
        );
    }

    #[test]
    fn array_kind_reports_element_count() {
        let value = FloatArray::new(2, vec![0.0; 8]).to_uniform();
        assert_eq!(
            value.kind(),
            UniformKind::FloatArray {
                components: 2,
                len: 4
            }
        );
    }
}
