use std::collections::HashSet;
use std::fmt::Write as _;

use crate::error::KraftError;
use crate::uniform::{UniformKind, UniformLocation, UniformSink, UniformValue};

#[derive(Debug, Clone, PartialEq)]
pub struct UniformField {
    pub name: String,
    pub kind: UniformKind,
    pub offset: u32,
}

/// Byte layout of a WGSL `var<uniform>` struct.
///
/// Members follow WGSL alignment: scalars 4, `vec2` 8, `vec3`/`vec4` and
/// matrices 16. `mat3x3` columns and array elements are padded to 16 bytes,
/// so arrays are always declared as `array<vec4<f32>, N>`.
#[derive(Debug, Clone, PartialEq)]
pub struct UniformLayout {
    fields: Vec<UniformField>,
    size: u32,
}

fn align_and_size(kind: UniformKind) -> (u32, u32) {
    match kind {
        UniformKind::Float | UniformKind::Int => (4, 4),
        UniformKind::Vec2 => (8, 8),
        UniformKind::Vec3 => (16, 12),
        UniformKind::Vec4 => (16, 16),
        UniformKind::Mat3 => (16, 48),
        UniformKind::Mat4 => (16, 64),
        UniformKind::FloatArray { len, .. } => (16, 16 * len as u32),
    }
}

fn round_up(align: u32, value: u32) -> u32 {
    value.div_ceil(align) * align
}

fn wgsl_type(kind: UniformKind) -> String {
    match kind {
        UniformKind::Float => "f32".into(),
        UniformKind::Int => "i32".into(),
        UniformKind::Vec2 => "vec2<f32>".into(),
        UniformKind::Vec3 => "vec3<f32>".into(),
        UniformKind::Vec4 => "vec4<f32>".into(),
        UniformKind::Mat3 => "mat3x3<f32>".into(),
        UniformKind::Mat4 => "mat4x4<f32>".into(),
        UniformKind::FloatArray { len, .. } => format!("array<vec4<f32>, {len}>"),
    }
}

impl UniformLayout {
    pub fn new<'a, I>(fields: I) -> Result<Self, KraftError>
    where
        I: IntoIterator<Item = (&'a str, UniformKind)>,
    {
        let mut seen = HashSet::new();
        let mut laid_out = Vec::new();
        let mut cursor = 0;
        for (name, kind) in fields {
            if !seen.insert(name) {
                return Err(KraftError::InvalidUniformShape {
                    name: name.to_string(),
                    reason: "declared twice".into(),
                });
            }
            if let UniformKind::FloatArray { components, len } = kind {
                if len == 0 || !(1..=4).contains(&components) {
                    return Err(KraftError::InvalidUniformShape {
                        name: name.to_string(),
                        reason: format!("array of {len} vec{components} elements"),
                    });
                }
            }
            let (align, size) = align_and_size(kind);
            let offset = round_up(align, cursor);
            cursor = offset + size;
            laid_out.push(UniformField {
                name: name.to_string(),
                kind,
                offset,
            });
        }
        Ok(Self {
            fields: laid_out,
            size: round_up(16, cursor.max(16)),
        })
    }

    pub fn fields(&self) -> &[UniformField] {
        &self.fields
    }

    /// Total buffer size in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }

    /// WGSL declaration of the struct, member order matching the layout.
    pub fn wgsl_struct(&self, struct_name: &str) -> String {
        let mut source = format!("struct {struct_name} {{\n");
        for field in &self.fields {
            let _ = writeln!(source, "    {}: {},", field.name, wgsl_type(field.kind));
        }
        source.push_str("};\n");
        source
    }
}

/// Bytes for `value` as laid out in a uniform buffer.
pub fn encode_value(value: &UniformValue) -> Vec<u8> {
    let padded = |values: &[f32], components: usize| -> Vec<f32> {
        values
            .chunks(components.max(1))
            .flat_map(|chunk| {
                let mut element = [0.0_f32; 4];
                element[..chunk.len()].copy_from_slice(chunk);
                element
            })
            .collect()
    };
    match value {
        UniformValue::Int(value) => bytemuck::bytes_of(value).to_vec(),
        UniformValue::Mat3(columns) => bytemuck::cast_slice(&padded(&columns[..], 3)).to_vec(),
        UniformValue::FloatArray { components, values } => {
            bytemuck::cast_slice(&padded(&values[..], usize::from(*components))).to_vec()
        }
        other => bytemuck::cast_slice(other.floats()).to_vec(),
    }
}

fn compatible(field: UniformKind, value: UniformKind) -> bool {
    match (field, value) {
        (
            UniformKind::FloatArray { len: capacity, .. },
            UniformKind::FloatArray { len, .. },
        ) => len <= capacity,
        (field, value) => field == value,
    }
}

/// A uniform buffer implementing [`UniformSink`].
pub struct UniformBlock {
    label: String,
    layout: UniformLayout,
    buffer: wgpu::Buffer,
    queue: wgpu::Queue,
    uploads: u64,
}

impl UniformBlock {
    pub fn new(device: &wgpu::Device, queue: &wgpu::Queue, label: &str, layout: UniformLayout) -> Self {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: u64::from(layout.size()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        Self {
            label: label.to_string(),
            layout,
            buffer,
            queue: queue.clone(),
            uploads: 0,
        }
    }

    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    pub fn layout(&self) -> &UniformLayout {
        &self.layout
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    pub fn destroy(&self) {
        self.buffer.destroy();
    }
}

impl UniformSink for UniformBlock {
    fn label(&self) -> &str {
        &self.label
    }

    fn resolve(&mut self, name: &str) -> Option<UniformLocation> {
        self.layout
            .position(name)
            .map(|index| UniformLocation(index as u32))
    }

    fn upload(
        &mut self,
        location: UniformLocation,
        value: &UniformValue,
    ) -> Result<(), KraftError> {
        let field = self
            .layout
            .fields
            .get(location.0 as usize)
            .ok_or_else(|| KraftError::backend(format!("no uniform at location {}", location.0)))?;
        if !compatible(field.kind, value.kind()) {
            return Err(KraftError::InvalidUniformShape {
                name: field.name.clone(),
                reason: format!("declared as {:?}, got {:?}", field.kind, value.kind()),
            });
        }
        let bytes = encode_value(value);
        self.queue
            .write_buffer(&self.buffer, u64::from(field.offset), &bytes);
        self.uploads += 1;
        tracing::trace!(block = %self.label, uniform = %field.name, bytes = bytes.len(), "uploaded uniform");
        Ok(())
    }
}
