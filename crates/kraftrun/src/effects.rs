use kraft::wgpu_backend::{FullscreenEffect, WgpuBackend};
use kraft::{KraftError, UniformKind};

/// Built-in effects the runner can chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    /// Animated colour gradient; ignores its input.
    Gradient,
    /// Brightness pulse driven by a bouncing time input.
    Pulse,
    Invert,
    Vignette,
}

const GRADIENT: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let wave = 0.5 + 0.5 * sin(params.time + in.uv.x * 6.2831853);
    return vec4<f32>(in.uv.x, in.uv.y, wave, 1.0) * params.tint;
}
"#;

const PULSE: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let color = textureSample(input0, input_sampler, in.uv);
    return vec4<f32>(color.rgb * (0.5 + 0.5 * params.amount), color.a);
}
"#;

const INVERT: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let color = textureSample(input0, input_sampler, in.uv);
    return vec4<f32>(vec3<f32>(1.0) - color.rgb, color.a);
}
"#;

const VIGNETTE: &str = r#"
@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let color = textureSample(input0, input_sampler, in.uv);
    let falloff = smoothstep(0.3, 0.8, distance(in.uv, vec2<f32>(0.5)));
    return vec4<f32>(color.rgb * (1.0 - falloff * params.strength), color.a);
}
"#;

impl EffectKind {
    pub fn label(self) -> &'static str {
        match self {
            EffectKind::Gradient => "gradient",
            EffectKind::Pulse => "pulse",
            EffectKind::Invert => "invert",
            EffectKind::Vignette => "vignette",
        }
    }

    /// Whether the effect samples `input0`, so it needs a stage input when it
    /// runs first.
    pub fn reads_input(self) -> bool {
        !matches!(self, EffectKind::Gradient)
    }

    /// Compiles the effect. Must run on the GPU worker.
    pub fn build(self, gpu: &WgpuBackend) -> Result<FullscreenEffect, KraftError> {
        let label = self.label();
        match self {
            EffectKind::Gradient => FullscreenEffect::new(
                gpu,
                label,
                GRADIENT,
                0,
                &[("time", UniformKind::Float), ("tint", UniformKind::Vec4)],
            ),
            EffectKind::Pulse => FullscreenEffect::new(
                gpu,
                label,
                PULSE,
                1,
                &[("amount", UniformKind::Float)],
            ),
            EffectKind::Invert => FullscreenEffect::new(gpu, label, INVERT, 1, &[]),
            EffectKind::Vignette => FullscreenEffect::new(
                gpu,
                label,
                VIGNETTE,
                1,
                &[("strength", UniformKind::Float)],
            ),
        }
    }
}
