use std::borrow::Cow;
use std::collections::HashMap;

use super::context::{WgpuBackend, TEXTURE_FORMAT};
use super::texture::WgpuTexture;
use super::uniforms::{UniformBlock, UniformLayout};
use crate::buffer::GlBuffer;
use crate::effect::{DrawPass, Effect, TwoInputEffect};
use crate::error::KraftError;
use crate::uniform::{Uniform, UniformData, UniformKind, UniformProgram, UniformValue};

const FLIP_UNIFORM: &str = "flip_y";
const MAX_INPUTS: usize = 2;

const VERTEX_SOURCE: &str = r#"
struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    let corner = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    var out: VertexOutput;
    out.position = vec4<f32>(corner * 2.0 - 1.0, 0.0, 1.0);
    let uv = vec2<f32>(corner.x, 1.0 - corner.y);
    out.uv = vec2<f32>(uv.x, mix(uv.y, 1.0 - uv.y, params.flip_y));
    return out;
}
"#;

/// A WGSL fragment stage drawn over a fullscreen triangle.
///
/// The fragment source must define `fs_main(in: VertexOutput) -> @location(0) vec4<f32>`.
/// It can use `params` (the declared uniforms), `input_sampler` and, per
/// declared input, `input0` / `input1`.
pub struct FullscreenEffect {
    name: String,
    inputs: usize,
    pipeline: wgpu::RenderPipeline,
    bind_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    program: UniformProgram<UniformBlock>,
    flip: Uniform<f32>,
    slots: HashMap<String, Uniform<UniformValue>>,
    deleted: bool,
}

impl FullscreenEffect {
    pub fn new(
        gpu: &WgpuBackend,
        name: &str,
        fragment: &str,
        inputs: usize,
        uniforms: &[(&str, UniformKind)],
    ) -> Result<Self, KraftError> {
        if inputs > MAX_INPUTS {
            return Err(KraftError::backend(format!(
                "effect '{name}' declares {inputs} inputs; at most {MAX_INPUTS} are supported"
            )));
        }
        let layout = UniformLayout::new(
            std::iter::once((FLIP_UNIFORM, UniformKind::Float)).chain(uniforms.iter().copied()),
        )?;
        let device = gpu.device();
        let source = compose_source(&layout, inputs, fragment);

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
        });
        let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kraft effect layout"),
            entries: &layout_entries(inputs),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kraft effect pipeline layout"),
            bind_group_layouts: &[&bind_layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(name),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: TEXTURE_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
            cache: None,
        });
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(KraftError::backend(format!(
                "failed to compile effect '{name}': {err}"
            )));
        }

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        let block = UniformBlock::new(device, gpu.queue(), name, layout);
        tracing::debug!(effect = name, inputs, uniforms = uniforms.len(), "compiled effect");

        Ok(Self {
            name: name.to_string(),
            inputs,
            pipeline,
            bind_layout,
            sampler,
            program: UniformProgram::new(block),
            flip: Uniform::required(FLIP_UNIFORM),
            slots: HashMap::new(),
            deleted: false,
        })
    }

    /// Stages a uniform value for the next draw. Unchanged values are not
    /// uploaded again. Returns whether an upload was scheduled.
    pub fn set_uniform<T: UniformData>(&mut self, name: &str, value: T) -> Result<bool, KraftError> {
        let slot = self
            .slots
            .entry(name.to_string())
            .or_insert_with(|| Uniform::required(name));
        self.program.set(slot, value.to_uniform())
    }

    pub fn input_count(&self) -> usize {
        self.inputs
    }

    pub fn upload_count(&self) -> u64 {
        self.program.sink().upload_count()
    }

    fn render(
        &mut self,
        gpu: &mut WgpuBackend,
        inputs: &[WgpuTexture],
        target: &mut dyn GlBuffer<WgpuBackend>,
    ) -> Result<(), KraftError> {
        if self.deleted {
            return Err(KraftError::backend(format!(
                "effect '{}' used after delete",
                self.name
            )));
        }
        let flip = if target.is_screen_coordinate() { 1.0 } else { 0.0 };
        self.program.set(&mut self.flip, flip)?;
        self.program.flush()?;

        let destination = target
            .texture()
            .ok_or_else(|| KraftError::TextureUnavailable(target.label().to_string()))?;
        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: self.program.sink().buffer().as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(&self.sampler),
            },
        ];
        for index in 0..self.inputs {
            let texture = inputs.get(index).ok_or_else(|| {
                KraftError::TextureUnavailable(format!("{} input{index}", self.name))
            })?;
            entries.push(wgpu::BindGroupEntry {
                binding: 2 + index as u32,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            });
        }

        let device = gpu.device();
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kraft effect bind group"),
            layout: &self.bind_layout,
            entries: &entries,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("kraft effect encoder"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(self.name.as_str()),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &destination.view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        gpu.queue().submit(Some(encoder.finish()));
        Ok(())
    }

    fn release(&mut self) {
        if !self.deleted {
            self.program.sink().destroy();
            self.deleted = true;
            tracing::debug!(effect = %self.name, "deleted effect");
        }
    }
}

fn compose_source(layout: &UniformLayout, inputs: usize, fragment: &str) -> String {
    let mut source = layout.wgsl_struct("Params");
    source.push_str("@group(0) @binding(0) var<uniform> params: Params;\n");
    source.push_str("@group(0) @binding(1) var input_sampler: sampler;\n");
    for index in 0..inputs {
        source.push_str(&format!(
            "@group(0) @binding({}) var input{index}: texture_2d<f32>;\n",
            2 + index
        ));
    }
    source.push_str(VERTEX_SOURCE);
    source.push_str(fragment);
    source
}

fn layout_entries(inputs: usize) -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = vec![
        wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        },
    ];
    for index in 0..inputs {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 2 + index as u32,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
    }
    entries
}

impl Effect<WgpuBackend> for FullscreenEffect {
    fn name(&self) -> &str {
        &self.name
    }

    fn draw(&mut self, gpu: &mut WgpuBackend, pass: DrawPass<'_, WgpuBackend>) -> Result<(), KraftError> {
        self.render(gpu, pass.inputs, pass.target)
    }

    fn delete(&mut self, _gpu: &mut WgpuBackend, _recursively: bool) {
        self.release();
    }
}

impl TwoInputEffect<WgpuBackend> for FullscreenEffect {
    fn name(&self) -> &str {
        &self.name
    }

    fn draw_pair(
        &mut self,
        gpu: &mut WgpuBackend,
        first: &WgpuTexture,
        second: &WgpuTexture,
        target: &mut dyn GlBuffer<WgpuBackend>,
    ) -> Result<(), KraftError> {
        let inputs = [first.clone(), second.clone()];
        self.render(gpu, &inputs, target)
    }

    fn delete(&mut self, _gpu: &mut WgpuBackend, _recursively: bool) {
        self.release();
    }
}
