use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kraftconfig::ContextSettings;

use super::texture::{TextureBuffer, WgpuTexture};
use crate::buffer::{GlBuffer, GpuBackend, Size};
use crate::context::GpuContext;
use crate::error::KraftError;

/// Format of every texture the backend allocates.
pub(crate) const TEXTURE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Headless `wgpu` device and queue, owned by the GPU worker.
pub struct WgpuBackend {
    _instance: wgpu::Instance,
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_name: String,
    lost: Arc<AtomicBool>,
}

impl WgpuBackend {
    pub fn headless(settings: &ContextSettings) -> Result<Self, KraftError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::default(),
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| KraftError::backend(format!("failed to find a GPU adapter: {err}")))?;

        let info = adapter.get_info();
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "selected GPU adapter"
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some(settings.label.as_str()),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| KraftError::backend(format!("failed to create GPU device: {err}")))?;

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            if matches!(reason, wgpu::DeviceLostReason::Destroyed) {
                tracing::debug!(%message, "GPU device destroyed");
            } else {
                tracing::warn!(?reason, %message, "GPU device lost");
            }
            lost_flag.store(true, Ordering::SeqCst);
        });

        tracing::info!(adapter = %info.name, label = %settings.label, "initialised headless GPU device");
        Ok(Self {
            _instance: instance,
            device,
            queue,
            adapter_name: info.name,
            lost,
        })
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn texture_format(&self) -> wgpu::TextureFormat {
        TEXTURE_FORMAT
    }
}

/// Spawns a GPU worker whose backend is created on the worker thread.
pub fn spawn_headless(settings: &ContextSettings) -> Result<GpuContext<WgpuBackend>, KraftError> {
    let init_settings = settings.clone();
    GpuContext::spawn_with(settings, move || WgpuBackend::headless(&init_settings))
}

impl GpuBackend for WgpuBackend {
    type Texture = WgpuTexture;

    fn make_current(&mut self) -> Result<(), KraftError> {
        if self.lost.load(Ordering::SeqCst) {
            return Err(KraftError::backend("GPU device lost"));
        }
        Ok(())
    }

    fn allocate_buffer(
        &mut self,
        label: &str,
        size: Size,
    ) -> Result<Box<dyn GlBuffer<Self>>, KraftError> {
        Ok(Box::new(TextureBuffer::new(self, label, size)))
    }

    fn copy_texture(
        &mut self,
        source: &WgpuTexture,
        target: &mut dyn GlBuffer<Self>,
    ) -> Result<(), KraftError> {
        let destination = target
            .texture()
            .ok_or_else(|| KraftError::TextureUnavailable(target.label().to_string()))?;
        let source_size = source.texture.size();
        let target_size = target.size();
        let extent = wgpu::Extent3d {
            width: source_size.width.min(target_size.width),
            height: source_size.height.min(target_size.height),
            depth_or_array_layers: 1,
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("kraft copy encoder"),
            });
        encoder.copy_texture_to_texture(
            source.texture.as_image_copy(),
            destination.texture.as_image_copy(),
            extent,
        );
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn terminate(&mut self) {
        tracing::debug!(adapter = %self.adapter_name, "destroying GPU device");
        self.device.destroy();
    }
}
