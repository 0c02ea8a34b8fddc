use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use kraft::wgpu_backend::{read_rgba, spawn_headless, FullscreenEffect, TextureBuffer, WgpuBackend};
use kraft::{
    Clock, ErrorMode, FloatInputExt, FrameStatus, GlBuffer, GpuContext, KraftConfig, KraftError,
    ManualClock, MonotonicClock, Sampling, SerialPipeline, Size, TimeInput,
};
use kraftconfig::LoggingSettings;
use tracing_subscriber::EnvFilter;

use crate::cli::Args;
use crate::effects::EffectKind;

const TINT: [f32; 4] = [1.0, 0.85, 0.7, 1.0];
const VIGNETTE_STRENGTH: f32 = 0.6;

pub fn run(args: Args) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    initialise_tracing(&config.logging)?;

    if let Some(step) = args.step {
        if !step.is_finite() || step <= 0.0 {
            bail!("--step must be a positive number of seconds, got {step}");
        }
    }
    check_chain(&args.effects, args.input.is_some())?;

    let mode = if args.swallow_errors {
        ErrorMode::Swallow
    } else {
        config.error_mode()
    };

    let context = spawn_headless(&config.context).context("failed to start GPU worker")?;
    let pipeline = SerialPipeline::serial(context.clone(), &config.pipeline, mode);

    let manual = args.step.map(|_| Arc::new(ManualClock::new()));
    let clock: Arc<dyn Clock> = match &manual {
        Some(clock) => clock.clone(),
        None => Arc::new(MonotonicClock::new()),
    };
    let time = Arc::new(TimeInput::new(clock));

    for kind in &args.effects {
        let kind = *kind;
        let effect = context
            .use_context(move |gpu| kind.build(gpu))?
            .with_context(|| format!("failed to build effect '{}'", kind.label()))?;
        let handle = pipeline.add_effect(effect);
        match kind {
            EffectKind::Gradient => {
                pipeline
                    .with_effect(handle, |effect| effect.set_uniform("tint", TINT))
                    .transpose()?;
                pipeline.connect_effect_input(
                    handle,
                    Arc::clone(&time),
                    Sampling::Internal,
                    |effect: &mut FullscreenEffect, seconds: f32| {
                        effect.set_uniform("time", seconds).map(|_| ())
                    },
                );
            }
            EffectKind::Pulse => {
                pipeline.connect_effect_input(
                    handle,
                    time.bounce_between(0.0, 1.0),
                    Sampling::Internal,
                    |effect: &mut FullscreenEffect, amount: f32| {
                        effect.set_uniform("amount", amount).map(|_| ())
                    },
                );
            }
            EffectKind::Vignette => {
                pipeline
                    .with_effect(handle, |effect| {
                        effect.set_uniform("strength", VIGNETTE_STRENGTH)
                    })
                    .transpose()?;
            }
            EffectKind::Invert => {}
        }
    }

    let input = match &args.input {
        Some(path) => {
            let buffer = upload_input(&context, path)?;
            let texture = buffer
                .texture()
                .context("input texture was released before binding")?;
            pipeline.set_input_texture(texture);
            Some(buffer)
        }
        None => None,
    };

    let size = args.size;
    let target = context.use_context(move |gpu| TextureBuffer::new(gpu, "kraftrun target", size))?;
    pipeline.set_target_buffer(Box::new(target));

    tracing::info!(
        effects = ?args.effects,
        %size,
        frames = args.frames,
        ?mode,
        "rendering effect chain"
    );

    time.start();
    let midpoint = args.frames / 2;
    let mut completed = 0u32;
    let mut failed = 0u32;
    let mut cancelled = 0u32;
    for frame in 0..args.frames {
        if let (Some(clock), Some(step)) = (&manual, args.step) {
            if frame > 0 {
                clock.advance(Duration::from_secs_f64(step));
            }
        }
        if frame == midpoint {
            if let Some(resized) = args.resize {
                tracing::info!(frame, size = %resized, "resizing target");
                pipeline.resize(resized);
            }
        }
        match pipeline.run()? {
            FrameStatus::Completed => completed += 1,
            FrameStatus::Failed => failed += 1,
            FrameStatus::Cancelled => cancelled += 1,
        }
        tracing::debug!(frame, "frame finished");
    }
    time.pause();

    tracing::info!(completed, failed, cancelled, "render finished");

    if let Some(path) = &args.output {
        export_png(&pipeline, path)?;
    }

    pipeline.destroy()?;
    if let Some(mut buffer) = input {
        context.use_context(move |gpu| buffer.delete(gpu))?;
    }
    context.terminate()?;
    Ok(())
}

fn check_chain(effects: &[EffectKind], has_input: bool) -> Result<()> {
    let Some(first) = effects.first() else {
        bail!("at least one effect is required");
    };
    if first.reads_input() && !has_input {
        bail!(
            "effect '{}' samples an input texture; pass --input or start the chain with 'gradient'",
            first.label()
        );
    }
    Ok(())
}

fn upload_input(context: &GpuContext<WgpuBackend>, path: &Path) -> Result<TextureBuffer> {
    let image = image::open(path)
        .with_context(|| format!("failed to read input image {}", path.display()))?
        .to_rgba8();
    let size = Size::new(image.width(), image.height());
    let pixels = image.into_raw();
    let buffer = context.use_context(move |gpu| -> Result<TextureBuffer, KraftError> {
        let buffer = TextureBuffer::new(gpu, "kraftrun input", size);
        buffer.write_rgba(gpu, &pixels)?;
        Ok(buffer)
    })??;
    tracing::info!(path = %path.display(), %size, "uploaded input image");
    Ok(buffer)
}

fn load_config(path: Option<&Path>) -> Result<KraftConfig> {
    match path {
        Some(path) => KraftConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(KraftConfig::default()),
    }
}

fn initialise_tracing(logging: &LoggingSettings) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&logging.filter)
            .with_context(|| format!("invalid logging.filter {:?}", logging.filter))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.with_target)
        .init();
    Ok(())
}

fn export_png(pipeline: &SerialPipeline<WgpuBackend>, path: &Path) -> Result<()> {
    let texture = pipeline
        .target_texture()
        .context("pipeline has no target to export")?;
    let size = texture.size();
    let pixels = pipeline
        .context()
        .use_context(move |gpu| read_rgba(gpu, &texture))??;
    let image = image::RgbaImage::from_raw(size.width, size.height, pixels)
        .context("readback returned a truncated frame")?;
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), %size, "exported final frame");
    Ok(())
}
