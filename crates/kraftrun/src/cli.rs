use std::path::PathBuf;

use clap::Parser;
use kraft::Size;

use crate::effects::EffectKind;

#[derive(Parser, Debug)]
#[command(
    name = "kraftrun",
    author,
    version,
    about = "Render a chain of shader effects headlessly"
)]
pub struct Args {
    /// Configuration TOML (logging, error mode, GPU worker, frame budget).
    #[arg(long, value_name = "PATH", env = "KRAFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Render resolution (e.g. `1280x720`).
    #[arg(
        long,
        value_name = "WIDTHxHEIGHT",
        value_parser = parse_size,
        default_value = "640x360"
    )]
    pub size: Size,

    /// Number of frames to render.
    #[arg(long, value_name = "COUNT", default_value_t = 60)]
    pub frames: u32,

    /// Comma-separated effect chain: `gradient`, `pulse`, `invert`, `vignette`.
    #[arg(
        long,
        value_name = "LIST",
        value_delimiter = ',',
        value_parser = parse_effect,
        default_value = "gradient,pulse,invert,vignette"
    )]
    pub effects: Vec<EffectKind>,

    /// Advance a simulated clock by this many seconds per frame instead of
    /// following wall-clock time.
    #[arg(long, value_name = "SECONDS")]
    pub step: Option<f64>,

    /// Resize the target halfway through the run (e.g. `320x180`).
    #[arg(long, value_name = "WIDTHxHEIGHT", value_parser = parse_size)]
    pub resize: Option<Size>,

    /// Image bound as the first effect's input texture.
    #[arg(long, value_name = "PATH")]
    pub input: Option<PathBuf>,

    /// Write the final frame to this PNG file.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Log and skip failed frames instead of aborting.
    #[arg(long)]
    pub swallow_errors: bool,
}

pub fn parse() -> Args {
    Args::parse()
}

pub fn parse_size(value: &str) -> Result<Size, String> {
    let trimmed = value.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X'])
        .ok_or_else(|| "expected WxH format, e.g. 1920x1080".to_string())?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| format!("invalid width '{}'", width.trim()))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| format!("invalid height '{}'", height.trim()))?;
    if width == 0 || height == 0 {
        return Err("dimensions must be greater than zero".to_string());
    }
    Ok(Size::new(width, height))
}

pub fn parse_effect(value: &str) -> Result<EffectKind, String> {
    let normalized = value.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "gradient" => Ok(EffectKind::Gradient),
        "pulse" => Ok(EffectKind::Pulse),
        "invert" => Ok(EffectKind::Invert),
        "vignette" => Ok(EffectKind::Vignette),
        "" => Err("effect name must not be empty".to_string()),
        other => Err(format!(
            "unknown effect '{other}'; expected gradient, pulse, invert, or vignette"
        )),
    }
}
