use anyhow::{anyhow, Context, Result};
use image::RgbaImage;
use tracing::{debug, warn};
use xcap::Monitor;

use crate::CaptureProvider;

/// Default capture capability: grabs the primary monitor via `xcap`.
/// Single-display only; on a multi-monitor system the primary one wins.
#[derive(Debug, Default)]
pub struct ScreenProvider;

impl ScreenProvider {
    pub fn new() -> Self {
        Self
    }

    fn primary_monitor() -> Result<Monitor> {
        let monitors = Monitor::all().context("Failed to enumerate monitors")?;
        if monitors.is_empty() {
            return Err(anyhow!("no monitors found"));
        }
        let primary = monitors
            .iter()
            .position(|m| m.is_primary().unwrap_or(false))
            .unwrap_or(0);
        Ok(monitors.into_iter().nth(primary).expect("index in range"))
    }
}

impl CaptureProvider for ScreenProvider {
    fn name(&self) -> &str {
        "screen"
    }

    fn is_available(&self) -> bool {
        match Monitor::all() {
            Ok(monitors) => !monitors.is_empty(),
            Err(e) => {
                warn!("failed to enumerate monitors: {e}");
                false
            }
        }
    }

    fn capture(&self) -> Result<RgbaImage> {
        let monitor = Self::primary_monitor()?;
        let frame = monitor
            .capture_image()
            .context("Failed to capture monitor image")?;
        debug!("captured screen frame {}x{}", frame.width(), frame.height());
        Ok(frame)
    }
}
