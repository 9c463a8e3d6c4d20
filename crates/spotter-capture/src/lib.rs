//! Capture request pipeline: turns an asynchronous, possibly rate-limited
//! screen-capture capability into a paced, bounded request/response
//! primitive with per-request timeouts.

pub mod queue;
mod screen;

use std::time::Duration;

use image::RgbaImage;
use thiserror::Error;

pub use queue::{CaptureQueue, CaptureQueueConfig, CaptureTicket};
pub use screen::ScreenProvider;

/// The external screen-capture capability.
///
/// Implementations are invoked from a blocking worker thread, and the queue
/// guarantees at most one outstanding call at a time.
pub trait CaptureProvider: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Whether the capability is currently reachable. Checked before a
    /// session starts, without performing a capture.
    fn is_available(&self) -> bool;

    /// Take one full-screen capture.
    fn capture(&self) -> anyhow::Result<RgbaImage>;
}

/// Failure paths of the capture queue. These are values, never panics; the
/// queue does not throw across its public boundary.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The backlog is at capacity. The request was not enqueued; the caller
    /// may retry later.
    #[error("capture queue is full")]
    QueueFull,

    /// The request aged out before the provider serviced it. The queue does
    /// not retry on the caller's behalf.
    #[error("capture request timed out after {0:?}")]
    Timeout(Duration),

    /// The provider failed this capture. The queue moves on to the next
    /// queued request after a short backoff.
    #[error("capture provider failed: {0}")]
    Provider(String),

    /// The request was dropped by `clear()` or a shutdown.
    #[error("capture request cancelled")]
    Cancelled,

    /// The queue worker is no longer running.
    #[error("capture queue is shut down")]
    Closed,
}
