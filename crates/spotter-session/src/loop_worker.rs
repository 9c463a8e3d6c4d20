use std::sync::Arc;

use image::RgbaImage;
use spotter_capture::{CaptureError, CaptureQueue};
use spotter_vision::Template;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::{SessionConfig, Shared};
use crate::{ActionDispatcher, TemplateMatcher};

pub(crate) struct LoopContext {
    pub shared: Arc<Shared>,
    pub queue: Arc<CaptureQueue>,
    pub matcher: Arc<dyn TemplateMatcher>,
    pub dispatcher: Arc<dyn ActionDispatcher>,
    pub config: SessionConfig,
    pub cancel: CancellationToken,
}

enum LoopError {
    /// The session was stopped; exit without touching the state.
    Cancelled,
    /// Unexpected failure inside one iteration. Terminal for the session.
    Fault(String),
}

/// The capture → match → act loop. Runs while the session is active, idles
/// while paused, exits promptly on cancellation. Any iteration fault stops
/// the session: repeated unknown failures wasting capture slots is worse
/// than stopping.
pub(crate) async fn search_loop(ctx: LoopContext) {
    info!("search loop started");
    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }
        if !wait_while_paused(&ctx).await {
            break;
        }

        // The template reference is pinned per iteration; a concurrent swap
        // takes effect on the next one.
        let Some(template) = ctx.shared.current_template() else {
            ctx.shared.report_fault("current template removed while session active");
            return;
        };

        match run_iteration(&ctx, template).await {
            Ok(()) => {}
            Err(LoopError::Cancelled) => break,
            Err(LoopError::Fault(message)) => {
                ctx.shared.report_fault(&message);
                return;
            }
        }

        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(ctx.config.search_interval) => {}
        }
    }
    info!("search loop stopped");
}

/// Idle until the session leaves the paused states. Returns false when the
/// loop should exit instead.
async fn wait_while_paused(ctx: &LoopContext) -> bool {
    let mut state_rx = ctx.shared.state_rx();
    loop {
        if !state_rx.borrow_and_update().is_paused() {
            return true;
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => return false,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

async fn run_iteration(ctx: &LoopContext, template: Arc<Template>) -> Result<(), LoopError> {
    let frame = acquire_frame(ctx).await?;

    let matcher = ctx.matcher.clone();
    let screen = frame.clone();
    let tmpl = template.clone();
    let joined = tokio::task::spawn_blocking(move || matcher.find(&screen, &tmpl)).await;
    // The frame is single-owner per iteration; release it before sleeping.
    drop(frame);

    let result = joined.map_err(|e| LoopError::Fault(format!("match task failed: {e}")))?;

    ctx.shared.record_attempt();
    ctx.shared.notify_result(&result);

    if result.found {
        ctx.shared.record_find(result.clone());
        if let Some((x, y)) = result.coordinates {
            debug!(
                "match at ({x}, {y}) confidence {:.3}, dispatching",
                result.confidence
            );
            if let Err(e) = ctx.dispatcher.dispatch(x, y) {
                warn!("action dispatch failed at ({x}, {y}): {e:#}");
            }
        }
    }

    Ok(())
}

/// Submit a capture and await the frame, retrying transient capture errors
/// up to the configured budget. Exhausting the budget is a loop fault.
async fn acquire_frame(ctx: &LoopContext) -> Result<Arc<RgbaImage>, LoopError> {
    let mut attempt = 0u32;
    loop {
        let outcome = match ctx.queue.submit() {
            Ok(ticket) => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        // The in-flight capture is abandoned; the queue
                        // discards its result.
                        return Err(LoopError::Cancelled);
                    }
                    reply = ticket.wait() => reply,
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(frame) => return Ok(frame),
            Err(CaptureError::Cancelled | CaptureError::Closed) if ctx.cancel.is_cancelled() => {
                return Err(LoopError::Cancelled);
            }
            Err(CaptureError::Closed) => {
                return Err(LoopError::Fault("capture queue closed".into()));
            }
            Err(e) => {
                attempt += 1;
                if attempt > ctx.config.submit_retry_limit {
                    return Err(LoopError::Fault(format!(
                        "capture failed after {attempt} attempts: {e}"
                    )));
                }
                warn!("capture attempt {attempt} failed ({e}), retrying");
                tokio::select! {
                    _ = ctx.cancel.cancelled() => return Err(LoopError::Cancelled),
                    _ = tokio::time::sleep(ctx.config.submit_retry_delay) => {}
                }
            }
        }
    }
}
