use std::sync::Arc;

use tracing::info;

use spotter_capture::{CaptureProvider, CaptureQueue, CaptureQueueConfig, ScreenProvider};
use spotter_session::{ActionDispatcher, EngineMatcher, SessionConfig, SessionController};
use spotter_vision::MatchConfig;

/// Knobs for every engine component, with the documented defaults.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub queue: CaptureQueueConfig,
    pub matcher: MatchConfig,
    pub session: SessionConfig,
}

/// Process-wide engine context: owns the capture queue and the session
/// controller, wired once at startup and passed by handle to whoever needs
/// them. Explicit `init`/`shutdown` lifecycle — no global singletons.
pub struct Engine {
    queue: Arc<CaptureQueue>,
    controller: Arc<SessionController>,
}

impl Engine {
    /// Wire the engine against an explicit capture provider and action
    /// dispatcher. Must be called within a tokio runtime.
    pub fn init(
        provider: Arc<dyn CaptureProvider>,
        dispatcher: Arc<dyn ActionDispatcher>,
        config: EngineConfig,
    ) -> Self {
        let queue = Arc::new(CaptureQueue::new(provider, config.queue));
        let matcher = Arc::new(EngineMatcher::new(config.matcher));
        let controller = Arc::new(SessionController::new(
            queue.clone(),
            matcher,
            dispatcher,
            config.session,
        ));
        info!("engine initialized");
        Self { queue, controller }
    }

    /// Convenience constructor using the default primary-monitor provider.
    pub fn with_screen_capture(dispatcher: Arc<dyn ActionDispatcher>, config: EngineConfig) -> Self {
        Self::init(Arc::new(ScreenProvider::new()), dispatcher, config)
    }

    /// The session control surface: start/stop/pause/resume, status,
    /// template management, listeners.
    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    /// Direct access to the capture queue, e.g. for one-off captures while
    /// building a template.
    pub fn queue(&self) -> &Arc<CaptureQueue> {
        &self.queue
    }

    /// Stop the session, drain the queue, and join the workers.
    pub async fn shutdown(self) {
        let _ = self.controller.stop().await;
        self.queue.clear();
        self.queue.shutdown().await;
        info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use spotter_session::{LogDispatcher, SessionState};
    use spotter_vision::Template;

    struct FrameProvider {
        frame: RgbaImage,
    }

    impl CaptureProvider for FrameProvider {
        fn name(&self) -> &str {
            "frame"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn capture(&self) -> anyhow::Result<RgbaImage> {
            Ok(self.frame.clone())
        }
    }

    /// End to end: a screen containing an exact copy of the template region
    /// is captured, matched, and reported through the session status.
    #[tokio::test(start_paused = true)]
    async fn test_engine_finds_template_on_screen() {
        let mut frame = RgbaImage::from_pixel(120, 120, Rgba([10, 10, 10, 255]));
        for y in 50..70 {
            for x in 50..70 {
                frame.put_pixel(x, y, Rgba([240, 240, 240, 255]));
            }
        }
        let template = Template::from_region(&frame, 60, 60, 10, 0.8).unwrap();

        let config = EngineConfig {
            matcher: MatchConfig {
                stride: 1,
                sample_step: 1,
                ..MatchConfig::default()
            },
            ..EngineConfig::default()
        };
        let engine = Engine::init(
            Arc::new(FrameProvider { frame }),
            Arc::new(LogDispatcher),
            config,
        );

        let controller = engine.controller().clone();
        controller.set_template(template);
        assert!(controller.start().success);

        while controller.status().successful_finds == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let last = controller.status().last_result.expect("match recorded");
        assert!(last.found);
        assert!(last.confidence >= 0.9);
        // The short-circuit may accept a near-perfect window one stride off
        // the exact position; the center still lands on the icon.
        let (x, y) = last.coordinates.expect("found result carries coordinates");
        assert!((x - 60).abs() <= 2, "x = {x}");
        assert!((y - 60).abs() <= 2, "y = {y}");

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_session_and_queue() {
        let engine = Engine::init(
            Arc::new(FrameProvider {
                frame: RgbaImage::new(32, 32),
            }),
            Arc::new(LogDispatcher),
            EngineConfig::default(),
        );
        let controller = engine.controller().clone();
        let queue = engine.queue().clone();

        engine.shutdown().await;
        assert_eq!(controller.status().state, SessionState::Stopped);
        assert!(queue.submit().is_err());
    }
}
