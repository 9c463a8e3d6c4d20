use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::RgbaImage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{CaptureError, CaptureProvider};

/// Queue pacing and bounding knobs.
#[derive(Debug, Clone)]
pub struct CaptureQueueConfig {
    /// Backlog bound; submissions beyond it are rejected immediately.
    pub max_queue_size: usize,
    /// Minimum delay between completed captures.
    pub min_capture_interval: Duration,
    /// Age at which a pending request is evicted with a timeout error.
    pub request_timeout: Duration,
    /// Delay before servicing the next request after a provider failure.
    pub failure_backoff: Duration,
    /// Cadence of the eviction pass.
    pub housekeeping_interval: Duration,
}

impl Default for CaptureQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10,
            min_capture_interval: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(30),
            failure_backoff: Duration::from_millis(500),
            housekeeping_interval: Duration::from_millis(500),
        }
    }
}

type CaptureReply = Result<Arc<RgbaImage>, CaptureError>;

/// A queued capture request. Owned exclusively by the worker while pending;
/// destroyed on completion, error, or timeout eviction.
struct Pending {
    enqueued_at: Instant,
    reply: oneshot::Sender<CaptureReply>,
}

enum Command {
    Submit(Pending),
    Clear,
}

/// An accepted submission. Await [`CaptureTicket::wait`] for the frame;
/// dropping the ticket abandons the request (the queue discards its result).
pub struct CaptureTicket {
    rx: oneshot::Receiver<CaptureReply>,
}

impl CaptureTicket {
    pub async fn wait(self) -> CaptureReply {
        match self.rx.await {
            Ok(reply) => reply,
            Err(_) => Err(CaptureError::Cancelled),
        }
    }
}

/// Serializes and paces calls to a [`CaptureProvider`]: one capture in
/// flight at a time, FIFO completion order, a bounded backlog, and absolute
/// per-request timeouts independent of pacing.
pub struct CaptureQueue {
    tx: mpsc::UnboundedSender<Command>,
    depth: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
    provider: Arc<dyn CaptureProvider>,
    max_queue_size: usize,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureQueue {
    /// Spawn the queue worker. Must be called within a tokio runtime.
    pub fn new(provider: Arc<dyn CaptureProvider>, config: CaptureQueueConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let worker = Worker {
            provider: provider.clone(),
            config: config.clone(),
            depth: depth.clone(),
            in_flight: in_flight.clone(),
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            tx,
            depth,
            in_flight,
            provider,
            max_queue_size: config.max_queue_size,
            cancel,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a capture request. Fails immediately with
    /// [`CaptureError::QueueFull`] when the backlog is at capacity; an
    /// accepted request is guaranteed a reply (frame, error, or eviction).
    pub fn submit(&self) -> Result<CaptureTicket, CaptureError> {
        if self.cancel.is_cancelled() {
            return Err(CaptureError::Closed);
        }
        let max = self.max_queue_size;
        if self
            .depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
                (d < max).then_some(d + 1)
            })
            .is_err()
        {
            debug!("capture request rejected, backlog at capacity ({max})");
            return Err(CaptureError::QueueFull);
        }

        let (reply, rx) = oneshot::channel();
        let pending = Pending {
            enqueued_at: Instant::now(),
            reply,
        };
        if self.tx.send(Command::Submit(pending)).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            return Err(CaptureError::Closed);
        }
        Ok(CaptureTicket { rx })
    }

    /// Submit and await the frame.
    pub async fn capture(&self) -> CaptureReply {
        self.submit()?.wait().await
    }

    /// Requests currently waiting in the backlog (excludes one in flight).
    pub fn pending(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Whether a provider call is currently outstanding.
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Capability check, delegated to the provider without capturing.
    pub fn provider_available(&self) -> bool {
        self.provider.is_available()
    }

    /// Drain the backlog, answering every pending request with
    /// [`CaptureError::Cancelled`]. A capture already in flight completes
    /// and is delivered normally.
    pub fn clear(&self) {
        let _ = self.tx.send(Command::Clear);
    }

    /// Stop the worker and cancel everything still pending.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().expect("worker handle lock").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("capture worker failed to join: {e}");
            }
        }
    }
}

struct Worker {
    provider: Arc<dyn CaptureProvider>,
    config: CaptureQueueConfig,
    depth: Arc<AtomicUsize>,
    in_flight: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        info!("capture queue worker started ({})", self.provider.name());

        let mut backlog: VecDeque<Pending> = VecDeque::new();
        // Caller of the capture currently in flight. Taken on timeout so the
        // outstanding provider call is abandoned rather than waited on.
        let mut current: Option<Pending> = None;
        let mut task: Option<JoinHandle<anyhow::Result<RgbaImage>>> = None;
        // Earliest instant the next capture may start (pacing and backoff).
        let mut gate = Instant::now();

        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if task.is_none() {
                self.evict_expired(&mut backlog);
                if !backlog.is_empty() && Instant::now() >= gate {
                    if self
                        .in_flight
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        let pending = backlog.pop_front().expect("non-empty backlog");
                        self.depth.fetch_sub(1, Ordering::SeqCst);
                        current = Some(pending);
                        let provider = self.provider.clone();
                        task = Some(tokio::task::spawn_blocking(move || provider.capture()));
                    } else {
                        // Single-consumer worker: the flag can only be ours.
                        warn!("in-flight flag unexpectedly set, skipping dispatch");
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = housekeeping.tick() => {
                    self.evict_expired(&mut backlog);
                    self.evict_stalled(&mut current);
                }
                cmd = rx.recv() => match cmd {
                    Some(Command::Submit(pending)) => backlog.push_back(pending),
                    Some(Command::Clear) => self.drain(&mut backlog),
                    None => break,
                },
                joined = async { task.as_mut().expect("in-flight task").await },
                        if task.is_some() => {
                    task = None;
                    self.in_flight.store(false, Ordering::SeqCst);
                    gate = self.complete(current.take(), joined);
                }
                _ = tokio::time::sleep_until(gate),
                        if task.is_none() && !backlog.is_empty() => {}
            }
        }

        // Shutdown: answer everything still waiting.
        if let Some(pending) = current.take() {
            let _ = pending.reply.send(Err(CaptureError::Cancelled));
        }
        self.in_flight.store(false, Ordering::SeqCst);
        self.drain(&mut backlog);
        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            if let Command::Submit(pending) = cmd {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                let _ = pending.reply.send(Err(CaptureError::Cancelled));
            }
        }
        info!("capture queue worker stopped");
    }

    /// Deliver a finished capture and return the gate for the next dispatch:
    /// min-interval pacing after a completed capture, short backoff after a
    /// provider failure.
    fn complete(
        &self,
        pending: Option<Pending>,
        joined: Result<anyhow::Result<RgbaImage>, tokio::task::JoinError>,
    ) -> Instant {
        let now = Instant::now();
        match joined {
            Ok(Ok(frame)) => {
                match pending {
                    Some(p) => {
                        let _ = p.reply.send(Ok(Arc::new(frame)));
                    }
                    None => debug!("discarding capture for a timed-out request"),
                }
                now + self.config.min_capture_interval
            }
            Ok(Err(e)) => {
                warn!("capture provider failed: {e:#}");
                if let Some(p) = pending {
                    let _ = p.reply.send(Err(CaptureError::Provider(format!("{e:#}"))));
                }
                now + self.config.failure_backoff
            }
            Err(e) => {
                warn!("capture task panicked: {e}");
                if let Some(p) = pending {
                    let _ = p
                        .reply
                        .send(Err(CaptureError::Provider(format!("capture task failed: {e}"))));
                }
                now + self.config.failure_backoff
            }
        }
    }

    /// Age out queued requests that waited past the request timeout.
    fn evict_expired(&self, backlog: &mut VecDeque<Pending>) {
        let timeout = self.config.request_timeout;
        while let Some(front) = backlog.front() {
            if front.enqueued_at.elapsed() < timeout {
                break;
            }
            let pending = backlog.pop_front().expect("non-empty backlog");
            self.depth.fetch_sub(1, Ordering::SeqCst);
            warn!("evicting capture request queued for over {timeout:?}");
            let _ = pending.reply.send(Err(CaptureError::Timeout(timeout)));
        }
    }

    /// Answer the in-flight caller once its request ages out. The provider
    /// call itself is left to finish; its result is discarded.
    fn evict_stalled(&self, current: &mut Option<Pending>) {
        let timeout = self.config.request_timeout;
        if current
            .as_ref()
            .is_some_and(|p| p.enqueued_at.elapsed() >= timeout)
        {
            let pending = current.take().expect("checked above");
            warn!("abandoning in-flight capture after {timeout:?}");
            let _ = pending.reply.send(Err(CaptureError::Timeout(timeout)));
        }
    }

    fn drain(&self, backlog: &mut VecDeque<Pending>) {
        if !backlog.is_empty() {
            info!("cancelling {} queued capture requests", backlog.len());
        }
        while let Some(pending) = backlog.pop_front() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            let _ = pending.reply.send(Err(CaptureError::Cancelled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::mpsc as std_mpsc;

    /// Scripted provider: optionally blocks each capture on a gate channel
    /// (released when the test drops the sender) and optionally fails.
    struct MockProvider {
        calls: AtomicUsize,
        gate: Mutex<Option<std_mpsc::Receiver<()>>>,
        fail: AtomicBool,
    }

    impl MockProvider {
        fn instant() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Mutex::new(None),
                fail: AtomicBool::new(false),
            })
        }

        fn gated() -> (Arc<Self>, std_mpsc::Sender<()>) {
            let (tx, rx) = std_mpsc::channel();
            let provider = Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Mutex::new(Some(rx)),
                fail: AtomicBool::new(false),
            });
            (provider, tx)
        }

        fn failing() -> Arc<Self> {
            let provider = Self::instant();
            provider.fail.store(true, Ordering::SeqCst);
            provider
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CaptureProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn capture(&self) -> anyhow::Result<RgbaImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Blocks until the test releases (or drops) the gate sender.
            if let Some(rx) = &*self.gate.lock().unwrap() {
                let _ = rx.recv();
            }
            if self.fail.load(Ordering::SeqCst) {
                bail!("scripted capture failure");
            }
            Ok(RgbaImage::new(16, 16))
        }
    }

    fn fast_config() -> CaptureQueueConfig {
        CaptureQueueConfig {
            min_capture_interval: Duration::from_millis(1000),
            request_timeout: Duration::from_millis(5000),
            failure_backoff: Duration::from_millis(500),
            housekeeping_interval: Duration::from_millis(100),
            ..CaptureQueueConfig::default()
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_bound_rejects_excess_submissions() {
        let (provider, _gate) = MockProvider::gated();
        let queue = CaptureQueue::new(provider.clone(), fast_config());

        // First request goes in flight, leaving the backlog empty.
        let first = queue.submit().unwrap();
        wait_until(|| queue.in_flight()).await;

        let mut accepted = Vec::new();
        for _ in 0..10 {
            accepted.push(queue.submit().unwrap());
        }
        assert_eq!(queue.pending(), 10);
        assert!(matches!(queue.submit(), Err(CaptureError::QueueFull)));

        drop(first);
        drop(accepted);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limits_consecutive_captures() {
        let provider = MockProvider::instant();
        let queue = CaptureQueue::new(provider.clone(), fast_config());

        let start = Instant::now();
        queue.capture().await.unwrap();
        queue.capture().await.unwrap();
        // The second capture is delayed past the pacing interval, not dropped.
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(provider.calls(), 2);

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_evicts_unserviced_requests() {
        let (provider, _gate) = MockProvider::gated();
        let queue = CaptureQueue::new(provider.clone(), fast_config());

        let stalled = queue.submit().unwrap();
        wait_until(|| queue.in_flight()).await;
        let queued = queue.submit().unwrap();

        // Never serviced: the provider hangs on the first capture.
        assert!(matches!(queued.wait().await, Err(CaptureError::Timeout(_))));
        // The stalled in-flight caller is answered too; the provider call
        // itself is merely abandoned.
        assert!(matches!(stalled.wait().await, Err(CaptureError::Timeout(_))));

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_pending_requests() {
        let (provider, _gate) = MockProvider::gated();
        let queue = CaptureQueue::new(provider.clone(), fast_config());

        let first = queue.submit().unwrap();
        wait_until(|| queue.in_flight()).await;
        let a = queue.submit().unwrap();
        let b = queue.submit().unwrap();

        queue.clear();
        assert!(matches!(a.wait().await, Err(CaptureError::Cancelled)));
        assert!(matches!(b.wait().await, Err(CaptureError::Cancelled)));
        assert_eq!(queue.pending(), 0);

        drop(first);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_failure_backs_off_before_next_item() {
        let provider = MockProvider::failing();
        let queue = CaptureQueue::new(provider.clone(), fast_config());

        let start = Instant::now();
        let a = queue.submit().unwrap();
        let b = queue.submit().unwrap();

        assert!(matches!(a.wait().await, Err(CaptureError::Provider(_))));
        assert!(matches!(b.wait().await, Err(CaptureError::Provider(_))));
        // The failed request is not retried; the next one waits out the backoff.
        assert_eq!(provider.calls(), 2);
        assert!(start.elapsed() >= Duration::from_millis(500));

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_complete_in_submission_order() {
        let provider = MockProvider::instant();
        let queue = Arc::new(CaptureQueue::new(provider.clone(), fast_config()));

        let tickets: Vec<_> = (0..3).map(|_| queue.submit().unwrap()).collect();
        let mut done = Vec::new();
        for (i, ticket) in tickets.into_iter().enumerate() {
            ticket.wait().await.unwrap();
            done.push(i);
        }
        assert_eq!(done, vec![0, 1, 2]);
        assert_eq!(provider.calls(), 3);

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_everything() {
        let (provider, _gate) = MockProvider::gated();
        let queue = CaptureQueue::new(provider.clone(), fast_config());

        let first = queue.submit().unwrap();
        wait_until(|| queue.in_flight()).await;
        let queued = queue.submit().unwrap();

        queue.shutdown().await;
        assert!(matches!(first.wait().await, Err(CaptureError::Cancelled)));
        assert!(matches!(queued.wait().await, Err(CaptureError::Cancelled)));
        assert!(matches!(queue.submit(), Err(CaptureError::Closed)));
    }
}
