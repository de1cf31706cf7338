use super::{CameraEvent, CapturedFrame, FrameSink, ThermalCamera};
use crate::config::CameraConfig;
use crate::error::{LineError, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection state of a camera link, owned by the controller's event pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Reconnecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BurstOutcome {
    Filled,
    Interrupted,
}

enum DrainItem {
    Frame(CapturedFrame),
    /// Every frame of the burst is ahead of this marker in the queue
    Filled(u64),
}

/// Handle to a started burst
#[derive(Debug)]
pub struct BurstWaiter {
    id: u64,
    rx: oneshot::Receiver<BurstOutcome>,
}

impl BurstWaiter {
    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Burst {
    id: AtomicU64,
    target: AtomicU32,
    remaining: AtomicU32,
    done: Mutex<Option<(u64, oneshot::Sender<BurstOutcome>)>>,
}

impl Burst {
    /// Claim one slot of the running burst: (frame index, was last slot)
    fn accept(&self) -> Option<(u32, bool)> {
        let prev = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .ok()?;
        let index = self.target.load(Ordering::SeqCst).saturating_sub(prev);
        Some((index, prev == 1))
    }

    /// Fire the completion signal once. `None` matches whichever burst is pending.
    fn complete(&self, id: Option<u64>, outcome: BurstOutcome) -> bool {
        let mut slot = self.done.lock();
        match slot.take() {
            Some((current, tx)) if id.map_or(true, |id| id == current) => {
                let _ = tx.send(outcome);
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }

    fn pending(&self) -> bool {
        self.done.lock().is_some()
    }
}

struct Shared {
    module: u8,
    camera: Arc<dyn ThermalCamera>,
    config: CameraConfig,
    state: Mutex<LinkState>,
    user_disconnect: AtomicBool,
    burst: Burst,
}

impl Shared {
    fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    fn stop_acquisition(&self) {
        if let Err(e) = self.camera.stop_acquisition() {
            warn!(module = self.module, "stop acquisition failed: {}", e);
        }
    }
}

/// Fixed-count frame bursts from one camera module
pub struct CaptureBurstController {
    shared: Arc<Shared>,
    events_tx: mpsc::Sender<CameraEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<CameraEvent>>>,
    drain_tx: Sender<DrainItem>,
    drain: Mutex<Option<thread::JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    pump: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl CaptureBurstController {
    /// Create the controller and start its drain thread.
    ///
    /// Frames accepted into a burst are handed to `sink` in arrival order.
    pub fn new(module: u8, camera: Arc<dyn ThermalCamera>, config: CameraConfig, sink: Box<dyn FrameSink>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let (drain_tx, drain_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let shared = Arc::new(Shared {
            module,
            camera,
            config,
            state: Mutex::new(LinkState::Idle),
            user_disconnect: AtomicBool::new(false),
            burst: Burst {
                id: AtomicU64::new(0),
                target: AtomicU32::new(0),
                remaining: AtomicU32::new(0),
                done: Mutex::new(None),
            },
        });

        let drain = {
            let shared = Arc::clone(&shared);
            let running = Arc::clone(&running);
            thread::spawn(move || drain_loop(shared, drain_rx, sink, running))
        };

        Self {
            shared,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            drain_tx,
            drain: Mutex::new(Some(drain)),
            running,
            pump: Mutex::new(None),
        }
    }

    pub fn module(&self) -> u8 {
        self.shared.module
    }

    pub fn state(&self) -> LinkState {
        *self.shared.state.lock()
    }

    /// Whether a burst is waiting for frames
    pub fn is_capturing(&self) -> bool {
        self.shared.burst.pending()
    }

    /// Connect the camera and start consuming its events.
    ///
    /// A failed first connect is not fatal; the reconnect loop takes over.
    pub fn start(&self, parent: &CancellationToken) {
        let Some(events_rx) = self.events_rx.lock().take() else {
            return;
        };
        let shared = &self.shared;
        shared.user_disconnect.store(false, Ordering::SeqCst);

        match shared.camera.connect(self.events_tx.clone()) {
            Ok(()) => {
                shared.set_state(LinkState::Connected);
                info!(module = shared.module, "📷 Camera {} connected", shared.camera.id());
            }
            Err(e) => {
                warn!(module = shared.module, "camera connect failed: {}; will retry", e);
                shared.set_state(LinkState::Reconnecting);
            }
        }

        let cancel = parent.child_token();
        let handle = tokio::spawn(event_pump(
            Arc::clone(shared),
            events_rx,
            self.events_tx.clone(),
            self.drain_tx.clone(),
            cancel.clone(),
        ));
        *self.pump.lock() = Some((cancel, handle));
    }

    /// Arm the camera for the next burst
    pub fn ready_capture(&self) -> Result<()> {
        self.ensure_connected()?;
        self.shared.camera.ready_capture(self.shared.config.focus)
    }

    /// Reset the counters and start acquiring `frame_count` frames
    pub fn start_capture(&self, frame_count: u32) -> Result<BurstWaiter> {
        self.ensure_connected()?;
        let burst = &self.shared.burst;
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut slot = burst.done.lock();
            if slot.is_some() {
                return Err(LineError::Busy("camera burst"));
            }
            let id = burst.id.fetch_add(1, Ordering::SeqCst) + 1;
            *slot = Some((id, tx));
            burst.target.store(frame_count, Ordering::SeqCst);
            burst.remaining.store(frame_count, Ordering::SeqCst);
            id
        };

        if let Err(e) = self.shared.camera.start_acquisition() {
            self.abort_burst(id);
            return Err(e);
        }
        info!(module = self.shared.module, burst = id, "📸 Capturing {} frames", frame_count);
        Ok(BurstWaiter { id, rx })
    }

    /// Wait until the burst is filled and drained.
    ///
    /// `Ok(false)` on timeout or connection loss; cancellation is an error.
    pub async fn wait_for_burst(&self, waiter: BurstWaiter, timeout: Duration, cancel: &CancellationToken) -> Result<bool> {
        let module = self.shared.module;
        let BurstWaiter { id, rx } = waiter;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(module, burst = id, "burst cancelled");
                self.abort_burst(id);
                Err(LineError::Cancelled)
            }
            outcome = rx => match outcome {
                Ok(BurstOutcome::Filled) => Ok(true),
                Ok(BurstOutcome::Interrupted) | Err(_) => {
                    warn!(module, burst = id, "burst interrupted by camera disconnect");
                    Ok(false)
                }
            },
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    module,
                    burst = id,
                    "burst timed out after {:?} with {} frames missing",
                    timeout,
                    self.shared.burst.remaining.load(Ordering::SeqCst)
                );
                self.abort_burst(id);
                Ok(false)
            }
        }
    }

    /// Start a burst and wait for it with the configured timeout
    pub async fn capture_and_wait(&self, frame_count: u32, cancel: &CancellationToken) -> Result<bool> {
        let waiter = match self.start_capture(frame_count) {
            Ok(waiter) => waiter,
            Err(e) => {
                warn!(module = self.shared.module, "cannot start burst: {}", e);
                return Ok(false);
            }
        };
        let timeout = Duration::from_millis(self.shared.config.burst_timeout_ms);
        self.wait_for_burst(waiter, timeout, cancel).await
    }

    /// User-initiated disconnect; no reconnect follows
    pub fn disconnect(&self) {
        let shared = &self.shared;
        shared.user_disconnect.store(true, Ordering::SeqCst);
        shared.burst.remaining.store(0, Ordering::SeqCst);
        shared.burst.complete(None, BurstOutcome::Interrupted);
        shared.camera.disconnect();
        shared.set_state(LinkState::Idle);
        info!(module = shared.module, "📷 Camera {} disconnected", shared.camera.id());
    }

    /// Stop the event pump, disconnect and join the drain thread
    pub async fn shutdown(&self) {
        let pump = self.pump.lock().take();
        if let Some((cancel, handle)) = pump {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(module = self.shared.module, "camera event pump failed: {}", e);
            }
        }
        self.disconnect();

        self.running.store(false, Ordering::SeqCst);
        let drain = self.drain.lock().take();
        if let Some(drain) = drain {
            match tokio::task::spawn_blocking(move || drain.join()).await {
                Ok(Ok(())) => {}
                _ => error!(module = self.shared.module, "camera drain thread panicked"),
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state() {
            LinkState::Connected => Ok(()),
            state => Err(LineError::connection(
                format!("camera {}", self.shared.module),
                format!("link is {:?}", state),
            )),
        }
    }

    fn abort_burst(&self, id: u64) {
        self.shared.burst.remaining.store(0, Ordering::SeqCst);
        self.shared.burst.complete(Some(id), BurstOutcome::Interrupted);
        self.shared.stop_acquisition();
    }
}

async fn event_pump(
    shared: Arc<Shared>,
    mut events: mpsc::Receiver<CameraEvent>,
    events_tx: mpsc::Sender<CameraEvent>,
    drain_tx: Sender<DrainItem>,
    cancel: CancellationToken,
) {
    let module = shared.module;
    let mut ignored = 0u64;
    loop {
        let state = *shared.state.lock();
        if state == LinkState::Reconnecting && !reconnect(&shared, &events_tx, &cancel).await {
            break;
        }

        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };

        match event {
            CameraEvent::Frame(frame) => {
                let Some((index, last)) = shared.burst.accept() else {
                    ignored += 1;
                    continue;
                };
                let burst = shared.burst.id.load(Ordering::SeqCst);
                let _ = drain_tx.send(DrainItem::Frame(CapturedFrame { burst, index, frame }));
                if last {
                    let _ = drain_tx.send(DrainItem::Filled(burst));
                }
            }
            CameraEvent::Flag(state) => debug!(module, "flag state {:?}", state),
            CameraEvent::ConnectionLost => {
                shared.burst.remaining.store(0, Ordering::SeqCst);
                if shared.burst.complete(None, BurstOutcome::Interrupted) {
                    warn!(module, "connection lost during a burst");
                }
                if shared.user_disconnect.load(Ordering::SeqCst) {
                    shared.set_state(LinkState::Idle);
                } else {
                    warn!(module, "⚠️ Camera connection lost; reconnecting");
                    shared.set_state(LinkState::Reconnecting);
                }
            }
        }
    }
    debug!(module, ignored, "camera event pump stopped");
}

/// Retry the connection with exponential backoff. `false` when cancelled.
async fn reconnect(shared: &Shared, events_tx: &mpsc::Sender<CameraEvent>, cancel: &CancellationToken) -> bool {
    let module = shared.module;
    let max = Duration::from_millis(shared.config.reconnect_max_ms);
    let mut delay = Duration::from_millis(shared.config.reconnect_initial_ms);
    let mut attempt = 1u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }
        if shared.user_disconnect.load(Ordering::SeqCst) {
            shared.set_state(LinkState::Idle);
            return true;
        }

        match shared.camera.connect(events_tx.clone()) {
            Ok(()) => {
                if let Err(e) = shared.camera.ready_capture(shared.config.focus) {
                    warn!(module, "re-arm after reconnect failed: {}", e);
                }
                shared.set_state(LinkState::Connected);
                info!(module, "📷 Camera reconnected after {} attempts", attempt);
                return true;
            }
            Err(e) => {
                delay = (delay * 2).min(max);
                warn!(module, attempt, "camera reconnect failed: {}; next try in {:?}", e, delay);
                attempt += 1;
            }
        }
    }
}

fn drain_loop(shared: Arc<Shared>, rx: Receiver<DrainItem>, mut sink: Box<dyn FrameSink>, running: Arc<AtomicBool>) {
    let module = shared.module;
    let mut persisted = 0u64;
    let mut sink_errors = 0u64;
    let mut bursts = 0u64;

    while running.load(Ordering::SeqCst) || !rx.is_empty() {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(DrainItem::Frame(frame)) => match sink.persist(module, &frame) {
                Ok(()) => persisted += 1,
                Err(e) => {
                    sink_errors += 1;
                    error!(module, index = frame.index, "❌ Failed to persist frame: {}", e);
                }
            },
            Ok(DrainItem::Filled(id)) => {
                shared.stop_acquisition();
                if shared.burst.complete(Some(id), BurstOutcome::Filled) {
                    bursts += 1;
                    info!(module, burst = id, "✅ Burst complete");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(module, persisted, sink_errors, bursts, "📊 Camera drain stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SimulatedCamera;

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<CapturedFrame>>>);

    impl FrameSink for Collect {
        fn persist(&mut self, _module: u8, frame: &CapturedFrame) -> Result<()> {
            self.0.lock().push(frame.clone());
            Ok(())
        }
    }

    fn fast_config() -> CameraConfig {
        CameraConfig {
            burst_timeout_ms: 2000,
            reconnect_initial_ms: 10,
            reconnect_max_ms: 40,
            ..CameraConfig::default()
        }
    }

    fn controller(sim: &Arc<SimulatedCamera>, sink: Collect) -> CaptureBurstController {
        CaptureBurstController::new(1, sim.clone(), fast_config(), Box::new(sink))
    }

    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_burst_collects_exact_frame_count() {
        let sim = Arc::new(SimulatedCamera::new("cam1", Duration::from_millis(2)));
        let sink = Collect::default();
        let ctl = controller(&sim, sink.clone());
        let cancel = CancellationToken::new();
        ctl.start(&cancel);
        assert_eq!(ctl.state(), LinkState::Connected);

        ctl.ready_capture().unwrap();
        assert!(ctl.capture_and_wait(5, &cancel).await.unwrap());

        let frames = sink.0.lock().clone();
        let indices: Vec<u32> = frames.iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert!(frames.iter().all(|f| f.burst == 1));
        assert!(!sim.is_acquiring());

        // The next burst starts from a clean counter
        assert!(ctl.capture_and_wait(3, &cancel).await.unwrap());
        assert_eq!(sink.0.lock().len(), 8);
        assert_eq!(sink.0.lock().last().map(|f| (f.burst, f.index)), Some((2, 2)));

        ctl.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_burst_is_busy() {
        let sim = Arc::new(SimulatedCamera::new("cam1", Duration::from_millis(50)));
        let ctl = controller(&sim, Collect::default());
        let cancel = CancellationToken::new();
        ctl.start(&cancel);

        let _waiter = ctl.start_capture(1000).unwrap();
        assert!(ctl.is_capturing());
        assert!(matches!(ctl.start_capture(5), Err(LineError::Busy(_))));
        ctl.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_loss_fails_burst_then_reconnects() {
        let sim = Arc::new(SimulatedCamera::new("cam2", Duration::from_millis(2)));
        let ctl = controller(&sim, Collect::default());
        let cancel = CancellationToken::new();
        ctl.start(&cancel);

        let waiter = ctl.start_capture(100_000).unwrap();
        let dropper = {
            let sim = Arc::clone(&sim);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                sim.fail_next_connects(2);
                sim.drop_connection();
            })
        };
        let ok = ctl.wait_for_burst(waiter, Duration::from_secs(5), &cancel).await.unwrap();
        assert!(!ok);
        dropper.await.unwrap();

        eventually(|| ctl.state() == LinkState::Connected).await;
        // Initial connect, two failures, one success
        assert_eq!(sim.connect_attempts(), 4);
        ctl.shutdown().await;
    }

    #[tokio::test]
    async fn test_user_disconnect_does_not_reconnect() {
        let sim = Arc::new(SimulatedCamera::new("cam3", Duration::from_millis(2)));
        let ctl = controller(&sim, Collect::default());
        let cancel = CancellationToken::new();
        ctl.start(&cancel);

        ctl.disconnect();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctl.state(), LinkState::Idle);
        assert_eq!(sim.connect_attempts(), 1);
        assert!(!ctl.capture_and_wait(5, &cancel).await.unwrap());
        ctl.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_aborts_burst() {
        let sim = Arc::new(SimulatedCamera::new("cam4", Duration::from_millis(2)));
        let ctl = controller(&sim, Collect::default());
        let cancel = CancellationToken::new();
        ctl.start(&cancel);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let err = ctl.capture_and_wait(100_000, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(!sim.is_acquiring());
        ctl.shutdown().await;
    }
}
