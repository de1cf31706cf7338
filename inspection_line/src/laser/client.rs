use super::framer::MdiFramer;
use crate::error::{LineError, Result};
use serde::Serialize;
use shared::protocol::MDI_START_COMMAND;
use shared::window::min_window_in_roi;
use shared::{MdiFrame, MdiHeader, ProximityDetector, WarningParams, WarningTransition, WindowHit};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8192;
const RECV_BUFFER: usize = 1024 * 1024;
const FRAME_CHANNEL: usize = 64;

/// Warning flag change reported by a laser receive loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaserWarning {
    /// 1-based module index
    pub module: u8,
    pub active: bool,
    /// Frame minimum that caused the change (mm)
    pub current_mm: f64,
}

/// Parameters of an on-demand distance query
#[derive(Debug, Clone, PartialEq)]
pub struct MinAvgQuery {
    /// Frames to aggregate
    pub frames: usize,
    /// Adjacent spots per window
    pub window: usize,
    pub roi_start: Option<usize>,
    /// Exclusive end of the region of interest
    pub roi_end: Option<usize>,
    pub stride: usize,
    pub ignore_zero: bool,
    /// Give up if the frames do not arrive in time
    pub timeout: Duration,
}

impl Default for MinAvgQuery {
    fn default() -> Self {
        Self {
            frames: 10,
            window: 5,
            roi_start: None,
            roi_end: None,
            stride: 1,
            ignore_zero: false,
            timeout: Duration::from_secs(3),
        }
    }
}

/// Smallest windowed average found by a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MinAvgResult {
    pub frames_considered: usize,
    /// First spot of the best window
    pub start_index: Option<usize>,
    pub avg_distance_mm: Option<f64>,
    /// Angle at the window centre (degrees)
    pub angle_deg: Option<f64>,
    pub header_at_min: Option<MdiHeader>,
}

impl MinAvgResult {
    fn new(frames_considered: usize, window: usize, best: Option<(WindowHit, MdiHeader)>) -> Self {
        match best {
            Some((hit, header)) => Self {
                frames_considered,
                start_index: Some(hit.start),
                avg_distance_mm: Some(hit.average(window)),
                angle_deg: Some(header.angle_at(hit.start as f64 + window as f64 / 2.0)),
                header_at_min: Some(header),
            },
            None => Self {
                frames_considered,
                start_index: None,
                avg_distance_mm: None,
                angle_deg: None,
                header_at_min: None,
            },
        }
    }
}

struct Link {
    reader: Option<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

struct Monitor {
    cancel: CancellationToken,
    handle: JoinHandle<Option<OwnedReadHalf>>,
}

/// Clears the single-flight capture flag when a query ends
struct CaptureGuard<'a>(&'a AtomicBool);

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// TCP client for one laser distance sensor
pub struct LaserRangeClient {
    module: u8,
    addr: String,
    connect_timeout: Duration,
    warning: WarningParams,
    warnings: Option<mpsc::UnboundedSender<LaserWarning>>,
    frames: broadcast::Sender<Arc<MdiFrame>>,
    link: Mutex<Option<Link>>,
    monitor: Mutex<Option<Monitor>>,
    connected: Arc<AtomicBool>,
    warning_active: Arc<AtomicBool>,
    capture_active: AtomicBool,
}

impl LaserRangeClient {
    /// Create a client for module `module` (1-based). Warning transitions
    /// are reported on `warnings` when given.
    pub fn new(
        module: u8,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        warning: WarningParams,
        warnings: Option<mpsc::UnboundedSender<LaserWarning>>,
    ) -> Self {
        let (frames, _) = broadcast::channel(FRAME_CHANNEL);
        Self {
            module,
            addr: format!("{}:{}", host, port),
            connect_timeout,
            warning,
            warnings,
            frames,
            link: Mutex::new(None),
            monitor: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            warning_active: Arc::new(AtomicBool::new(false)),
            capture_active: AtomicBool::new(false),
        }
    }

    pub fn module(&self) -> u8 {
        self.module
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the proximity warning is currently raised
    pub fn warning_active(&self) -> bool {
        self.warning_active.load(Ordering::SeqCst)
    }

    /// Stream of decoded frames
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<MdiFrame>> {
        self.frames.subscribe()
    }

    /// Open the TCP connection (no-op when already connected)
    pub async fn connect(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.is_some() && self.is_connected() {
            return Ok(());
        }

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| LineError::timeout(format!("laser {} connect", self.module)))?
            .map_err(|e| LineError::connection(format!("laser {}", self.module), format!("{}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        if let Err(e) = socket2::SockRef::from(&stream).set_recv_buffer_size(RECV_BUFFER) {
            warn!(module = self.module, "could not enlarge receive buffer: {}", e);
        }

        let (reader, writer) = stream.into_split();
        *link = Some(Link {
            reader: Some(reader),
            writer,
        });
        self.connected.store(true, Ordering::SeqCst);
        info!(module = self.module, "📡 Laser connected to {}", self.addr);
        Ok(())
    }

    /// Send the start-streaming command and spawn the receive loop
    pub async fn start_monitoring(&self, parent: &CancellationToken) -> Result<()> {
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(|m| !m.handle.is_finished()) {
            return Ok(());
        }

        let mut link = self.link.lock().await;
        let Some(link) = link.as_mut() else {
            return Err(LineError::connection(format!("laser {}", self.module), "not connected"));
        };
        let Some(reader) = link.reader.take() else {
            return Err(LineError::connection(format!("laser {}", self.module), "receive side lost; reconnect"));
        };

        info!(module = self.module, "sending SendMDI command");
        if let Err(e) = link.writer.write_all(&MDI_START_COMMAND).await {
            link.reader = Some(reader);
            return Err(e.into());
        }

        let cancel = parent.child_token();
        let handle = tokio::spawn(receive_loop(ReceiveContext {
            module: self.module,
            frames: self.frames.clone(),
            warnings: self.warnings.clone(),
            detector: ProximityDetector::new(self.warning),
            connected: Arc::clone(&self.connected),
            warning_active: Arc::clone(&self.warning_active),
            reader,
            cancel: cancel.clone(),
        }));
        *monitor = Some(Monitor { cancel, handle });
        Ok(())
    }

    /// Stop the receive loop and keep the socket for a later restart
    pub async fn stop(&self) {
        let Some(monitor) = self.monitor.lock().await.take() else {
            return;
        };
        monitor.cancel.cancel();
        match monitor.handle.await {
            Ok(Some(reader)) => {
                if let Some(link) = self.link.lock().await.as_mut() {
                    link.reader = Some(reader);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(module = self.module, "laser receive task failed: {}", e),
        }
    }

    /// Stop monitoring and close the socket
    pub async fn disconnect(&self) {
        self.stop().await;
        if self.link.lock().await.take().is_some() {
            info!(module = self.module, "📡 Laser disconnected");
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Aggregate the next `query.frames` frames and return the smallest
    /// windowed average inside the region of interest.
    ///
    /// Only one query may run at a time; a concurrent call gets
    /// [`LineError::Busy`]. If the timeout expires first, the frames seen so
    /// far are used, or [`LineError::Timeout`] is returned when there were none.
    pub async fn capture_min_avg(&self, query: &MinAvgQuery, cancel: &CancellationToken) -> Result<MinAvgResult> {
        if self
            .capture_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(LineError::Busy("laser distance capture"));
        }
        let _guard = CaptureGuard(&self.capture_active);

        let mut frames = self.frames.subscribe();
        let target = query.frames.max(1);
        let window = query.window.max(1);
        let stride = query.stride.max(1);
        let roi = query.roi_start.unwrap_or(0)..query.roi_end.unwrap_or(usize::MAX);

        let deadline = tokio::time::sleep(query.timeout);
        tokio::pin!(deadline);

        let mut seen = 0;
        let mut best: Option<(WindowHit, MdiHeader)> = None;
        while seen < target {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LineError::Cancelled),
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        seen += 1;
                        let hit = min_window_in_roi(&frame.distances, window, roi.clone(), stride, query.ignore_zero);
                        if let Some(hit) = hit {
                            if best.map_or(true, |(b, _)| hit.sum < b.sum) {
                                best = Some((hit, frame.header));
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(module = self.module, "distance query skipped {} frames", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(LineError::connection(format!("laser {}", self.module), "frame stream closed"));
                    }
                },
                _ = &mut deadline => {
                    if seen == 0 {
                        return Err(LineError::timeout(format!("laser {} frames", self.module)));
                    }
                    warn!(module = self.module, "distance query timed out after {}/{} frames", seen, target);
                    break;
                }
            }
        }

        let result = MinAvgResult::new(seen, window, best);
        info!(
            module = self.module,
            "min avg distance {:?} mm at {:?}° over {} frames from spot {:?}",
            result.avg_distance_mm,
            result.angle_deg,
            result.frames_considered,
            result.start_index
        );
        Ok(result)
    }
}

struct ReceiveContext {
    module: u8,
    frames: broadcast::Sender<Arc<MdiFrame>>,
    warnings: Option<mpsc::UnboundedSender<LaserWarning>>,
    detector: ProximityDetector,
    connected: Arc<AtomicBool>,
    warning_active: Arc<AtomicBool>,
    reader: OwnedReadHalf,
    cancel: CancellationToken,
}

/// Returns the read half when stopped by cancellation, `None` when the link failed
async fn receive_loop(mut ctx: ReceiveContext) -> Option<OwnedReadHalf> {
    let module = ctx.module;
    let mut framer = MdiFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut frames_decoded = 0u64;
    let mut parse_errors = 0u64;

    let reader = loop {
        let read = tokio::select! {
            _ = ctx.cancel.cancelled() => break Some(ctx.reader),
            read = ctx.reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                warn!(module, "laser remote closed");
                break None;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(module, "laser receive loop: {}", e);
                break None;
            }
        };

        for packet in framer.push(&buf[..n]) {
            let frame = match MdiFrame::parse(&packet) {
                Ok(frame) => frame,
                Err(e) => {
                    parse_errors += 1;
                    warn!(module, "parse fail {}: {}", e, hex::encode(&packet[..packet.len().min(16)]));
                    continue;
                }
            };
            frames_decoded += 1;

            if let Some(transition) = ctx.detector.observe(&frame.distances) {
                report_warning(&ctx, transition);
            }
            // No subscribers is normal
            let _ = ctx.frames.send(Arc::new(frame));
        }
    };

    if reader.is_none() {
        ctx.connected.store(false, Ordering::SeqCst);
    }
    let stats = framer.stats();
    info!(
        module,
        frames_decoded,
        parse_errors,
        packets = stats.packets,
        short_dropped = stats.short_dropped,
        bytes_discarded = stats.bytes_discarded,
        "📊 Laser receive loop stopped"
    );
    reader
}

fn report_warning(ctx: &ReceiveContext, transition: WarningTransition) {
    let params = ctx.detector.params();
    let (active, current) = match transition {
        WarningTransition::Raised { below, current } => {
            warn!(
                module = ctx.module,
                "⚠️ too close: {} of last {} frames < {} mm (now {:.1} mm)",
                below,
                params.frames,
                params.dist_thresh,
                current
            );
            (true, current)
        }
        WarningTransition::Cleared { current } => {
            info!(
                module = ctx.module,
                "warning cleared: {} frames > {} mm (now {:.1} mm)",
                params.clear_frames,
                params.clear_thresh,
                current
            );
            (false, current)
        }
    };
    ctx.warning_active.store(active, Ordering::SeqCst);
    if let Some(tx) = &ctx.warnings {
        let _ = tx.send(LaserWarning {
            module: ctx.module,
            active,
            current_mm: current,
        });
    }
}
