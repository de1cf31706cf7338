/*!
Thermal camera acquisition.

The vendor SDK pushes frames, flag changes and connection loss from its own
threads. An adapter implementing [`ThermalCamera`] turns those callbacks
into [`CameraEvent`]s on a bounded channel, and the
[`CaptureBurstController`] is the single consumer of that channel.
*/

mod burst;
mod sim;

pub use burst::{BurstWaiter, CaptureBurstController, LinkState};
pub use sim::SimulatedCamera;

use crate::error::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

/// One frame delivered by the camera
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalFrame {
    /// Counter assigned by the camera
    pub sequence: u64,
    pub width: u16,
    pub height: u16,
    /// Raw 16-bit little-endian pixels
    pub data: Bytes,
}

/// Shutter flag state reported by the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagState {
    Open,
    Closed,
    Moving,
}

/// Notification pushed by a camera adapter
#[derive(Debug, Clone, PartialEq)]
pub enum CameraEvent {
    Frame(ThermalFrame),
    Flag(FlagState),
    ConnectionLost,
}

/// Vendor camera client. Calls return quickly; results arrive as events.
pub trait ThermalCamera: Send + Sync {
    /// Identifier from the configuration
    fn id(&self) -> &str;

    /// Open the device and deliver its events on `events`
    fn connect(&self, events: mpsc::Sender<CameraEvent>) -> Result<()>;

    fn disconnect(&self);

    /// Arm acquisition (focus, shutter)
    fn ready_capture(&self, focus: f32) -> Result<()>;

    fn start_acquisition(&self) -> Result<()>;

    fn stop_acquisition(&self) -> Result<()>;
}

/// A frame accepted into a burst
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// Burst counter of the owning controller
    pub burst: u64,
    /// Position inside the burst, starting at 0
    pub index: u32,
    pub frame: ThermalFrame,
}

/// Persistence collaborator fed by the drain loop
pub trait FrameSink: Send + 'static {
    fn persist(&mut self, module: u8, frame: &CapturedFrame) -> Result<()>;
}

/// Sink that only logs and counts
#[derive(Debug, Default)]
pub struct LoggingSink {
    pub frames: u64,
    pub bytes: u64,
}

impl FrameSink for LoggingSink {
    fn persist(&mut self, module: u8, frame: &CapturedFrame) -> Result<()> {
        self.frames += 1;
        self.bytes += frame.frame.data.len() as u64;
        debug!(
            module,
            burst = frame.burst,
            index = frame.index,
            "frame {}x{} ({} bytes)",
            frame.frame.width,
            frame.frame.height,
            frame.frame.data.len()
        );
        Ok(())
    }
}
