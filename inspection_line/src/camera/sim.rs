/*!
Simulated thermal camera.

Emits synthetic frames at a fixed interval while acquiring. Used by the
bench mode of the host binary and by tests; connection loss and failing
connects can be injected.
*/

use super::{CameraEvent, FlagState, ThermalCamera, ThermalFrame};
use crate::error::{LineError, Result};
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const WIDTH: u16 = 64;
const HEIGHT: u16 = 48;

#[derive(Default)]
struct SimState {
    events: Mutex<Option<mpsc::Sender<CameraEvent>>>,
    acquiring: AtomicBool,
    generation: AtomicU64,
    sequence: AtomicU64,
    connect_attempts: AtomicU32,
    failing_connects: AtomicU32,
    dropped: AtomicU64,
}

pub struct SimulatedCamera {
    id: String,
    frame_interval: Duration,
    state: Arc<SimState>,
}

impl SimulatedCamera {
    pub fn new(id: &str, frame_interval: Duration) -> Self {
        Self {
            id: id.to_string(),
            frame_interval,
            state: Arc::new(SimState::default()),
        }
    }

    /// Connect calls so far, failed ones included
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn is_acquiring(&self) -> bool {
        self.state.acquiring.load(Ordering::SeqCst)
    }

    /// Frames lost because the event channel was full
    pub fn frames_dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::SeqCst)
    }

    /// Make the next `n` connect calls fail
    pub fn fail_next_connects(&self, n: u32) {
        self.state.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Simulate the device going away
    pub fn drop_connection(&self) {
        let state = &self.state;
        state.generation.fetch_add(1, Ordering::SeqCst);
        state.acquiring.store(false, Ordering::SeqCst);
        if let Some(events) = state.events.lock().take() {
            if events.try_send(CameraEvent::ConnectionLost).is_err() {
                warn!("{}: connection-lost event not delivered", self.id);
            }
        }
    }
}

fn synthetic_frame(sequence: u64) -> ThermalFrame {
    let mut data = BytesMut::with_capacity(WIDTH as usize * HEIGHT as usize * 2);
    for y in 0..HEIGHT {
        for x in 0..WIDTH {
            // Warm spot drifting with the sequence number
            let dx = x as i32 - (sequence % WIDTH as u64) as i32;
            let dy = y as i32 - HEIGHT as i32 / 2;
            let heat = 4000 - (dx * dx + dy * dy).min(4000);
            data.put_u16_le(7000 + heat as u16);
        }
    }
    ThermalFrame {
        sequence,
        width: WIDTH,
        height: HEIGHT,
        data: data.freeze(),
    }
}

fn frame_thread(state: Arc<SimState>, generation: u64, interval: Duration) {
    while state.generation.load(Ordering::SeqCst) == generation {
        if state.acquiring.load(Ordering::SeqCst) {
            let sequence = state.sequence.fetch_add(1, Ordering::SeqCst);
            let events = state.events.lock().clone();
            if let Some(events) = events {
                if events.try_send(CameraEvent::Frame(synthetic_frame(sequence))).is_err() {
                    state.dropped.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        thread::sleep(interval);
    }
}

impl ThermalCamera for SimulatedCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect(&self, events: mpsc::Sender<CameraEvent>) -> Result<()> {
        let state = &self.state;
        state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = state
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LineError::connection(format!("camera {}", self.id), "device not found"));
        }

        *state.events.lock() = Some(events);
        let generation = state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let thread_state = Arc::clone(state);
        let interval = self.frame_interval;
        thread::spawn(move || frame_thread(thread_state, generation, interval));
        info!("🧪 Simulated camera {} online", self.id);
        Ok(())
    }

    fn disconnect(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
        self.state.acquiring.store(false, Ordering::SeqCst);
        self.state.events.lock().take();
    }

    fn ready_capture(&self, focus: f32) -> Result<()> {
        let events = self.state.events.lock().clone();
        let Some(events) = events else {
            return Err(LineError::connection(format!("camera {}", self.id), "not connected"));
        };
        debug!("{}: focus {:.1}, shutter open", self.id, focus);
        let _ = events.try_send(CameraEvent::Flag(FlagState::Open));
        Ok(())
    }

    fn start_acquisition(&self) -> Result<()> {
        if self.state.events.lock().is_none() {
            return Err(LineError::connection(format!("camera {}", self.id), "not connected"));
        }
        self.state.acquiring.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_acquisition(&self) -> Result<()> {
        self.state.acquiring.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_frame_layout() {
        let frame = synthetic_frame(3);
        assert_eq!(frame.sequence, 3);
        assert_eq!(frame.data.len(), WIDTH as usize * HEIGHT as usize * 2);
    }

    #[tokio::test]
    async fn test_frames_flow_only_while_acquiring() {
        let camera = SimulatedCamera::new("sim", Duration::from_millis(5));
        let (tx, mut rx) = mpsc::channel(1024);

        assert!(camera.start_acquisition().is_err());
        camera.connect(tx).unwrap();
        camera.start_acquisition().unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(matches!(event, CameraEvent::Frame(_)));

        camera.drop_connection();
        assert!(!camera.is_acquiring());
        // Drain until the loss notification shows up
        loop {
            match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
                Some(CameraEvent::ConnectionLost) => break,
                Some(_) => continue,
                None => panic!("channel closed before connection loss"),
            }
        }
    }

    #[test]
    fn test_injected_connect_failures() {
        let camera = SimulatedCamera::new("sim", Duration::from_millis(5));
        camera.fail_next_connects(1);
        let (tx, _rx) = mpsc::channel(4);
        assert!(camera.connect(tx.clone()).is_err());
        assert!(camera.connect(tx).is_ok());
        assert_eq!(camera.connect_attempts(), 2);
        camera.disconnect();
    }
}
