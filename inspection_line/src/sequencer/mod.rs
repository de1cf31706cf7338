/*!
Inspection line orchestrator.

[`InspectionLine`] owns the device set while the line is online: the PLC
gate, the robot listener, one laser client and one burst controller per
module, and the light curtain. Going online also starts three background
workers:

- PLC monitoring: edge detection on the status word (car entry, sequence
  initialize)
- heartbeat: toggles the heartbeat bit of the response word
- laser warning relay: mirrors each module's proximity warning into the
  distance alarm word

At most one inspection run exists at a time. A start request while a run
is active is logged and ignored.
*/

mod run;

pub use run::{RobotReport, RunReport, StepReport};

use crate::camera::{CaptureBurstController, FrameSink, ThermalCamera};
use crate::config::AppConfig;
use crate::error::{LineError, Result};
use crate::laser::{LaserRangeClient, LaserWarning};
use crate::light_curtain::LightCurtain;
use crate::plc::{PlcSync, PlcTransport, ShadowWord, WaitPolicy};
use crate::robot::{RetryPolicy, RobotServer};
use crate::signals::Domain;
use shared::{BitIndex, EdgeDetector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// External collaborators handed to the line when going online
pub struct DeviceSet {
    pub plc: Box<dyn PlcTransport>,
    /// One camera per module, in module order
    pub cameras: Vec<Arc<dyn ThermalCamera>>,
    /// One sink per module, in module order
    pub sinks: Vec<Box<dyn FrameSink>>,
    pub light_curtain: Box<dyn LightCurtain>,
}

/// Devices and workers of one online session
pub(crate) struct Online {
    pub config: AppConfig,
    pub plc: Arc<PlcSync>,
    pub response: ShadowWord,
    pub alarm: ShadowWord,
    pub robots: Arc<RobotServer>,
    pub retry: RetryPolicy,
    pub lasers: Vec<Arc<LaserRangeClient>>,
    pub cameras: Vec<Arc<CaptureBurstController>>,
    pub curtain: Box<dyn LightCurtain>,
    /// Serializes capture triggers across modules
    pub capture_gate: tokio::sync::Mutex<()>,
    pub cancel: CancellationToken,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Online {
    pub fn ack_policy(&self) -> WaitPolicy {
        WaitPolicy::new(self.config.plc.ack_timeout(), self.config.plc.poll_interval())
    }

    pub fn done_policy(&self) -> WaitPolicy {
        WaitPolicy::new(self.config.plc.done_timeout(), self.config.plc.poll_interval())
    }
}

struct ActiveRun {
    car: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Resets the single-flight flag when a run ends, however it ends
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The vehicle thermal inspection line
pub struct InspectionLine {
    config: AppConfig,
    online: tokio::sync::Mutex<Option<Arc<Online>>>,
    running: Arc<AtomicBool>,
    run: parking_lot::Mutex<Option<ActiveRun>>,
}

impl InspectionLine {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            online: tokio::sync::Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            run: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_online(&self) -> bool {
        self.online.lock().await.is_some()
    }

    /// Whether an inspection run is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connect every device and start the background workers
    pub async fn go_online(&self, devices: DeviceSet) -> Result<()> {
        let mut slot = self.online.lock().await;
        if slot.is_some() {
            warn!("line is already online");
            return Ok(());
        }

        self.config.validate()?;
        let config = self.config.clone();
        let modules = config.modules.len();
        if devices.cameras.len() != modules || devices.sinks.len() != modules {
            return Err(LineError::config(format!(
                "{} modules configured but {} cameras and {} sinks supplied",
                modules,
                devices.cameras.len(),
                devices.sinks.len()
            )));
        }

        let cancel = CancellationToken::new();
        let plc = Arc::new(PlcSync::new(devices.plc));
        if !plc.is_connected().await {
            warn!("PLC link is not up yet; register access will be retried by each caller");
        }

        let robots = RobotServer::bind(&config.robots.bind_addr, config.robots.port, &config.robots.robots, &cancel).await?;

        let (warn_tx, warn_rx) = mpsc::unbounded_channel();
        let mut lasers = Vec::with_capacity(modules);
        for (i, module) in config.modules.iter().enumerate() {
            let laser = Arc::new(LaserRangeClient::new(
                (i + 1) as u8,
                &module.laser_host,
                module.laser_port,
                Duration::from_millis(config.laser.connect_timeout_ms),
                config.laser.warning,
                Some(warn_tx.clone()),
            ));
            match laser.connect().await {
                Ok(()) => {
                    if let Err(e) = laser.start_monitoring(&cancel).await {
                        error!(module = i + 1, "laser monitoring failed to start: {}", e);
                    }
                }
                Err(e) => error!(module = i + 1, "laser connect failed: {}", e),
            }
            lasers.push(laser);
        }
        drop(warn_tx);

        let cameras: Vec<Arc<CaptureBurstController>> = devices
            .cameras
            .into_iter()
            .zip(devices.sinks)
            .enumerate()
            .map(|(i, (camera, sink))| {
                let controller = Arc::new(CaptureBurstController::new((i + 1) as u8, camera, config.camera.clone(), sink));
                controller.start(&cancel);
                controller
            })
            .collect();

        let online = Arc::new(Online {
            response: ShadowWord::new(Arc::clone(&plc), config.plc.response_address),
            alarm: ShadowWord::new(Arc::clone(&plc), config.plc.distance_alarm_address),
            retry: RetryPolicy::from(&config.robot_messaging),
            plc,
            robots,
            lasers,
            cameras,
            curtain: devices.light_curtain,
            capture_gate: tokio::sync::Mutex::new(()),
            cancel,
            workers: parking_lot::Mutex::new(Vec::new()),
            config,
        });

        online.response.reset().await;
        online.alarm.reset().await;

        let workers = vec![
            tokio::spawn(monitor_plc(Arc::clone(&online))),
            tokio::spawn(heartbeat(Arc::clone(&online))),
            tokio::spawn(relay_laser_warnings(Arc::clone(&online), warn_rx)),
        ];
        *online.workers.lock() = workers;

        *slot = Some(online);
        info!("🟢 Line online");
        Ok(())
    }

    /// Cancel the active run and every worker, then release the devices
    pub async fn go_offline(&self) {
        let Some(online) = self.online.lock().await.take() else {
            info!("line is not online");
            return;
        };

        self.stop_inspection().await;
        online.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = online.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("line worker failed: {}", e);
            }
        }

        online.curtain.stop().await;
        for camera in &online.cameras {
            camera.shutdown().await;
        }
        for laser in &online.lasers {
            laser.disconnect().await;
        }
        online.robots.stop().await;
        info!("🔴 Line offline");
    }

    /// Start a run for `car`. Returns `false` if the line is offline or a run is active.
    pub async fn start_inspection_sequence(&self, car: &str) -> bool {
        let Some(online) = self.online.lock().await.clone() else {
            info!("line is not online; cannot inspect {}", car);
            return false;
        };
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("inspection already running; ignoring start for {}", car);
            return false;
        }

        let guard = RunGuard(Arc::clone(&self.running));
        let cancel = online.cancel.child_token();
        let car_id = car.to_string();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            match run::run_inspection(online, car_id.clone(), task_cancel).await {
                Ok(report) => info!("{} inspection finished in {} ms", car_id, report.duration_ms),
                Err(e) if e.is_cancelled() => info!("{} inspection cancelled", car_id),
                Err(e) => error!("{} inspection aborted: {}", car_id, e),
            }
        });

        *self.run.lock() = Some(ActiveRun {
            car: car.to_string(),
            cancel,
            handle,
        });
        true
    }

    /// Cancel the active run, if any, and wait for it to unwind
    pub async fn stop_inspection(&self) {
        let active = self.run.lock().take();
        let Some(active) = active else {
            return;
        };
        if !active.handle.is_finished() {
            info!("stopping inspection of {}", active.car);
        }
        active.cancel.cancel();
        if let Err(e) = active.handle.await {
            error!("inspection task failed: {}", e);
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LineError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

async fn monitor_plc(online: Arc<Online>) {
    let plc_cfg = &online.config.plc;
    let signals = &online.config.signals;
    let mut edges = EdgeDetector::new();
    info!("PLC monitoring started on D{}", plc_cfg.status_address);

    loop {
        let word = online.plc.get_word(plc_cfg.status_address).await;
        // Failed reads leave the edge state untouched
        if word >= 0 {
            edges.update(word as u16);
            for bit in BitIndex::all().filter(|&b| edges.is_rising_edge(b)) {
                match signals.meaning(Domain::PlcStatus, bit) {
                    Some(signal) => debug!("D{}.{} rising: {}", plc_cfg.status_address, bit, signal),
                    None => debug!("D{}.{} rising (unassigned)", plc_cfg.status_address, bit),
                }
            }
            if edges.is_rising_edge(signals.car_entry) {
                info!("🚗 Car entry detected");
                if let Err(e) = car_entry_handshake(&online).await {
                    if e.is_cancelled() {
                        break;
                    }
                    warn!("car entry handshake failed: {}", e);
                }
            } else if edges.is_rising_edge(signals.sequence_initialize) {
                info!("sequence initialize requested; nothing to reset");
            }
        }

        if sleep_or_cancel(plc_cfg.poll_interval(), &online.cancel).await.is_err() {
            break;
        }
    }
    info!("PLC monitoring stopped");
}

async fn car_entry_handshake(online: &Online) -> Result<()> {
    let signals = &online.config.signals;
    online.response.set_bit(signals.pc_response_ok, true).await;
    let acked = online
        .plc
        .wait_for_bit(
            online.config.plc.status_address,
            signals.plc_response_ok,
            true,
            online.ack_policy(),
            &online.cancel,
            "car entry ack",
        )
        .await?;
    if acked {
        online.response.set_bit(signals.pc_response_ok, false).await;
    } else {
        warn!("PLC did not acknowledge car entry");
    }

    if let Err(e) = online.curtain.start(online.config.light_curtain.height_offset_mm).await {
        error!("light curtain start failed: {}", e);
    }
    Ok(())
}

async fn heartbeat(online: Arc<Online>) {
    let bit = online.config.signals.heartbeat;
    let mut ticker = tokio::time::interval(Duration::from_millis(online.config.plc.heartbeat_interval_ms.max(1)));
    // A slow write delays the next beat instead of queueing a burst
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = online.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !online.plc.is_connected().await {
            debug!("heartbeat skipped: PLC disconnected");
            continue;
        }
        online.response.toggle_bit(bit).await;
    }
}

async fn relay_laser_warnings(online: Arc<Online>, mut warnings: mpsc::UnboundedReceiver<LaserWarning>) {
    loop {
        let warning = tokio::select! {
            _ = online.cancel.cancelled() => break,
            warning = warnings.recv() => warning,
        };
        let Some(warning) = warning else {
            break;
        };
        let Some(bit) = warning.module.checked_sub(1).and_then(BitIndex::new) else {
            warn!(module = warning.module, "no alarm bit for module");
            continue;
        };
        info!(
            module = warning.module,
            active = warning.active,
            "distance alarm {} ({:.1} mm)",
            if warning.active { "ON" } else { "OFF" },
            warning.current_mm
        );
        online.alarm.set_bit(bit, warning.active).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{LoggingSink, SimulatedCamera};
    use crate::light_curtain::NullLightCurtain;
    use crate::plc::MemoryPlc;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::new();
        config.robots.bind_addr = "127.0.0.1".to_string();
        config.robots.port = 0;
        for module in &mut config.modules {
            module.laser_host = "127.0.0.1".to_string();
            module.laser_port = 1;
        }
        config.laser.connect_timeout_ms = 200;
        config.plc.heartbeat_interval_ms = 20;
        config.plc.poll_interval_ms = 10;
        config
    }

    fn devices(plc: &MemoryPlc, modules: usize) -> DeviceSet {
        DeviceSet {
            plc: Box::new(plc.clone()),
            cameras: (0..modules)
                .map(|i| Arc::new(SimulatedCamera::new(&format!("cam{}", i + 1), Duration::from_millis(5))) as Arc<dyn ThermalCamera>)
                .collect(),
            sinks: (0..modules).map(|_| Box::new(LoggingSink::default()) as Box<dyn FrameSink>).collect(),
            light_curtain: Box::new(NullLightCurtain),
        }
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
    async fn test_second_start_is_rejected_while_running() {
        let config = test_config();
        let plc = MemoryPlc::new();
        let line = InspectionLine::new(config.clone());
        line.go_online(devices(&plc, config.modules.len())).await.unwrap();

        // The turntable light never comes on, so the run stays in its first wait
        assert!(line.start_inspection_sequence("CAR-1").await);
        assert!(line.is_running());
        assert!(!line.start_inspection_sequence("CAR-2").await);
        assert!(line.is_running());
        assert_eq!(line.run.lock().as_ref().map(|r| r.car.clone()), Some("CAR-1".to_string()));

        line.stop_inspection().await;
        assert!(!line.is_running());

        line.go_offline().await;
        assert!(!line.is_online().await);
    }

    #[tokio::test]
    async fn test_go_online_rejects_robot_zero() {
        let mut config = test_config();
        config.sequence.steps[0].robots = vec![0, 1];
        let plc = MemoryPlc::new();
        let line = InspectionLine::new(config.clone());

        let err = line.go_online(devices(&plc, config.modules.len())).await.unwrap_err();
        assert!(err.to_string().contains("unknown robot 0"));
        assert!(!line.is_online().await);
        assert!(!line.start_inspection_sequence("CAR-1").await);
    }

    #[tokio::test]
    async fn test_start_requires_online() {
        let line = InspectionLine::new(test_config());
        assert!(!line.start_inspection_sequence("CAR-1").await);
        assert!(!line.is_running());
    }

    #[tokio::test]
    async fn test_heartbeat_toggles_only_its_bit() {
        let config = test_config();
        let plc = MemoryPlc::new();
        let line = InspectionLine::new(config.clone());
        line.go_online(devices(&plc, config.modules.len())).await.unwrap();

        let response = config.plc.response_address;
        let heartbeat = config.signals.heartbeat.mask();
        eventually(|| {
            let values: Vec<u16> = plc.writes().iter().filter(|(a, _)| *a == response).map(|&(_, v)| v).collect();
            values.contains(&heartbeat) && values.iter().filter(|&&v| v == 0).count() >= 2
        })
        .await;
        assert!(plc.writes().iter().filter(|(a, _)| *a == response).all(|&(_, v)| v & !heartbeat == 0));

        line.go_offline().await;
    }

    #[tokio::test]
    async fn test_car_entry_handshake() {
        let config = test_config();
        let plc = MemoryPlc::new();
        let line = InspectionLine::new(config.clone());
        line.go_online(devices(&plc, config.modules.len())).await.unwrap();

        let status = config.plc.status_address;
        let response = config.plc.response_address;
        let pc_ok = config.signals.pc_response_ok.mask();

        plc.poke(status, config.signals.car_entry.mask());
        eventually(|| plc.peek(response) & pc_ok != 0).await;

        // PLC acknowledges; the PC drops its response bit
        plc.poke(status, config.signals.car_entry.mask() | config.signals.plc_response_ok.mask());
        eventually(|| plc.peek(response) & pc_ok == 0).await;

        line.go_offline().await;
    }
}
