/*!
Simulated line for running without hardware.

[`Bench::start`] points the configuration at local endpoints and plays
the other side of every device:

- an in-memory PLC that answers handshakes, pulses the robot-moving bits
  and reports the turntable angle
- robot controllers that connect to the robot listener and answer the
  move vocabulary
- laser sensors streaming MDI packets after the start command
- a light curtain device server
- simulated thermal cameras
*/

use crate::camera::{FrameSink, LoggingSink, SimulatedCamera, ThermalCamera};
use crate::config::{AppConfig, LightCurtainConfig, SequenceConfig};
use crate::error::Result;
use crate::light_curtain;
use crate::plc::MemoryPlc;
use crate::sequencer::DeviceSet;
use shared::plc_word::{bit_mask, is_bit_on};
use shared::protocol::MDI_START_COMMAND;
use shared::{MdiFrame, MdiHeader};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TICK: Duration = Duration::from_millis(10);
const MOVE_TIME: Duration = Duration::from_millis(150);
const ROTATE_TIME: Duration = Duration::from_millis(300);
const LASER_SPOTS: usize = 100;

#[derive(Default)]
struct Counters {
    car_entry: AtomicBool,
    moves: AtomicU32,
    rotations: AtomicU32,
    robot_commands: AtomicU32,
}

/// Device simulators for one bench session
pub struct Bench {
    plc: MemoryPlc,
    cameras: Vec<Arc<SimulatedCamera>>,
    curtain: LightCurtainConfig,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Bench {
    /// Start every simulator and rewrite `config` to reach them
    pub async fn start(config: &mut AppConfig) -> Result<Self> {
        let cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let mut tasks = Vec::new();

        config.robots.bind_addr = "127.0.0.1".to_string();
        if config.robots.port == 0 {
            config.robots.port = free_port()?;
        }
        for (i, robot) in config.robots.robots.iter_mut().enumerate() {
            robot.ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 11 + i as u8));
        }

        for (i, module) in config.modules.iter_mut().enumerate() {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            module.laser_host = "127.0.0.1".to_string();
            module.laser_port = listener.local_addr()?.port();
            let base_mm = 1200 + 100 * i as u16;
            tasks.push(tokio::spawn(laser_sensor(listener, base_mm, cancel.clone())));
        }

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        config.light_curtain.endpoint = Some(listener.local_addr()?.to_string());
        tasks.push(tokio::spawn(curtain_device(listener, cancel.clone())));

        let server = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), config.robots.port);
        for (i, robot) in config.robots.robots.iter().enumerate() {
            let index = (i + 1) as u8;
            tasks.push(tokio::spawn(robot_controller(
                index,
                robot.ip,
                server,
                config.sequence.clone(),
                Arc::clone(&counters),
                cancel.clone(),
            )));
        }

        let plc = MemoryPlc::new();
        tasks.push(tokio::spawn(plc_responder(
            plc.clone(),
            config.clone(),
            Arc::clone(&counters),
            cancel.clone(),
        )));

        let cameras = config
            .modules
            .iter()
            .map(|m| Arc::new(SimulatedCamera::new(&m.camera_id, Duration::from_millis(10))))
            .collect();

        info!("🧪 Bench started: robots dial 127.0.0.1:{}", config.robots.port);
        Ok(Self {
            plc,
            cameras,
            curtain: config.light_curtain.clone(),
            counters,
            cancel,
            tasks,
        })
    }

    /// Collaborators wired to the simulators
    pub fn devices(&self) -> DeviceSet {
        DeviceSet {
            plc: Box::new(self.plc.clone()),
            cameras: self
                .cameras
                .iter()
                .map(|c| Arc::clone(c) as Arc<dyn ThermalCamera>)
                .collect(),
            sinks: self
                .cameras
                .iter()
                .map(|_| Box::new(LoggingSink::default()) as Box<dyn FrameSink>)
                .collect(),
            light_curtain: light_curtain::from_config(&self.curtain),
        }
    }

    /// Raise the car-entry bit until the PC answers it
    pub fn signal_car_entry(&self) {
        info!("🧪 Car entering the booth");
        self.counters.car_entry.store(true, Ordering::SeqCst);
    }

    pub fn plc(&self) -> &MemoryPlc {
        &self.plc
    }

    pub fn camera(&self, module: u8) -> Option<&Arc<SimulatedCamera>> {
        self.cameras.get((module as usize).checked_sub(1)?)
    }

    /// Teach-position moves the PLC side has executed
    pub fn moves(&self) -> u32 {
        self.counters.moves.load(Ordering::SeqCst)
    }

    pub fn rotations(&self) -> u32 {
        self.counters.rotations.load(Ordering::SeqCst)
    }

    /// Robot commands answered by the simulated controllers
    pub fn robot_commands(&self) -> u32 {
        self.counters.robot_commands.load(Ordering::SeqCst)
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("🧪 Bench stopped");
    }
}

fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

async fn tick_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[derive(Default)]
struct RobotAxis {
    moving_since: Option<Instant>,
}

/// PLC side of every handshake, evaluated once per tick
async fn plc_responder(plc: MemoryPlc, config: AppConfig, counters: Arc<Counters>, cancel: CancellationToken) {
    let signals = &config.signals;
    let addr = &config.plc;
    let light_ready = bit_mask(&signals.light_ready);
    let mut axes: Vec<RobotAxis> = config.robots.robots.iter().map(|_| RobotAxis::default()).collect();
    let mut rotate_since: Option<Instant> = None;

    for module in &config.modules {
        plc.poke(module.light_status_address, light_ready);
    }

    loop {
        let response = plc.peek(addr.response_address);
        let pc_ok = is_bit_on(response, signals.pc_response_ok);
        if pc_ok {
            counters.car_entry.store(false, Ordering::SeqCst);
        }
        let triggered = config.modules.iter().any(|m| plc.peek(m.light_trigger_address) != 0);
        let answer = pc_ok || is_bit_on(response, signals.start_inspection) || triggered;

        let mut status = signals.turntable_light_on.mask();
        if answer {
            status |= signals.plc_response_ok.mask();
        }
        if counters.car_entry.load(Ordering::SeqCst) {
            status |= signals.car_entry.mask();
        }
        plc.poke(addr.status_address, status);

        for (i, (robot, axis)) in config.robots.robots.iter().zip(axes.iter_mut()).enumerate() {
            let command = plc.peek(robot.move_address);
            match axis.moving_since {
                None if command != 0 => {
                    debug!(robot = i + 1, "moving to 0x{:04X}", command);
                    axis.moving_since = Some(Instant::now());
                    counters.moves.fetch_add(1, Ordering::SeqCst);
                    plc.poke(robot.status_address, signals.robot_moving.mask());
                }
                Some(since) if command == 0 && since.elapsed() >= MOVE_TIME => {
                    axis.moving_since = None;
                    plc.poke(robot.status_address, 0);
                }
                _ => {}
            }
        }

        if is_bit_on(response, signals.turntable_rotate) {
            let since = *rotate_since.get_or_insert_with(|| {
                counters.rotations.fetch_add(1, Ordering::SeqCst);
                Instant::now()
            });
            if since.elapsed() >= ROTATE_TIME {
                plc.poke(addr.turntable_angle_address, signals.turntable_angle_reached.mask());
            }
        } else {
            rotate_since = None;
            plc.poke(addr.turntable_angle_address, 0);
        }

        if !tick_or_cancel(TICK, &cancel).await {
            break;
        }
    }
}

/// Robot controller dialing the listener from its own loopback address
async fn robot_controller(
    index: u8,
    local_ip: IpAddr,
    server: SocketAddr,
    vocabulary: SequenceConfig,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    let offset_reply = SequenceConfig::token(&vocabulary.offset_reached_token, index);
    let next_reply = SequenceConfig::token(&vocabulary.next_reached_token, index);

    while !cancel.is_cancelled() {
        let stream = match dial(local_ip, server).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(robot = index, "dial failed: {}", e);
                if !tick_or_cancel(Duration::from_millis(300), &cancel).await {
                    break;
                }
                continue;
            }
        };
        info!("🧪 Robot {} connected from {}", index, local_ip);

        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => return,
                line = lines.next_line() => line,
            };
            let Ok(Some(line)) = line else {
                warn!(robot = index, "robot link closed");
                break;
            };
            let line = line.trim();
            let reply = if line.starts_with("move,") {
                &offset_reply
            } else if line.eq_ignore_ascii_case(&vocabulary.next_position_command) {
                &next_reply
            } else {
                debug!(robot = index, "ignoring '{}'", line);
                continue;
            };
            counters.robot_commands.fetch_add(1, Ordering::SeqCst);
            if !tick_or_cancel(MOVE_TIME, &cancel).await {
                return;
            }
            if writer.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

async fn dial(local_ip: IpAddr, server: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = TcpSocket::new_v4()?;
    socket.bind(SocketAddr::new(local_ip, 0))?;
    tokio::time::timeout(Duration::from_secs(1), socket.connect(server))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))?
}

fn laser_packet(no: u16, base_mm: u16) -> Vec<u8> {
    let header = MdiHeader {
        packet_type: 0,
        packet_size: 0,
        packet_no: no,
        total_no: 1,
        sub_no: 1,
        scan_freq_hz: 40,
        scan_spots: 0,
        first_angle_mdeg: -45_000,
        delta_angle_mdeg: 900,
        timestamp_ms: no,
    };
    // Bowl-shaped profile with the vehicle closest in the middle
    let middle = LASER_SPOTS as i32 / 2;
    let distances: Vec<u16> = (0..LASER_SPOTS as i32)
        .map(|i| base_mm + ((i - middle).unsigned_abs() * 8) as u16)
        .collect();
    MdiFrame::encode(&header, &distances, &[])
}

async fn laser_sensor(listener: TcpListener, base_mm: u16, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let Ok((mut sock, _)) = accepted else {
            continue;
        };
        let mut command = [0u8; MDI_START_COMMAND.len()];
        let started = tokio::select! {
            _ = cancel.cancelled() => return,
            read = sock.read_exact(&mut command) => read.is_ok() && command == MDI_START_COMMAND,
        };
        if !started {
            warn!("🧪 laser peer sent no start command");
            continue;
        }

        let mut no = 0u16;
        while tick_or_cancel(Duration::from_millis(25), &cancel).await {
            if sock.write_all(&laser_packet(no, base_mm)).await.is_err() {
                break;
            }
            no = no.wrapping_add(1);
        }
    }
}

async fn curtain_device(listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let Ok((mut sock, _)) = accepted else {
            continue;
        };
        let mut step = 0u8;
        while tick_or_cancel(Duration::from_millis(50), &cancel).await {
            // Roof line rising and falling as the car passes
            let high = 30 + (step % 10).min(10 - step % 10);
            if sock.write_all(&[2, high]).await.is_err() {
                break;
            }
            step = step.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::InspectionLine;

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::new();
        config.robots.port = 0;
        config.plc.poll_interval_ms = 10;
        config.plc.ack_timeout_ms = 2000;
        config.plc.done_timeout_ms = 5000;
        config.plc.heartbeat_interval_ms = 50;
        config.laser.frames = 3;
        config.camera.frame_count = 5;
        config.camera.ready_delay_ms = 10;
        config.camera.burst_timeout_ms = 5000;
        config.sequence.robot_stagger_ms = 10;
        config.sequence.moving_settle_ms = 10;
        config.sequence.capture_settle_ms = 10;
        config
    }

    /// Count trigger writes made while another module's trigger was still raised
    fn overlapping_triggers(writes: &[(u16, u16)], triggers: &[u16]) -> usize {
        let mut raised: Vec<u16> = Vec::new();
        let mut overlaps = 0;
        for &(address, value) in writes.iter().filter(|(a, _)| triggers.contains(a)) {
            if value == 0 {
                raised.retain(|&a| a != address);
                continue;
            }
            if raised.iter().any(|&a| a != address) {
                overlaps += 1;
            }
            if !raised.contains(&address) {
                raised.push(address);
            }
        }
        overlaps
    }

    async fn wait_until(mut done: impl FnMut() -> bool, attempts: u32) -> bool {
        for _ in 0..attempts {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    #[test]
    fn test_overlapping_triggers_counts_interleaved_raises() {
        let triggers = [5310, 5320];
        let serial = [(5310, 1), (5310, 0), (5320, 1), (5320, 0)];
        assert_eq!(overlapping_triggers(&serial, &triggers), 0);
        let interleaved = [(5310, 1), (100, 1), (5320, 1), (5310, 0), (5320, 0)];
        assert_eq!(overlapping_triggers(&interleaved, &triggers), 1);
    }

    #[test]
    fn test_laser_packet_parses() {
        let frame = MdiFrame::parse(&laser_packet(7, 1200)).unwrap();
        assert_eq!(frame.header.packet_no, 7);
        assert_eq!(frame.distances.len(), LASER_SPOTS);
        assert_eq!(frame.distances.iter().copied().min(), Some(1200));
    }

    #[tokio::test]
    async fn test_full_inspection_on_bench() {
        let mut config = fast_config();
        let bench = Bench::start(&mut config).await.unwrap();
        let line = InspectionLine::new(config.clone());
        line.go_online(bench.devices()).await.unwrap();

        bench.signal_car_entry();
        let status = config.plc.status_address;
        let car_entry = config.signals.car_entry;
        for _ in 0..200 {
            if !is_bit_on(bench.plc().peek(status), car_entry) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(line.start_inspection_sequence("BENCH-1").await);
        for _ in 0..3000 {
            if !line.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!line.is_running(), "inspection did not finish");

        let robots = config.robots.robots.len() as u32;
        let steps = config.sequence.steps.len() as u32;
        // Teach and home per robot and step, plus the two measuring moves
        assert_eq!(bench.moves(), steps * robots * 2 + 2);
        // Offset move and next position per robot and step
        assert_eq!(bench.robot_commands(), steps * robots * 2);
        assert_eq!(bench.rotations(), 1);

        // Light triggers of concurrent robots are raised one module at a time
        let triggers: Vec<u16> = config.modules.iter().map(|m| m.light_trigger_address).collect();
        let writes = bench.plc().writes();
        for &trigger in &triggers {
            assert!(
                writes.iter().any(|&(a, v)| a == trigger && v != 0),
                "trigger 0x{:04X} never raised",
                trigger
            );
        }
        assert_eq!(overlapping_triggers(&writes, &triggers), 0);

        line.go_offline().await;
        bench.stop().await;
    }

    #[tokio::test]
    async fn test_stop_mid_step_unwinds_promptly() {
        let mut config = fast_config();
        let bench = Bench::start(&mut config).await.unwrap();
        let line = InspectionLine::new(config.clone());
        line.go_online(bench.devices()).await.unwrap();

        assert!(line.start_inspection_sequence("BENCH-STOP").await);
        assert!(wait_until(|| bench.moves() >= 1, 500).await, "no robot ever moved");

        tokio::time::timeout(Duration::from_secs(3), line.stop_inspection())
            .await
            .expect("stop did not return while robots were mid-step");
        assert!(!line.is_running());

        // Let the responder catch up with the last command written before the stop
        tokio::time::sleep(Duration::from_millis(100)).await;
        let moves = bench.moves();
        let robots = config.robots.robots.len() as u32;
        let steps = config.sequence.steps.len() as u32;
        assert!(moves < steps * robots * 2 + 2);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(bench.moves(), moves, "robots kept moving after stop");
        assert_eq!(bench.rotations(), 0);

        // The line stays online and accepts a new run
        assert!(line.is_online().await);
        assert!(line.start_inspection_sequence("BENCH-NEXT").await);
        line.stop_inspection().await;

        line.go_offline().await;
        bench.stop().await;
    }

    #[tokio::test]
    async fn test_camera_lookup_is_one_based() {
        let mut config = fast_config();
        let bench = Bench::start(&mut config).await.unwrap();
        assert!(bench.camera(0).is_none());
        assert_eq!(bench.camera(1).map(|c| c.id().to_string()), Some(config.modules[0].camera_id.clone()));
        bench.stop().await;
    }
}
