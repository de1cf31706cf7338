/*!
Configuration management for the inspection line.

The line consumes one [`AppConfig`] holding every PLC address, device
endpoint and timing constant. It is stored as TOML.
*/

use crate::error::LineError;
use crate::signals::SignalTable;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shared::{BitIndex, WarningParams};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub plc: PlcConfig,
    pub signals: SignalTable,
    pub robots: RobotServerConfig,
    pub robot_messaging: RobotMessagingConfig,
    pub modules: Vec<ModuleConfig>,
    pub laser: LaserConfig,
    pub camera: CameraConfig,
    pub sequence: SequenceConfig,
    pub light_curtain: LightCurtainConfig,
}

impl AppConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        let robots = (1..=4u8)
            .map(|n| RobotConfig {
                ip: IpAddr::from([192, 168, 0, 10 + n]),
                status_address: 5000 + n as u16 * 10,
                move_address: 5100 + n as u16 * 10,
            })
            .collect();
        let modules = (1..=4u8)
            .map(|n| ModuleConfig {
                laser_host: format!("192.168.0.{}", 20 + n),
                laser_port: 9008,
                light_status_address: 5200 + n as u16 * 10,
                light_trigger_address: 5300 + n as u16 * 10,
                camera_id: format!("cam{}.xml", n),
            })
            .collect();

        Self {
            plc: PlcConfig::default(),
            signals: SignalTable::default(),
            robots: RobotServerConfig {
                bind_addr: "0.0.0.0".to_string(),
                port: 50000,
                robots,
            },
            robot_messaging: RobotMessagingConfig::default(),
            modules,
            laser: LaserConfig::default(),
            camera: CameraConfig::default(),
            sequence: SequenceConfig::default(),
            light_curtain: LightCurtainConfig::default(),
        }
    }

    /// Load configuration from a TOML file and validate it
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse config file as TOML")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize config to TOML")?;

        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> std::result::Result<(), LineError> {
        self.signals.validate()?;

        if self.modules.len() != self.robots.robots.len() {
            return Err(LineError::config(format!(
                "{} robots configured but {} modules; each robot owns one module",
                self.robots.robots.len(),
                self.modules.len()
            )));
        }
        if self.plc.poll_interval_ms == 0 || self.plc.ack_timeout_ms == 0 || self.plc.done_timeout_ms == 0 {
            return Err(LineError::config("PLC poll interval and timeouts must be non-zero"));
        }
        if self.robot_messaging.max_attempts == 0 || self.robot_messaging.reply_timeout_ms == 0 {
            return Err(LineError::config("robot messaging needs at least one attempt and a reply timeout"));
        }
        if self.laser.window == 0 || self.laser.frames == 0 || self.laser.warning.frames == 0 {
            return Err(LineError::config("laser window and frame counts must be non-zero"));
        }
        let warning = &self.laser.warning;
        if warning.window == 0 {
            return Err(LineError::config("laser warning window must be non-zero"));
        }
        if warning.required_count == 0 || warning.required_count > warning.frames {
            return Err(LineError::config(format!(
                "laser warning needs 1..={} close frames, got {}",
                warning.frames, warning.required_count
            )));
        }
        if self.camera.frame_count == 0 {
            return Err(LineError::config("camera burst frame count must be non-zero"));
        }
        let known = |robot: u8| robot >= 1 && robot as usize <= self.robots.robots.len();
        for step in &self.sequence.steps {
            if let Some(bad) = step.robots.iter().find(|&&r| !known(r)) {
                return Err(LineError::config(format!("step '{}' names unknown robot {}", step.name, bad)));
            }
        }
        for robot in [self.sequence.front_robot, self.sequence.rear_robot] {
            if !known(robot) {
                return Err(LineError::config(format!("measurement robot {} is not configured", robot)));
            }
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// PLC link, word addresses and polling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlcConfig {
    pub host: String,
    pub port: u16,
    /// PLC -> PC status word
    pub status_address: u16,
    /// PC -> PLC response word
    pub response_address: u16,
    pub turntable_angle_address: u16,
    /// One bit per module, set while its laser warning is active
    pub distance_alarm_address: u16,
    pub poll_interval_ms: u64,
    /// Wait for a handshake acknowledgement
    pub ack_timeout_ms: u64,
    /// Wait for a robot move or turntable rotation to finish
    pub done_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub io_timeout_ms: u64,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.10".to_string(),
            port: 5002,
            status_address: 5000,
            response_address: 5001,
            turntable_angle_address: 5002,
            distance_alarm_address: 5003,
            poll_interval_ms: 100,
            ack_timeout_ms: 10_000,
            done_timeout_ms: 60_000,
            heartbeat_interval_ms: 1000,
            io_timeout_ms: 2000,
        }
    }
}

impl PlcConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn done_timeout(&self) -> Duration {
        Duration::from_millis(self.done_timeout_ms)
    }
}

/// Robot TCP listener and peer table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Robot `n` (1-based) is entry `n - 1`
    pub robots: Vec<RobotConfig>,
}

/// One positioning robot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotConfig {
    /// Peer address the robot controller connects from
    pub ip: IpAddr,
    /// Word carrying the robot-moving status bit
    pub status_address: u16,
    /// Word where the teach-position bit is commanded
    pub move_address: u16,
}

/// Request/reply timing for robot messaging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotMessagingConfig {
    /// Wait for the expected reply per send
    pub reply_timeout_ms: u64,
    /// Resends of the same message after a reply timeout
    pub max_retries: u32,
    pub session_wait_ms: u64,
    pub session_poll_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Full send/expect cycles before giving up
    pub max_attempts: u32,
}

impl Default for RobotMessagingConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 5000,
            max_retries: 2,
            session_wait_ms: 1000,
            session_poll_ms: 100,
            backoff_initial_ms: 150,
            backoff_max_ms: 1000,
            max_attempts: 5,
        }
    }
}

/// Laser, light and camera belonging to one robot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub laser_host: String,
    pub laser_port: u16,
    pub light_status_address: u16,
    pub light_trigger_address: u16,
    /// Identifier handed to the vendor camera adapter
    pub camera_id: String,
}

/// Laser query and warning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaserConfig {
    /// Frames aggregated per distance query
    pub frames: usize,
    /// Adjacent spots averaged per query window
    pub window: usize,
    pub roi_start: Option<usize>,
    pub roi_end: Option<usize>,
    pub stride: usize,
    pub ignore_zero: bool,
    pub query_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub warning: WarningParams,
}

impl Default for LaserConfig {
    fn default() -> Self {
        Self {
            frames: 10,
            window: 5,
            roi_start: None,
            roi_end: None,
            stride: 1,
            ignore_zero: false,
            query_timeout_ms: 3000,
            connect_timeout_ms: 3000,
            warning: WarningParams::default(),
        }
    }
}

/// Thermal camera burst and reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub frame_count: u32,
    pub focus: f32,
    /// Pause between arming and starting a burst
    pub ready_delay_ms: u64,
    pub burst_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    /// Capacity of the vendor event channel
    pub event_capacity: usize,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            frame_count: 80,
            focus: 100.0,
            ready_delay_ms: 1000,
            burst_timeout_ms: 15_000,
            reconnect_initial_ms: 250,
            reconnect_max_ms: 30_000,
            event_capacity: 256,
        }
    }
}

/// One capture step of the inspection run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    /// Participating robots (1-based)
    pub robots: Vec<u8>,
    /// Teach position commanded at the start of the step
    pub teach_position: BitIndex,
    /// Request a turntable rotation once the step completes
    pub rotate_after: bool,
    /// Measure the vehicle length once the step completes
    pub measure_after: bool,
}

/// Inspection sequence timing and robot vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    /// Delay between starting consecutive robots of a step
    pub robot_stagger_ms: u64,
    pub moving_settle_ms: u64,
    pub capture_settle_ms: u64,
    pub home_position: BitIndex,
    pub measure_position: BitIndex,
    /// Reply to the offset move; `{robot}` is replaced by the robot number
    pub offset_reached_token: String,
    /// Command that advances to the second capture position
    pub next_position_command: String,
    /// Reply once the second capture position is reached
    pub next_reached_token: String,
    /// Robot whose laser looks at the vehicle front during measurement
    pub front_robot: u8,
    /// Robot whose laser looks at the vehicle rear during measurement
    pub rear_robot: u8,
    /// Distance between the two measuring sensors (mm)
    pub measurement_span_mm: f64,
    pub steps: Vec<StepConfig>,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            robot_stagger_ms: 250,
            moving_settle_ms: 500,
            capture_settle_ms: 1200,
            home_position: BitIndex::masked(15),
            measure_position: BitIndex::masked(1),
            offset_reached_token: "Position{robot}-2".to_string(),
            next_position_command: "ok".to_string(),
            next_reached_token: "Position{robot}-3".to_string(),
            front_robot: 1,
            rear_robot: 3,
            measurement_span_mm: 7000.0,
            steps: vec![
                StepConfig {
                    name: "side".to_string(),
                    robots: vec![1, 2, 3, 4],
                    teach_position: BitIndex::masked(0),
                    rotate_after: true,
                    measure_after: true,
                },
                StepConfig {
                    name: "diagonal".to_string(),
                    robots: vec![1, 2, 3, 4],
                    teach_position: BitIndex::masked(2),
                    rotate_after: false,
                    measure_after: false,
                },
            ],
        }
    }
}

impl SequenceConfig {
    /// Expand a reply token for one robot
    pub fn token(template: &str, robot: u8) -> String {
        template.replace("{robot}", &robot.to_string())
    }
}

/// Light curtain geometry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightCurtainConfig {
    /// `host:port` of the serial device server; no curtain when unset
    pub endpoint: Option<String>,
    pub height_offset_mm: u32,
    pub mm_per_step: u32,
    pub connect_timeout_ms: u64,
}

impl Default for LightCurtainConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            height_offset_mm: 440,
            mm_per_step: 30,
            connect_timeout_ms: 2000,
        }
    }
}
