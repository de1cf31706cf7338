use super::{sleep_or_cancel, Online};
use crate::config::{SequenceConfig, StepConfig};
use crate::error::{LineError, Result};
use crate::laser::MinAvgQuery;
use crate::robot::resilient_send_and_expect;
use chrono::{DateTime, Local};
use serde::Serialize;
use shared::BitIndex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one robot within a step
#[derive(Debug, Clone, Serialize)]
pub struct RobotReport {
    pub robot: u8,
    pub distance_mm: Option<f64>,
    /// One entry per capture position, `true` when the burst completed
    pub captures: Vec<bool>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    pub duration_ms: u64,
    pub robots: Vec<RobotReport>,
}

/// Summary logged at the end of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub car: String,
    pub started_at: DateTime<Local>,
    pub duration_ms: u64,
    pub height_mm: u32,
    pub front_mm: Option<f64>,
    pub rear_mm: Option<f64>,
    pub vehicle_length_mm: Option<f64>,
    pub steps: Vec<StepReport>,
}

pub(super) async fn run_inspection(online: Arc<Online>, car: String, cancel: CancellationToken) -> Result<RunReport> {
    let started = Instant::now();
    let mut report = RunReport {
        car: car.clone(),
        started_at: Local::now(),
        duration_ms: 0,
        height_mm: 0,
        front_mm: None,
        rear_mm: None,
        vehicle_length_mm: None,
        steps: Vec::new(),
    };
    info!("🚦 {} inspection sequence started", car);

    report.height_mm = start_handshake(&online, &cancel).await?;
    info!("vehicle height {} mm", report.height_mm);

    let participants: BTreeSet<u8> = online
        .config
        .sequence
        .steps
        .iter()
        .flat_map(|step| step.robots.iter().copied())
        .collect();
    for robot in participants {
        let session = online
            .robots
            .wait_for_session(robot, online.retry.session_wait, online.retry.session_poll, &cancel)
            .await?;
        match session {
            Some(_) => info!(robot, "robot session ready"),
            None => warn!(robot, "robot not connected yet; messaging will keep retrying"),
        }
    }

    for step in online.config.sequence.steps.clone() {
        let step_report = run_step(&online, &car, &step, &cancel).await?;
        info!("✅ Step '{}' finished in {} ms", step.name, step_report.duration_ms);
        report.steps.push(step_report);

        if step.measure_after {
            let (front, rear) = measure_vehicle(&online, &cancel).await?;
            report.front_mm = front;
            report.rear_mm = rear;
            report.vehicle_length_mm = vehicle_length(online.config.sequence.measurement_span_mm, front, rear);
            match report.vehicle_length_mm {
                Some(length) => info!("📏 Vehicle length {:.0} mm", length),
                None => warn!("vehicle length unavailable"),
            }
        }
        if step.rotate_after {
            rotate_turntable(&online, &cancel).await?;
        }
    }

    report.duration_ms = started.elapsed().as_millis() as u64;
    match serde_json::to_string(&report) {
        Ok(json) => info!("📋 Run report: {}", json),
        Err(e) => warn!("run report not serializable: {}", e),
    }
    info!("🏁 {} inspection sequence finished", car);
    Ok(report)
}

/// Light check, start handshake and height readout
async fn start_handshake(online: &Online, cancel: &CancellationToken) -> Result<u32> {
    let plc = &online.plc;
    let status = online.config.plc.status_address;
    let signals = &online.config.signals;

    let light_on = plc
        .wait_for_bit(status, signals.turntable_light_on, true, online.ack_policy(), cancel, "turntable light")
        .await?;
    if !light_on {
        warn!("turntable light did not report on");
    }

    online.response.set_bit(signals.start_inspection, true).await;
    let acked = plc
        .wait_for_bit(status, signals.plc_response_ok, true, online.ack_policy(), cancel, "start ack")
        .await?;
    if acked {
        online.response.set_bit(signals.start_inspection, false).await;
    } else {
        warn!("PLC did not acknowledge inspection start");
    }

    Ok(online.curtain.stop().await)
}

/// Run the robot template on every participant, staggered, and wait for all
async fn run_step(online: &Arc<Online>, car: &str, step: &StepConfig, cancel: &CancellationToken) -> Result<StepReport> {
    let started = Instant::now();
    let stagger = Duration::from_millis(online.config.sequence.robot_stagger_ms);
    info!("Step '{}' started with robots {:?}", step.name, step.robots);

    let mut tasks = JoinSet::new();
    let mut launched = Ok(());
    for (i, &robot) in step.robots.iter().enumerate() {
        if i > 0 {
            if let Err(e) = sleep_or_cancel(stagger, cancel).await {
                launched = Err(e);
                break;
            }
        }
        let online = Arc::clone(online);
        let step = step.clone();
        let car = car.to_string();
        let cancel = cancel.clone();
        tasks.spawn(async move { (robot, robot_step(&online, robot, &step, &car, &cancel).await) });
        info!(robot, "robot started");
    }

    let robots = join_robots(tasks).await;
    launched?;
    Ok(StepReport {
        name: step.name.clone(),
        duration_ms: started.elapsed().as_millis() as u64,
        robots: robots?,
    })
}

/// Wait for every robot task, even after one of them failed.
///
/// A failed robot is recorded in its report. Cancellation is returned once
/// all tasks have unwound.
async fn join_robots(mut tasks: JoinSet<(u8, Result<RobotReport>)>) -> Result<Vec<RobotReport>> {
    let mut robots = Vec::with_capacity(tasks.len());
    let mut cancelled = false;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(report))) => robots.push(report),
            Ok((robot, Err(e))) if e.is_cancelled() => {
                debug!(robot, "robot step cancelled");
                cancelled = true;
            }
            Ok((robot, Err(e))) => {
                error!(robot, "robot step failed: {}", e);
                robots.push(RobotReport {
                    robot,
                    distance_mm: None,
                    captures: Vec::new(),
                    errors: vec![e.to_string()],
                });
            }
            Err(e) => error!("robot task failed: {}", e),
        }
    }
    if cancelled {
        return Err(LineError::Cancelled);
    }
    robots.sort_by_key(|r| r.robot);
    Ok(robots)
}

/// Per-robot template. Cancellation and an unknown robot number are returned
/// as errors; everything else is logged and recorded in the report.
async fn robot_step(online: &Online, robot: u8, step: &StepConfig, car: &str, cancel: &CancellationToken) -> Result<RobotReport> {
    let seq = &online.config.sequence;
    let settle = Duration::from_millis(seq.moving_settle_ms);
    let capture_settle = Duration::from_millis(seq.capture_settle_ms);
    let mut report = RobotReport {
        robot,
        distance_mm: None,
        captures: Vec::new(),
        errors: Vec::new(),
    };

    move_robot(online, robot, step.teach_position, cancel).await?;

    report.distance_mm = measure_distance(online, robot, cancel).await?;
    match report.distance_mm {
        Some(distance) => {
            let token = SequenceConfig::token(&seq.offset_reached_token, robot);
            let command = format!("move,{}", distance);
            advance(online, robot, &command, &token, &mut report, cancel).await?;
        }
        None => {
            warn!(robot, "no distance reading; capturing without the offset move");
            report.errors.push("distance unavailable".to_string());
        }
    }
    sleep_or_cancel(settle, cancel).await?;

    let label = format!("{}_{}_{}a", car, step.name, robot);
    report.captures.push(capture(online, robot, &label, cancel).await?);
    sleep_or_cancel(capture_settle, cancel).await?;

    let token = SequenceConfig::token(&seq.next_reached_token, robot);
    advance(online, robot, &seq.next_position_command, &token, &mut report, cancel).await?;
    sleep_or_cancel(settle, cancel).await?;

    let label = format!("{}_{}_{}b", car, step.name, robot);
    report.captures.push(capture(online, robot, &label, cancel).await?);
    sleep_or_cancel(capture_settle, cancel).await?;

    move_robot(online, robot, seq.home_position, cancel).await?;
    Ok(report)
}

async fn advance(
    online: &Online,
    robot: u8,
    command: &str,
    token: &str,
    report: &mut RobotReport,
    cancel: &CancellationToken,
) -> Result<()> {
    match resilient_send_and_expect(&online.robots, robot, command, token, &online.retry, cancel).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            error!(robot, "'{}' got no '{}': {}", command, token, e);
            report.errors.push(format!("{}: {}", command, e));
            Ok(())
        }
    }
}

/// Command a teach position through the PLC and wait for the move to finish
async fn move_robot(online: &Online, robot: u8, position: BitIndex, cancel: &CancellationToken) -> Result<bool> {
    let Some(cfg) = slot(robot).and_then(|i| online.config.robots.robots.get(i)) else {
        return Err(LineError::config(format!("robot {} is not configured", robot)));
    };
    let plc = &online.plc;
    let moving = online.config.signals.robot_moving;

    if !plc.is_connected().await {
        warn!(robot, "PLC disconnected; move to position {} skipped", position);
        return Ok(false);
    }

    let idle = plc
        .wait_for_bit(cfg.status_address, moving, false, online.ack_policy(), cancel, "robot ready")
        .await?;
    if !idle {
        warn!(robot, "robot still reports moving; check the robot state");
    }

    plc.set_word(cfg.move_address, position.mask()).await;
    let started = plc
        .wait_for_bit(cfg.status_address, moving, true, online.ack_policy(), cancel, "robot start")
        .await?;
    if started {
        plc.set_word(cfg.move_address, 0).await;
    } else {
        warn!(robot, "no PLC response to move request for position {}", position);
    }

    let done = plc
        .wait_for_bit(cfg.status_address, moving, false, online.done_policy(), cancel, "robot move done")
        .await?;
    if done {
        info!(robot, "robot reached position {}", position);
    } else {
        warn!(robot, "robot did not finish moving to position {}", position);
    }
    Ok(done)
}

/// Windowed minimum distance from the robot's laser
async fn measure_distance(online: &Online, robot: u8, cancel: &CancellationToken) -> Result<Option<f64>> {
    let Some(laser) = slot(robot).and_then(|i| online.lasers.get(i)) else {
        return Ok(None);
    };
    if !laser.is_connected() {
        warn!(module = robot, "laser not connected");
        return Ok(None);
    }

    let cfg = &online.config.laser;
    let query = MinAvgQuery {
        frames: cfg.frames,
        window: cfg.window,
        roi_start: cfg.roi_start,
        roi_end: cfg.roi_end,
        stride: cfg.stride,
        ignore_zero: cfg.ignore_zero,
        timeout: Duration::from_millis(cfg.query_timeout_ms),
    };
    match laser.capture_min_avg(&query, cancel).await {
        Ok(result) => Ok(result.avg_distance_mm),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            warn!(module = robot, "distance query failed: {}", e);
            Ok(None)
        }
    }
}

/// Light check and trigger under the capture gate, then wait for the burst
async fn capture(online: &Online, module: u8, label: &str, cancel: &CancellationToken) -> Result<bool> {
    let Some(index) = slot(module) else {
        return Err(LineError::config("module numbers start at 1"));
    };
    let (Some(camera), Some(module_cfg)) = (online.cameras.get(index), online.config.modules.get(index)) else {
        return Ok(false);
    };
    let plc = &online.plc;
    let signals = &online.config.signals;

    let gate = tokio::select! {
        _ = cancel.cancelled() => return Err(LineError::Cancelled),
        gate = online.capture_gate.lock() => gate,
    };

    let lights = plc
        .wait_for_bits(module_cfg.light_status_address, &signals.light_ready, true, online.ack_policy(), cancel, "light ready")
        .await?;
    if !lights {
        warn!(module, "light not ready; check the module light");
    }

    if let Err(e) = camera.ready_capture() {
        warn!(module, "camera not ready: {}", e);
        return Ok(false);
    }
    sleep_or_cancel(Duration::from_millis(online.config.camera.ready_delay_ms), cancel).await?;

    let waiter = match camera.start_capture(online.config.camera.frame_count) {
        Ok(waiter) => waiter,
        Err(e) => {
            warn!(module, "burst not started: {}", e);
            return Ok(false);
        }
    };
    info!(module, "📸 {} capture started", label);

    plc.set_word(module_cfg.light_trigger_address, 1).await;
    let acked = plc
        .wait_for_bit(
            online.config.plc.status_address,
            signals.plc_response_ok,
            true,
            online.ack_policy(),
            cancel,
            "light trigger ack",
        )
        .await?;
    if acked {
        plc.set_word(module_cfg.light_trigger_address, 0).await;
    } else {
        warn!(module, "no PLC response to light trigger");
    }
    drop(gate);

    let timeout = Duration::from_millis(online.config.camera.burst_timeout_ms);
    let filled = camera.wait_for_burst(waiter, timeout, cancel).await?;
    if !filled {
        warn!(module, "{} capture incomplete", label);
    }
    Ok(filled)
}

/// Park the measuring robots and read front and rear distances
async fn measure_vehicle(online: &Online, cancel: &CancellationToken) -> Result<(Option<f64>, Option<f64>)> {
    let seq = &online.config.sequence;
    info!("vehicle length measurement started");
    move_robot(online, seq.front_robot, seq.measure_position, cancel).await?;
    move_robot(online, seq.rear_robot, seq.measure_position, cancel).await?;

    let front = measure_distance(online, seq.front_robot, cancel).await?;
    let rear = measure_distance(online, seq.rear_robot, cancel).await?;
    Ok((front, rear))
}

/// Zero-based slot of a 1-based robot or module number
fn slot(number: u8) -> Option<usize> {
    (number as usize).checked_sub(1)
}

fn vehicle_length(span_mm: f64, front: Option<f64>, rear: Option<f64>) -> Option<f64> {
    Some(span_mm - front? - rear?)
}

async fn rotate_turntable(online: &Online, cancel: &CancellationToken) -> Result<()> {
    let signals = &online.config.signals;
    info!("🔄 Turntable rotation requested");
    online.response.set_bit(signals.turntable_rotate, true).await;
    let reached = online
        .plc
        .wait_for_bit(
            online.config.plc.turntable_angle_address,
            signals.turntable_angle_reached,
            true,
            online.done_policy(),
            cancel,
            "turntable angle",
        )
        .await?;
    if reached {
        online.response.set_bit(signals.turntable_rotate, false).await;
        info!("turntable reached its angle");
    } else {
        warn!("turntable did not report the angle");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn report(robot: u8) -> RobotReport {
        RobotReport {
            robot,
            distance_mm: Some(450.0),
            captures: vec![true, true],
            errors: Vec::new(),
        }
    }

    #[test]
    fn test_slot_rejects_zero() {
        assert_eq!(slot(0), None);
        assert_eq!(slot(1), Some(0));
        assert_eq!(slot(4), Some(3));
    }

    #[tokio::test]
    async fn test_failed_robot_does_not_abort_the_others() {
        let slow_done = Arc::new(AtomicBool::new(false));
        let mut tasks: JoinSet<(u8, Result<RobotReport>)> = JoinSet::new();
        tasks.spawn(async { (1u8, Err(LineError::config("robot 1 is not configured"))) });
        let done = Arc::clone(&slow_done);
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            done.store(true, Ordering::SeqCst);
            (2u8, Ok(report(2)))
        });
        tasks.spawn(async { (3u8, Ok(report(3))) });

        let robots = join_robots(tasks).await.unwrap();
        assert!(slow_done.load(Ordering::SeqCst));
        assert_eq!(robots.iter().map(|r| r.robot).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(robots[0].errors.len(), 1);
        assert!(robots[0].captures.is_empty());
        assert!(robots[1].errors.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_is_reported_after_all_robots_unwind() {
        let slow_done = Arc::new(AtomicBool::new(false));
        let mut tasks: JoinSet<(u8, Result<RobotReport>)> = JoinSet::new();
        tasks.spawn(async { (1u8, Err(LineError::Cancelled)) });
        let done = Arc::clone(&slow_done);
        tasks.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            done.store(true, Ordering::SeqCst);
            (2u8, Ok(report(2)))
        });

        let err = join_robots(tasks).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(slow_done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_vehicle_length() {
        assert_eq!(vehicle_length(7000.0, Some(1200.0), Some(1300.0)), Some(4500.0));
        assert_eq!(vehicle_length(7000.0, None, Some(1300.0)), None);
    }

    #[test]
    fn test_report_serializes_as_one_line() {
        let report = RunReport {
            car: "12GA3456".to_string(),
            started_at: Local::now(),
            duration_ms: 1500,
            height_mm: 1480,
            front_mm: Some(1200.0),
            rear_mm: None,
            vehicle_length_mm: None,
            steps: vec![StepReport {
                name: "side".to_string(),
                duration_ms: 900,
                robots: vec![RobotReport {
                    robot: 1,
                    distance_mm: Some(450.0),
                    captures: vec![true, false],
                    errors: Vec::new(),
                }],
            }],
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains('\n'));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["car"], "12GA3456");
        assert_eq!(value["steps"][0]["robots"][0]["captures"][1], false);
        assert!(value["vehicle_length_mm"].is_null());
    }
}
