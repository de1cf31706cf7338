/*!
Named PLC signal bits.

Every bit the line reads or writes has exactly one meaning within the word
(domain) it lives in. The table is part of the configuration and is checked
at load time so no two signals of the same word collide.
*/

use crate::error::{LineError, Result};
use serde::{Deserialize, Serialize};
use shared::BitIndex;
use std::collections::HashMap;
use std::fmt;

/// Which PLC word a signal lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    /// PLC -> PC status word
    PlcStatus,
    /// PC -> PLC response word
    PcResponse,
    /// Per-robot status word
    RobotStatus,
    /// Per-module light status word
    LightStatus,
    /// Turntable angle status word
    TurntableAngle,
}

/// Semantic meaning of a signal bit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    CarEntry,
    SequenceInitialize,
    TurntableLightOn,
    PlcResponseOk,
    PcResponseOk,
    StartInspection,
    TurntableRotate,
    Heartbeat,
    RobotMoving,
    LightReady,
    TurntableAngleReached,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CarEntry => "car-entry",
            Self::SequenceInitialize => "sequence-initialize",
            Self::TurntableLightOn => "turntable-light-on",
            Self::PlcResponseOk => "plc-response-ok",
            Self::PcResponseOk => "pc-response-ok",
            Self::StartInspection => "start-inspection",
            Self::TurntableRotate => "turntable-rotate",
            Self::Heartbeat => "heartbeat",
            Self::RobotMoving => "robot-moving",
            Self::LightReady => "light-ready",
            Self::TurntableAngleReached => "turntable-angle-reached",
        };
        f.write_str(name)
    }
}

/// Bit assignments for every named signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalTable {
    pub car_entry: BitIndex,
    pub sequence_initialize: BitIndex,
    pub turntable_light_on: BitIndex,
    pub plc_response_ok: BitIndex,

    pub heartbeat: BitIndex,
    pub pc_response_ok: BitIndex,
    pub start_inspection: BitIndex,
    pub turntable_rotate: BitIndex,

    pub robot_moving: BitIndex,
    /// All of these must be on before a capture may be triggered
    pub light_ready: Vec<BitIndex>,
    pub turntable_angle_reached: BitIndex,
}

impl Default for SignalTable {
    fn default() -> Self {
        let b = BitIndex::masked;
        Self {
            car_entry: b(0),
            sequence_initialize: b(1),
            turntable_light_on: b(2),
            plc_response_ok: b(3),
            heartbeat: b(0),
            pc_response_ok: b(1),
            start_inspection: b(2),
            turntable_rotate: b(3),
            robot_moving: b(0),
            light_ready: vec![b(0), b(1)],
            turntable_angle_reached: b(2),
        }
    }
}

impl SignalTable {
    /// Flattened `{domain, bit} -> signal` entries
    pub fn entries(&self) -> Vec<(Domain, BitIndex, Signal)> {
        let mut entries = vec![
            (Domain::PlcStatus, self.car_entry, Signal::CarEntry),
            (Domain::PlcStatus, self.sequence_initialize, Signal::SequenceInitialize),
            (Domain::PlcStatus, self.turntable_light_on, Signal::TurntableLightOn),
            (Domain::PlcStatus, self.plc_response_ok, Signal::PlcResponseOk),
            (Domain::PcResponse, self.heartbeat, Signal::Heartbeat),
            (Domain::PcResponse, self.pc_response_ok, Signal::PcResponseOk),
            (Domain::PcResponse, self.start_inspection, Signal::StartInspection),
            (Domain::PcResponse, self.turntable_rotate, Signal::TurntableRotate),
            (Domain::RobotStatus, self.robot_moving, Signal::RobotMoving),
            (Domain::TurntableAngle, self.turntable_angle_reached, Signal::TurntableAngleReached),
        ];
        entries.extend(self.light_ready.iter().map(|&bit| (Domain::LightStatus, bit, Signal::LightReady)));
        entries
    }

    /// Reject tables where one bit of a word carries two meanings
    pub fn validate(&self) -> Result<()> {
        if self.light_ready.is_empty() {
            return Err(LineError::config("light_ready needs at least one bit"));
        }

        let mut seen: HashMap<(Domain, BitIndex), Signal> = HashMap::new();
        for (domain, bit, signal) in self.entries() {
            if let Some(existing) = seen.insert((domain, bit), signal) {
                return Err(LineError::config(format!(
                    "bit {} of {:?} word assigned to both {} and {}",
                    bit, domain, existing, signal
                )));
            }
        }
        Ok(())
    }

    /// Meaning of `bit` within `domain`, if any
    pub fn meaning(&self, domain: Domain, bit: BitIndex) -> Option<Signal> {
        self.entries()
            .into_iter()
            .find(|&(d, b, _)| d == domain && b == bit)
            .map(|(_, _, signal)| signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_valid() {
        let table = SignalTable::default();
        table.validate().unwrap();
        assert_eq!(
            table.meaning(Domain::PlcStatus, BitIndex::new(0).unwrap()),
            Some(Signal::CarEntry)
        );
        assert_eq!(
            table.meaning(Domain::PcResponse, BitIndex::new(0).unwrap()),
            Some(Signal::Heartbeat)
        );
        assert_eq!(table.meaning(Domain::PlcStatus, BitIndex::new(9).unwrap()), None);
    }

    #[test]
    fn test_duplicate_bit_in_same_word_is_rejected() {
        let table = SignalTable {
            start_inspection: BitIndex::new(0).unwrap(),
            ..SignalTable::default()
        };
        let err = table.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeat"));
    }

    #[test]
    fn test_empty_light_ready_is_rejected() {
        let table = SignalTable {
            light_ready: Vec::new(),
            ..SignalTable::default()
        };
        assert!(table.validate().is_err());
    }
}
