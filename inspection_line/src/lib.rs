/*!
# Inspection Line

Device orchestration for the vehicle thermal inspection line: PLC
handshakes, robot positioning over TCP, laser distance sensing, thermal
camera bursts and the inspection sequence tying them together.

## Modules

- [`plc`] - Serialized PLC register access, bit waits, MC protocol client
- [`robot`] - Robot TCP listener, sessions and request/reply messaging
- [`laser`] - MDI laser client with proximity warnings and distance queries
- [`camera`] - Thermal camera burst capture with reconnect
- [`light_curtain`] - Vehicle height from the light curtain
- [`sequencer`] - Online mode, background workers and the inspection run
- [`bench`] - Simulated devices for running without hardware
*/

pub mod bench;
pub mod camera;
pub mod config;
pub mod error;
pub mod laser;
pub mod light_curtain;
pub mod plc;
pub mod robot;
pub mod sequencer;
pub mod signals;

pub use config::AppConfig;
pub use error::{LineError, Result};
pub use sequencer::{DeviceSet, InspectionLine};
