/*!
Robot controller link.

Robots connect to the PC as TCP clients and exchange ASCII lines terminated
by `\n`. The peer address decides which robot a connection belongs to; a new
connection from the same robot replaces the old session.
*/

mod messaging;
mod server;
mod session;

pub use messaging::{resilient_send_and_expect, send_and_expect, RetryPolicy};
pub use server::RobotServer;
pub use session::{normalize_line, RobotSession, MAX_LINE_BYTES};
