/*!
Laser distance sensor client.

The sensor streams MDI scan packets over TCP once it has received the
start command. [`LaserRangeClient`] frames and decodes the stream, keeps a
hysteretic proximity warning up to date and answers on-demand
minimum-distance queries over the next few frames.
*/

mod client;
mod framer;

pub use client::{LaserRangeClient, LaserWarning, MinAvgQuery, MinAvgResult};
pub use framer::{FramerStats, MdiFramer};
