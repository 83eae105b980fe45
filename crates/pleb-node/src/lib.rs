//! pleb-node: command-line front end and node topologies.

pub mod cli;
pub mod console;
pub mod topology;

pub use cli::{Args, Mode, NodeArgs};
