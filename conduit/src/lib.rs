//! Applications and ready-made scenarios for the `conduit_core` network
//! stack, and the command line that runs them.

pub mod applications;
pub mod cli;
pub mod scenarios;
