//! Service console shared between the firmware and the emulator.
//!
//! [`grammar`] turns a line into a [`Command`], [`executor`] applies it to a
//! [`crate::Node`] and [`status`] renders the node for the `status` command.

pub mod executor;
pub mod grammar;
pub mod status;

pub use executor::{ConsoleError, HELP, Outcome, execute, execute_line};
pub use grammar::{Command, ParseError, parse_command};
pub use status::StatusFormatter;
