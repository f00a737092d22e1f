#![no_std]

// Portable logic for a field-bus actuator node.
//
// Everything here is free of the standard library so the same controllers run
// on the MCU firmware and inside the host emulator. Hardware is reached only
// through the driver traits each module exposes.

pub mod clock;
pub mod codec;
pub mod config;
pub mod confirm;
pub mod console;
pub mod digital;
pub mod node;
pub mod persist;
pub mod pwm;
pub mod shader;
pub mod telemetry;

pub use clock::{Clock, ManualClock, Millis};
pub use node::{Node, NodeAction};
