#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![cfg_attr(not(target_os = "none"), allow(dead_code))]

mod console;
mod hw;
mod telemetry;

#[cfg(target_os = "none")]
mod panic;
#[cfg(target_os = "none")]
mod runtime;

#[cfg(not(target_os = "none"))]
fn main() {}
