//! Human-readable node status for the `status` command.
//!
//! [`StatusFormatter`] keeps the rendering identical between the firmware
//! console and the emulator.

use core::fmt;

use crate::clock::Clock;
use crate::confirm::WalkPhase;
use crate::digital::OutputDriver;
use crate::node::Node;
use crate::persist::Storage;
use crate::pwm::{FadeState, PwmDriver};
use crate::shader::ShaderState;

/// Renders a [`Node`] into status lines.
pub struct StatusFormatter<'a, C, D, P, S>
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
{
    node: &'a Node<C, D, P, S>,
}

impl<'a, C, D, P, S> StatusFormatter<'a, C, D, P, S>
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
{
    #[must_use]
    pub const fn new(node: &'a Node<C, D, P, S>) -> Self {
        Self { node }
    }

    /// Writes every status line, each terminated by `\n`.
    pub fn write_all<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        self.write_node_line(writer)?;
        writer.write_char('\n')?;
        self.write_outputs_line(writer)?;
        writer.write_char('\n')?;
        for channel in 0..self.node.shaders().positions().len() {
            if self.write_shader_line(writer, channel)? {
                writer.write_char('\n')?;
            }
        }
        for channel in 0..self.node.pwm().levels().len() {
            if self.write_pwm_line(writer, channel)? {
                writer.write_char('\n')?;
            }
        }
        self.write_confirm_line(writer)?;
        writer.write_char('\n')
    }

    /// `node addr=0x10 type=shader t=1234ms tx=0`
    pub fn write_node_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        let config = self.node.config();
        write!(
            writer,
            "node addr=0x{:02X} type={} t={}ms tx={}",
            config.address,
            config.device_type.label(),
            self.node.clock().now_ms(),
            self.node.pending_transmit().count()
        )
    }

    /// `outputs 0b...` with shader-reserved outputs shown as `r`.
    pub fn write_outputs_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        let outputs = self.node.outputs();
        writer.write_str("outputs ")?;
        for channel in (0..outputs.capacity()).rev() {
            let symbol = if outputs.is_reserved(channel) {
                'r'
            } else if outputs.is_on(channel) == Some(true) {
                '1'
            } else {
                '0'
            };
            writer.write_char(symbol)?;
        }
        write!(writer, " switch=0b{:02b}", self.node.switch_state())
    }

    /// Writes one configured shader; returns `false` for unconfigured ones.
    pub fn write_shader_line<W: fmt::Write>(
        &self,
        writer: &mut W,
        channel: usize,
    ) -> Result<bool, fmt::Error> {
        let Some(shader) = self.node.shaders().shader(channel) else {
            return Ok(false);
        };
        let Some(relays) = shader.relays else {
            return Ok(false);
        };
        write!(
            writer,
            "shader {channel} pos={} set={} state={} relays={}/{}",
            shader.actual_position,
            shader.set_position,
            shader_state_label(shader.state),
            relays.power,
            relays.direction
        )?;
        if shader.manual_override {
            writer.write_str(" manual")?;
        }
        Ok(true)
    }

    /// Writes one active PWM channel; returns `false` for idle dark ones.
    pub fn write_pwm_line<W: fmt::Write>(
        &self,
        writer: &mut W,
        channel: usize,
    ) -> Result<bool, fmt::Error> {
        let Some(state) = self.node.pwm().channel(channel) else {
            return Ok(false);
        };
        if !state.enabled && state.fade_state == FadeState::NoFade {
            return Ok(false);
        }
        write!(
            writer,
            "pwm {channel} level={} {}",
            state.level,
            if state.enabled { "on" } else { "off" }
        )?;
        match state.fade_state {
            FadeState::NoFade => {}
            FadeState::FadeUp => write!(writer, " fade-up->{}", state.fade_target)?,
            FadeState::FadeDown => write!(writer, " fade-down->{}", state.fade_target)?,
            FadeState::DelayOff => writer.write_str(" delay-off")?,
        }
        Ok(true)
    }

    /// `confirm phase=await target=0b01 pending=2`
    pub fn write_confirm_line<W: fmt::Write>(&self, writer: &mut W) -> fmt::Result {
        let confirm = self.node.confirm();
        let phase = match confirm.phase() {
            WalkPhase::Idle => "idle",
            WalkPhase::Ready => "ready",
            WalkPhase::InFlight => "in-flight",
            WalkPhase::Collision { .. } => "collision",
            WalkPhase::AwaitAck { .. } => "await",
        };
        let pending = confirm
            .clients()
            .iter()
            .filter(|entry| {
                !matches!(
                    entry.state,
                    crate::confirm::ConfirmState::Confirmed | crate::confirm::ConfirmState::GaveUp
                )
            })
            .count();
        write!(
            writer,
            "confirm phase={phase} target=0b{:02b} pending={pending}",
            confirm.target()
        )
    }
}

const fn shader_state_label(state: ShaderState) -> &'static str {
    match state {
        ShaderState::Stopped => "stopped",
        ShaderState::OpenInit => "open-init",
        ShaderState::Opening => "opening",
        ShaderState::CloseInit => "close-init",
        ShaderState::Closing => "closing",
        ShaderState::DirChangeOpenInit => "reverse-to-open",
        ShaderState::DirChangeCloseInit => "reverse-to-close",
        ShaderState::Exit => "exit",
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::String;

    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::DeviceType;
    use crate::config::NodeConfig;
    use crate::console::execute_line;
    use crate::digital::NoopOutputDriver;
    use crate::persist::RamStorage;
    use crate::pwm::NoopPwmDriver;

    #[test]
    fn renders_configured_channels_only() {
        let clock = ManualClock::new(1234);
        let mut node: Node<_, _, _, RamStorage> = Node::new(
            &clock,
            NodeConfig::new(0x10, DeviceType::ShaderPanel),
            NoopOutputDriver,
            NoopPwmDriver,
            RamStorage::new(),
        );
        execute_line(&mut node, "shader 2 setup 0 1 10s 10s").unwrap();
        execute_line(&mut node, "pwm 3 level 40").unwrap();
        execute_line(&mut node, "pwm 3 on").unwrap();

        let mut text = String::new();
        StatusFormatter::new(&node).write_all(&mut text).unwrap();

        assert!(text.starts_with("node addr=0x10 type=shader t=1234ms"));
        assert!(text.contains("shader 2 pos=0 set=0 state=stopped relays=0/1\n"));
        assert!(!text.contains("shader 0 "));
        assert!(text.contains("pwm 3 level=40 on\n"));
        assert!(text.contains("confirm phase=idle"));
        assert!(text.contains("rr switch=0b00"));
    }
}
