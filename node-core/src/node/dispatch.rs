//! Routing of received telegrams to the controllers.
//!
//! Requests are validated in full before anything changes, so a rejected
//! telegram leaves every controller untouched and sends no response.

use core::fmt;

use super::{Button, Node, NodeAction};
use crate::clock::Clock;
use crate::codec::telegram::VERSION_LEN;
use crate::codec::{
    BROADCAST, DeviceType, DeviceValue, Message, MessageKind, PwmCommand, SetState, ShaderSetup,
    Telegram,
};
use crate::config::FIRMWARE_VERSION;
use crate::digital::{OutputAction, OutputDriver, OutputError};
use crate::persist::Storage;
use crate::pwm::{PwmDriver, PwmError};
use crate::shader::ShaderError;
use crate::telemetry::TelemetryEventKind;

/// Reasons a telegram was not acted on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DispatchError {
    /// Addressed to another node, or our own transmission echoed back.
    NotAddressed,
    /// Payload is for a different device type.
    WrongDevice(DeviceType),
    /// Kind is handled elsewhere (e.g. by the bootloader) or not at all.
    Unsupported(MessageKind),
    /// Address reserved for broadcast.
    InvalidAddress(u8),
    Shader(ShaderError),
    Pwm(PwmError),
    Output(OutputError),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::NotAddressed => f.write_str("not addressed to this node"),
            DispatchError::WrongDevice(device) => {
                write!(f, "payload for {} device", device.label())
            }
            DispatchError::Unsupported(kind) => write!(f, "{kind:?} not supported"),
            DispatchError::InvalidAddress(address) => {
                write!(f, "address 0x{address:02X} is reserved")
            }
            DispatchError::Shader(error) => write!(f, "{error}"),
            DispatchError::Pwm(error) => write!(f, "{error}"),
            DispatchError::Output(error) => write!(f, "{error}"),
        }
    }
}

impl From<ShaderError> for DispatchError {
    fn from(error: ShaderError) -> Self {
        DispatchError::Shader(error)
    }
}

impl From<PwmError> for DispatchError {
    fn from(error: PwmError) -> Self {
        DispatchError::Pwm(error)
    }
}

impl From<OutputError> for DispatchError {
    fn from(error: OutputError) -> Self {
        DispatchError::Output(error)
    }
}

/// Deciseconds on the wire to milliseconds.
/// Rejects a setup table in which two channels claim the same relay.
fn relays_distinct(setup: &[ShaderSetup]) -> Result<(), ShaderError> {
    let configured = || setup.iter().filter(|entry| entry.is_configured());
    for (index, entry) in configured().enumerate() {
        let shared = configured().skip(index + 1).any(|other| {
            [other.power, other.direction]
                .into_iter()
                .any(|relay| relay == entry.power || relay == entry.direction)
        });
        if shared {
            return Err(ShaderError::RelayConflict);
        }
    }
    Ok(())
}

const fn ds_to_ms(ds: u16) -> u32 {
    ds as u32 * 100
}

impl<C, D, P, S> Node<C, D, P, S>
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
{
    /// Acts on a decoded telegram and queues the response, if any.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] when the telegram is not for this node or
    /// is rejected; no response is queued in that case.
    pub fn dispatch(&mut self, telegram: &Telegram) -> Result<Option<NodeAction>, DispatchError> {
        let sender = telegram.sender;
        if sender == self.config.address {
            return Err(DispatchError::NotAddressed);
        }

        self.record(TelemetryEventKind::TelegramReceived {
            sender,
            kind: telegram.kind(),
        });

        if let Some(receiver) = telegram.message.receiver()
            && receiver != self.config.address
            && receiver != BROADCAST
        {
            return Err(DispatchError::NotAddressed);
        }

        let own = self.config.address;
        let reply = |message: Message| Telegram::new(own, message);

        match telegram.message {
            Message::DevStartup { device_type } => {
                return Ok(Some(NodeAction::PeerStartup {
                    sender,
                    device_type,
                }));
            }
            Message::ButtonPressed1 => return Ok(Some(button(sender, Button::First))),
            Message::ButtonPressed2 => return Ok(Some(button(sender, Button::Second))),
            Message::ButtonPressed12 => return Ok(Some(button(sender, Button::Both))),
            Message::ReqReboot { .. } => {
                self.power_fail();
                return Ok(Some(NodeAction::Reboot));
            }
            Message::ReqUpdEnter { .. } => {
                self.power_fail();
                self.enqueue(reply(Message::RespUpdEnter { receiver: sender }));
                return Ok(Some(NodeAction::EnterBootloader));
            }
            Message::ReqUpdData { .. } | Message::ReqUpdTerm { .. } => {
                return Err(DispatchError::Unsupported(telegram.kind()));
            }
            Message::ReqInfo { .. } => {
                let version: [u8; VERSION_LEN] = FIRMWARE_VERSION;
                self.enqueue(reply(Message::RespInfo {
                    receiver: sender,
                    device_type: self.config.device_type,
                    version,
                }));
            }
            Message::ReqGetState { .. } => {
                let state = self.device_state();
                self.enqueue(reply(Message::RespGetState {
                    receiver: sender,
                    state,
                }));
            }
            Message::ReqSetState { state, .. } => {
                self.apply_set_state(&state)?;
                self.enqueue(reply(Message::RespSetState { receiver: sender }));
            }
            Message::ReqGetValue { .. } => {
                let value = self.device_value();
                self.enqueue(reply(Message::RespGetValue {
                    receiver: sender,
                    value,
                }));
            }
            Message::ReqSetValue { value, .. } => {
                self.apply_value(&value)?;
                self.enqueue(reply(Message::RespSetValue { receiver: sender }));
            }
            Message::ReqSwitchState { state, .. } => {
                self.apply_switch_state(state)?;
                let state = self.switch_state();
                self.enqueue(reply(Message::RespSwitchState {
                    receiver: sender,
                    state,
                }));
            }
            Message::RespSwitchState { state, .. } => {
                self.confirm.acknowledge(sender, state);
            }
            Message::ReqSetAddress { address, .. } => {
                if address == BROADCAST {
                    return Err(DispatchError::InvalidAddress(address));
                }
                self.config.set_address(address);
                self.confirm.set_config(self.config.confirm);
                self.config.store_address(&mut self.storage);
                self.enqueue(Telegram::new(
                    address,
                    Message::RespSetAddress { receiver: sender },
                ));
            }
            Message::ReqGetAddress { .. } => {
                self.enqueue(reply(Message::RespGetAddress {
                    receiver: sender,
                    address: own,
                }));
            }
            Message::ReqSetClientAddress { clients, .. } => {
                self.config.clients.addresses = clients;
                self.config.store_clients(&mut self.storage);
                self.enqueue(reply(Message::RespSetClientAddress { receiver: sender }));
            }
            Message::ReqGetClientAddress { .. } => {
                self.enqueue(reply(Message::RespGetClientAddress {
                    receiver: sender,
                    clients: self.config.clients.addresses,
                }));
            }
            Message::ReqEepromRead { address, .. } => {
                let data = self.storage.read(address);
                self.enqueue(reply(Message::RespEepromRead {
                    receiver: sender,
                    address,
                    data,
                }));
            }
            Message::ReqEepromWrite { address, data, .. } => {
                self.storage.write(address, data);
                self.enqueue(reply(Message::RespEepromWrite { receiver: sender }));
            }
            Message::RespUpdEnter { .. }
            | Message::RespUpdData { .. }
            | Message::RespUpdTerm { .. }
            | Message::RespInfo { .. }
            | Message::RespGetState { .. }
            | Message::RespSetState { .. }
            | Message::RespGetValue { .. }
            | Message::RespSetValue { .. }
            | Message::RespSetAddress { .. }
            | Message::RespGetAddress { .. }
            | Message::RespSetClientAddress { .. }
            | Message::RespGetClientAddress { .. }
            | Message::RespEepromRead { .. }
            | Message::RespEepromWrite { .. } => {}
        }

        Ok(None)
    }

    fn apply_set_state(&mut self, state: &SetState) -> Result<(), DispatchError> {
        if state.device_type() != self.config.device_type {
            return Err(DispatchError::WrongDevice(state.device_type()));
        }

        match *state {
            SetState::SwitchPanel { actions } => {
                self.outputs.apply_packed(&actions);
            }
            SetState::ShaderPanel { digital, shader } => {
                for (channel, target) in shader.iter().enumerate() {
                    match *target {
                        SetState::SHADER_UNCHANGED => {}
                        SetState::SHADER_STOP => {
                            self.shaders.validate_position(channel, 0)?;
                        }
                        position => self.shaders.validate_position(channel, position)?,
                    }
                }

                self.outputs.apply_packed(&digital);
                for (channel, target) in shader.iter().enumerate() {
                    match *target {
                        SetState::SHADER_UNCHANGED => {}
                        SetState::SHADER_STOP => self.shaders.stop(channel)?,
                        position => self.shaders.set_position(channel, position)?,
                    }
                }
            }
            SetState::PwmPanel {
                mask,
                command,
                level,
                duration_ds,
            } => self.apply_pwm_command(mask, command, level, duration_ds)?,
        }
        Ok(())
    }

    fn apply_pwm_command(
        &mut self,
        mask: u16,
        command: PwmCommand,
        level: u16,
        duration_ds: u16,
    ) -> Result<(), DispatchError> {
        let max = self.pwm.config().resolution.max_level();
        match command {
            PwmCommand::Unknown(_) => {
                return Err(DispatchError::Unsupported(MessageKind::ReqSetState));
            }
            PwmCommand::On | PwmCommand::Fade if level > max => {
                return Err(PwmError::InvalidLevel(level).into());
            }
            _ => {}
        }

        let channels = (0..16usize).filter(|channel| mask & (1 << channel) != 0);
        for channel in channels {
            match command {
                PwmCommand::Off => self.pwm.off(channel)?,
                PwmCommand::On => {
                    if level > 0 {
                        self.pwm.set_level(channel, level)?;
                    }
                    self.pwm.on(channel)?;
                }
                PwmCommand::Toggle => self.pwm.toggle(channel)?,
                PwmCommand::Fade => {
                    self.pwm
                        .fade_to(&self.clock, channel, level, ds_to_ms(duration_ds))?;
                }
                PwmCommand::DelayOff => {
                    self.pwm
                        .delay_off(&self.clock, channel, ds_to_ms(duration_ds))?;
                }
                PwmCommand::Unknown(_) => {}
            }
        }
        Ok(())
    }

    fn apply_value(&mut self, value: &DeviceValue) -> Result<(), DispatchError> {
        if value.device_type() != self.config.device_type {
            return Err(DispatchError::WrongDevice(value.device_type()));
        }

        match *value {
            DeviceValue::SwitchPanel => {}
            DeviceValue::ShaderPanel { setup } => {
                relays_distinct(&setup)?;
                for (channel, entry) in setup.iter().enumerate() {
                    self.validate_shader_setup(channel, *entry)?;
                }
                for (channel, entry) in setup.iter().enumerate() {
                    if *entry != self.config.shader_setup[channel] {
                        self.configure_shader(channel, *entry)?;
                    }
                }
            }
            DeviceValue::PwmPanel { level } => {
                let max = self.pwm.config().resolution.max_level();
                if let Some(bad) = level.iter().find(|value| **value > max) {
                    return Err(PwmError::InvalidLevel(*bad).into());
                }
                for (channel, value) in level.iter().enumerate() {
                    self.pwm.set_level(channel, *value)?;
                }
            }
        }
        Ok(())
    }

    /// Drives the two switch outputs from a switch-state bitmask.
    fn apply_switch_state(&mut self, state: u8) -> Result<(), DispatchError> {
        for channel in 0..2 {
            if self.outputs.is_reserved(channel) {
                return Err(OutputError::Reserved(channel).into());
            }
        }
        for channel in 0..2 {
            let action = if state & (1 << channel) != 0 {
                OutputAction::On
            } else {
                OutputAction::Off
            };
            self.outputs.apply(channel, action)?;
        }
        Ok(())
    }
}

const fn button(sender: u8, button: Button) -> NodeAction {
    NodeAction::Button { sender, button }
}
