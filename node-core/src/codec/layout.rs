//! Field layout of the unstuffed bytes that follow the kind byte.
//!
//! Multi-byte integers are little-endian. Sizes are fixed per kind and
//! device type; there is no length prefix.

use heapless::Vec;

use super::MAX_BODY;
use super::telegram::{
    CLIENT_SLOTS, DIGITAL_ACTION_BYTES, DIGITAL_STATE_BYTES, DeviceState, DeviceType, DeviceValue,
    Message, MessageKind, PWM_CHANNELS, PwmCommand, SHADER_CHANNELS, SWITCH_ACTION_BYTES, SetState,
    ShaderSetup, UPDATE_CHUNK, VERSION_LEN,
};

pub(crate) type Body = Vec<u8, MAX_BODY>;

/// Cursor over a fully received body. Callers size the body from
/// [`MessageKind::payload_len`] so reads never run short.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let value = *self.bytes.get(self.offset)?;
        self.offset += 1;
        Some(value)
    }

    fn u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.array()?))
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let end = self.offset.checked_add(N)?;
        let slice = self.bytes.get(self.offset..end)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.offset = end;
        Some(out)
    }

    fn u16_array<const N: usize>(&mut self) -> Option<[u16; N]> {
        let mut out = [0u16; N];
        for slot in &mut out {
            *slot = self.u16()?;
        }
        Some(out)
    }
}

struct Writer<'a> {
    body: &'a mut Body,
}

impl Writer<'_> {
    fn u8(&mut self, value: u8) -> Option<()> {
        self.body.push(value).ok()
    }

    fn u16(&mut self, value: u16) -> Option<()> {
        self.bytes(&value.to_le_bytes())
    }

    fn u32(&mut self, value: u32) -> Option<()> {
        self.bytes(&value.to_le_bytes())
    }

    fn bytes(&mut self, values: &[u8]) -> Option<()> {
        self.body.extend_from_slice(values).ok()
    }

    fn u16s(&mut self, values: &[u16]) -> Option<()> {
        values.iter().try_for_each(|value| self.u16(*value))
    }
}

/// Parses a body whose length already matches the kind and device type.
pub(crate) fn decode_body(kind: MessageKind, body: &[u8]) -> Option<Message> {
    let mut r = Reader::new(body);

    let receiver = if kind.has_receiver() { r.u8()? } else { 0 };
    let device = if kind.has_device_type() {
        Some(DeviceType::from_raw(r.u8()?)?)
    } else {
        None
    };

    let message = match kind {
        MessageKind::DevStartup => Message::DevStartup {
            device_type: device?,
        },
        MessageKind::ReqReboot => Message::ReqReboot { receiver },
        MessageKind::ReqUpdEnter => Message::ReqUpdEnter { receiver },
        MessageKind::RespUpdEnter => Message::RespUpdEnter { receiver },
        MessageKind::ReqUpdData => Message::ReqUpdData {
            receiver,
            address: r.u32()?,
            data: r.array::<UPDATE_CHUNK>()?,
        },
        MessageKind::RespUpdData => Message::RespUpdData {
            receiver,
            address: r.u32()?,
        },
        MessageKind::ReqUpdTerm => Message::ReqUpdTerm { receiver },
        MessageKind::RespUpdTerm => Message::RespUpdTerm {
            receiver,
            success: r.u8()? != 0,
        },
        MessageKind::ReqInfo => Message::ReqInfo { receiver },
        MessageKind::RespInfo => Message::RespInfo {
            receiver,
            device_type: device?,
            version: r.array::<VERSION_LEN>()?,
        },
        MessageKind::ReqGetState => Message::ReqGetState { receiver },
        MessageKind::RespGetState => Message::RespGetState {
            receiver,
            state: read_state(&mut r, device?)?,
        },
        MessageKind::ReqSetState => Message::ReqSetState {
            receiver,
            state: read_set_state(&mut r, device?)?,
        },
        MessageKind::RespSetState => Message::RespSetState { receiver },
        MessageKind::ReqGetValue => Message::ReqGetValue { receiver },
        MessageKind::RespGetValue => Message::RespGetValue {
            receiver,
            value: read_value(&mut r, device?)?,
        },
        MessageKind::ReqSetValue => Message::ReqSetValue {
            receiver,
            value: read_value(&mut r, device?)?,
        },
        MessageKind::RespSetValue => Message::RespSetValue { receiver },
        MessageKind::ReqSwitchState => Message::ReqSwitchState {
            receiver,
            state: r.u8()?,
        },
        MessageKind::RespSwitchState => Message::RespSwitchState {
            receiver,
            state: r.u8()?,
        },
        MessageKind::ButtonPressed1 => Message::ButtonPressed1,
        MessageKind::ButtonPressed2 => Message::ButtonPressed2,
        MessageKind::ButtonPressed12 => Message::ButtonPressed12,
        MessageKind::ReqSetAddress => Message::ReqSetAddress {
            receiver,
            address: r.u8()?,
        },
        MessageKind::RespSetAddress => Message::RespSetAddress { receiver },
        MessageKind::ReqGetAddress => Message::ReqGetAddress { receiver },
        MessageKind::RespGetAddress => Message::RespGetAddress {
            receiver,
            address: r.u8()?,
        },
        MessageKind::ReqSetClientAddress => Message::ReqSetClientAddress {
            receiver,
            clients: r.array::<CLIENT_SLOTS>()?,
        },
        MessageKind::RespSetClientAddress => Message::RespSetClientAddress { receiver },
        MessageKind::ReqGetClientAddress => Message::ReqGetClientAddress { receiver },
        MessageKind::RespGetClientAddress => Message::RespGetClientAddress {
            receiver,
            clients: r.array::<CLIENT_SLOTS>()?,
        },
        MessageKind::ReqEepromRead => Message::ReqEepromRead {
            receiver,
            address: r.u16()?,
        },
        MessageKind::RespEepromRead => Message::RespEepromRead {
            receiver,
            address: r.u16()?,
            data: r.u8()?,
        },
        MessageKind::ReqEepromWrite => Message::ReqEepromWrite {
            receiver,
            address: r.u16()?,
            data: r.u8()?,
        },
        MessageKind::RespEepromWrite => Message::RespEepromWrite { receiver },
    };

    Some(message)
}

fn read_state(r: &mut Reader<'_>, device: DeviceType) -> Option<DeviceState> {
    Some(match device {
        DeviceType::SwitchPanel => DeviceState::SwitchPanel { outputs: r.u8()? },
        DeviceType::ShaderPanel => DeviceState::ShaderPanel {
            digital: r.array::<DIGITAL_STATE_BYTES>()?,
            shader: r.array::<SHADER_CHANNELS>()?,
        },
        DeviceType::PwmPanel => DeviceState::PwmPanel {
            enabled: r.u16()?,
            level: r.u16_array::<PWM_CHANNELS>()?,
        },
    })
}

fn read_set_state(r: &mut Reader<'_>, device: DeviceType) -> Option<SetState> {
    Some(match device {
        DeviceType::SwitchPanel => SetState::SwitchPanel {
            actions: r.array::<SWITCH_ACTION_BYTES>()?,
        },
        DeviceType::ShaderPanel => SetState::ShaderPanel {
            digital: r.array::<DIGITAL_ACTION_BYTES>()?,
            shader: r.array::<SHADER_CHANNELS>()?,
        },
        DeviceType::PwmPanel => SetState::PwmPanel {
            mask: r.u16()?,
            command: PwmCommand::from_raw(r.u8()?),
            level: r.u16()?,
            duration_ds: r.u16()?,
        },
    })
}

fn read_value(r: &mut Reader<'_>, device: DeviceType) -> Option<DeviceValue> {
    Some(match device {
        DeviceType::SwitchPanel => DeviceValue::SwitchPanel,
        DeviceType::ShaderPanel => {
            let mut setup = [ShaderSetup::UNCONFIGURED; SHADER_CHANNELS];
            for slot in &mut setup {
                *slot = ShaderSetup {
                    power: r.u8()?,
                    direction: r.u8()?,
                    open_ds: r.u16()?,
                    close_ds: r.u16()?,
                };
            }
            DeviceValue::ShaderPanel { setup }
        }
        DeviceType::PwmPanel => DeviceValue::PwmPanel {
            level: r.u16_array::<PWM_CHANNELS>()?,
        },
    })
}

/// Serialises the fields after the kind byte. Returns `None` only if the body
/// buffer is undersized, which [`MAX_BODY`] rules out.
pub(crate) fn encode_body(message: &Message, body: &mut Body) -> Option<()> {
    let mut w = Writer { body };

    if let Some(receiver) = message.receiver() {
        w.u8(receiver)?;
    }
    if let Some(device) = message.device_type() {
        w.u8(device.to_raw())?;
    }

    match message {
        Message::ReqUpdData { address, data, .. } => {
            w.u32(*address)?;
            w.bytes(data)?;
        }
        Message::RespUpdData { address, .. } => w.u32(*address)?,
        Message::RespUpdTerm { success, .. } => w.u8(u8::from(*success))?,
        Message::RespInfo { version, .. } => w.bytes(version)?,
        Message::RespGetState { state, .. } => match state {
            DeviceState::SwitchPanel { outputs } => w.u8(*outputs)?,
            DeviceState::ShaderPanel { digital, shader } => {
                w.bytes(digital)?;
                w.bytes(shader)?;
            }
            DeviceState::PwmPanel { enabled, level } => {
                w.u16(*enabled)?;
                w.u16s(level)?;
            }
        },
        Message::ReqSetState { state, .. } => match state {
            SetState::SwitchPanel { actions } => w.bytes(actions)?,
            SetState::ShaderPanel { digital, shader } => {
                w.bytes(digital)?;
                w.bytes(shader)?;
            }
            SetState::PwmPanel {
                mask,
                command,
                level,
                duration_ds,
            } => {
                w.u16(*mask)?;
                w.u8(command.to_raw())?;
                w.u16(*level)?;
                w.u16(*duration_ds)?;
            }
        },
        Message::RespGetValue { value, .. } | Message::ReqSetValue { value, .. } => match value {
            DeviceValue::SwitchPanel => {}
            DeviceValue::ShaderPanel { setup } => {
                for entry in setup {
                    w.u8(entry.power)?;
                    w.u8(entry.direction)?;
                    w.u16(entry.open_ds)?;
                    w.u16(entry.close_ds)?;
                }
            }
            DeviceValue::PwmPanel { level } => w.u16s(level)?,
        },
        Message::ReqSwitchState { state, .. } | Message::RespSwitchState { state, .. } => {
            w.u8(*state)?;
        }
        Message::ReqSetAddress { address, .. } | Message::RespGetAddress { address, .. } => {
            w.u8(*address)?;
        }
        Message::ReqSetClientAddress { clients, .. }
        | Message::RespGetClientAddress { clients, .. } => w.bytes(clients)?,
        Message::ReqEepromRead { address, .. } => w.u16(*address)?,
        Message::RespEepromRead { address, data, .. }
        | Message::ReqEepromWrite { address, data, .. } => {
            w.u16(*address)?;
            w.u8(*data)?;
        }
        Message::DevStartup { .. }
        | Message::ReqReboot { .. }
        | Message::ReqUpdEnter { .. }
        | Message::RespUpdEnter { .. }
        | Message::ReqUpdTerm { .. }
        | Message::ReqInfo { .. }
        | Message::ReqGetState { .. }
        | Message::RespSetState { .. }
        | Message::ReqGetValue { .. }
        | Message::RespSetValue { .. }
        | Message::ButtonPressed1
        | Message::ButtonPressed2
        | Message::ButtonPressed12
        | Message::RespSetAddress { .. }
        | Message::ReqGetAddress { .. }
        | Message::RespSetClientAddress { .. }
        | Message::ReqGetClientAddress { .. }
        | Message::RespEepromWrite { .. } => {}
    }

    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_little_endian() {
        let mut body = Body::new();
        let message = Message::ReqEepromWrite {
            receiver: 0x10,
            address: 0x0140,
            data: 0xAB,
        };
        encode_body(&message, &mut body).unwrap();
        assert_eq!(body.as_slice(), &[0x10, 0x40, 0x01, 0xAB]);
    }

    #[test]
    fn body_length_matches_declared_size() {
        let mut body = Body::new();
        let message = Message::ReqSetState {
            receiver: 3,
            state: SetState::PwmPanel {
                mask: 0x0004,
                command: PwmCommand::Fade,
                level: 255,
                duration_ds: 20,
            },
        };
        encode_body(&message, &mut body).unwrap();
        let declared = MessageKind::ReqSetState
            .payload_len(Some(DeviceType::PwmPanel))
            .unwrap();
        assert_eq!(body.len(), 2 + declared);
        assert_eq!(decode_body(MessageKind::ReqSetState, &body), Some(message));
    }
}
