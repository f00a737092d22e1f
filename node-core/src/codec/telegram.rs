//! Typed telegrams exchanged on the bus.

/// Number of shader channels carried in shader-panel payloads.
pub const SHADER_CHANNELS: usize = 15;
/// Number of PWM channels carried in PWM-panel payloads.
pub const PWM_CHANNELS: usize = 16;
/// Bytes of packed digital output state in a shader-panel state report.
pub const DIGITAL_STATE_BYTES: usize = 4;
/// Bytes of packed 2-bit output actions in a shader-panel set-state request.
pub const DIGITAL_ACTION_BYTES: usize = 8;
/// Bytes of packed 2-bit output actions in a switch-panel set-state request.
pub const SWITCH_ACTION_BYTES: usize = 2;
/// Length of the firmware version string in info responses.
pub const VERSION_LEN: usize = 16;
/// Number of peer slots in the client address table.
pub const CLIENT_SLOTS: usize = 16;
/// Bytes of image data carried by one update chunk.
pub const UPDATE_CHUNK: usize = 32;

/// Hardware personality of a node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceType {
    /// Plain relay outputs driven by wall switches.
    SwitchPanel,
    /// Blind drivers plus general digital outputs.
    ShaderPanel,
    /// Dimmer outputs.
    PwmPanel,
}

impl DeviceType {
    const SWITCH_PANEL_CODE: u8 = 0x00;
    const SHADER_PANEL_CODE: u8 = 0x01;
    const PWM_PANEL_CODE: u8 = 0x02;

    /// Encodes the device type discriminator.
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            DeviceType::SwitchPanel => Self::SWITCH_PANEL_CODE,
            DeviceType::ShaderPanel => Self::SHADER_PANEL_CODE,
            DeviceType::PwmPanel => Self::PWM_PANEL_CODE,
        }
    }

    /// Decodes a device type discriminator.
    #[must_use]
    pub const fn from_raw(code: u8) -> Option<Self> {
        match code {
            Self::SWITCH_PANEL_CODE => Some(DeviceType::SwitchPanel),
            Self::SHADER_PANEL_CODE => Some(DeviceType::ShaderPanel),
            Self::PWM_PANEL_CODE => Some(DeviceType::PwmPanel),
            _ => None,
        }
    }

    /// Human-readable label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            DeviceType::SwitchPanel => "switch",
            DeviceType::ShaderPanel => "shader",
            DeviceType::PwmPanel => "pwm",
        }
    }
}

macro_rules! message_kinds {
    ($($variant:ident = $code:literal),+ $(,)?) => {
        /// Discriminator byte following the sender address.
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum MessageKind {
            $($variant,)+
        }

        impl MessageKind {
            /// Every kind known to this firmware, in code order.
            pub const ALL: &'static [MessageKind] = &[$(MessageKind::$variant,)+];

            /// Encodes the kind byte.
            #[must_use]
            pub const fn to_raw(self) -> u8 {
                match self {
                    $(MessageKind::$variant => $code,)+
                }
            }

            /// Decodes a kind byte; unknown codes yield `None`.
            #[must_use]
            pub const fn from_raw(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(MessageKind::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

message_kinds! {
    DevStartup = 0x00,
    ReqReboot = 0x01,
    ReqUpdEnter = 0x02,
    RespUpdEnter = 0x03,
    ReqUpdData = 0x04,
    RespUpdData = 0x05,
    ReqUpdTerm = 0x06,
    RespUpdTerm = 0x07,
    ReqInfo = 0x08,
    RespInfo = 0x09,
    ReqGetState = 0x0A,
    RespGetState = 0x0B,
    ReqSetState = 0x0C,
    RespSetState = 0x0D,
    ReqGetValue = 0x0E,
    RespGetValue = 0x0F,
    ReqSetValue = 0x10,
    RespSetValue = 0x11,
    ReqSwitchState = 0x12,
    RespSwitchState = 0x13,
    ButtonPressed1 = 0x14,
    ButtonPressed2 = 0x15,
    ButtonPressed12 = 0x16,
    ReqSetAddress = 0x17,
    RespSetAddress = 0x18,
    ReqGetAddress = 0x19,
    RespGetAddress = 0x1A,
    ReqSetClientAddress = 0x1B,
    RespSetClientAddress = 0x1C,
    ReqGetClientAddress = 0x1D,
    RespGetClientAddress = 0x1E,
    ReqEepromRead = 0x1F,
    RespEepromRead = 0x20,
    ReqEepromWrite = 0x21,
    RespEepromWrite = 0x22,
}

impl MessageKind {
    /// Returns `true` when the telegram carries a receiver address.
    #[must_use]
    pub const fn has_receiver(self) -> bool {
        !matches!(
            self,
            MessageKind::DevStartup
                | MessageKind::ButtonPressed1
                | MessageKind::ButtonPressed2
                | MessageKind::ButtonPressed12
        )
    }

    /// Returns `true` when a device type discriminator follows the receiver.
    #[must_use]
    pub const fn has_device_type(self) -> bool {
        matches!(
            self,
            MessageKind::DevStartup
                | MessageKind::RespInfo
                | MessageKind::RespGetState
                | MessageKind::ReqSetState
                | MessageKind::RespGetValue
                | MessageKind::ReqSetValue
        )
    }

    /// Size of the fields after the receiver and device type.
    ///
    /// Device-typed kinds return `None` when called without a device type.
    #[must_use]
    pub const fn payload_len(self, device: Option<DeviceType>) -> Option<usize> {
        let len = match (self, device) {
            (MessageKind::ReqUpdData, _) => 4 + UPDATE_CHUNK,
            (MessageKind::RespUpdData, _) => 4,
            (MessageKind::RespInfo, _) => VERSION_LEN,
            (
                MessageKind::RespUpdTerm
                | MessageKind::ReqSwitchState
                | MessageKind::RespSwitchState
                | MessageKind::ReqSetAddress
                | MessageKind::RespGetAddress,
                _,
            ) => 1,
            (MessageKind::ReqSetClientAddress | MessageKind::RespGetClientAddress, _) => {
                CLIENT_SLOTS
            }
            (MessageKind::ReqEepromRead, _) => 2,
            (MessageKind::RespEepromRead | MessageKind::ReqEepromWrite, _) => 3,
            (MessageKind::RespGetState, Some(device)) => DeviceState::encoded_len(device),
            (MessageKind::ReqSetState, Some(device)) => SetState::encoded_len(device),
            (MessageKind::RespGetValue | MessageKind::ReqSetValue, Some(device)) => {
                DeviceValue::encoded_len(device)
            }
            (
                MessageKind::RespGetState
                | MessageKind::ReqSetState
                | MessageKind::RespGetValue
                | MessageKind::ReqSetValue,
                None,
            ) => return None,
            _ => 0,
        };
        Some(len)
    }
}

/// Wiring and travel times of one shader channel.
///
/// Every field reads `0xFF` bytes when the channel has never been set up.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ShaderSetup {
    pub power: u8,
    pub direction: u8,
    pub open_ds: u16,
    pub close_ds: u16,
}

impl ShaderSetup {
    /// Setup of a channel that has never been configured.
    pub const UNCONFIGURED: Self = Self {
        power: 0xFF,
        direction: 0xFF,
        open_ds: 0xFFFF,
        close_ds: 0xFFFF,
    };

    /// Returns `true` when relays and travel times have been assigned.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.power != 0xFF
            && self.direction != 0xFF
            && self.open_ds != 0xFFFF
            && self.close_ds != 0xFFFF
    }
}

impl Default for ShaderSetup {
    fn default() -> Self {
        Self::UNCONFIGURED
    }
}

/// Command carried by a PWM-panel set-state request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PwmCommand {
    Off,
    On,
    Toggle,
    Fade,
    DelayOff,
    /// Code sent by newer peers that this firmware does not implement.
    Unknown(u8),
}

impl PwmCommand {
    #[must_use]
    pub const fn to_raw(self) -> u8 {
        match self {
            PwmCommand::Off => 0,
            PwmCommand::On => 1,
            PwmCommand::Toggle => 2,
            PwmCommand::Fade => 3,
            PwmCommand::DelayOff => 4,
            PwmCommand::Unknown(code) => code,
        }
    }

    #[must_use]
    pub const fn from_raw(code: u8) -> Self {
        match code {
            0 => PwmCommand::Off,
            1 => PwmCommand::On,
            2 => PwmCommand::Toggle,
            3 => PwmCommand::Fade,
            4 => PwmCommand::DelayOff,
            other => PwmCommand::Unknown(other),
        }
    }
}

/// Output state reported by a get-state response.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceState {
    SwitchPanel {
        outputs: u8,
    },
    /// Shader positions read `+128` while a channel is manually overridden.
    ShaderPanel {
        digital: [u8; DIGITAL_STATE_BYTES],
        shader: [u8; SHADER_CHANNELS],
    },
    PwmPanel {
        enabled: u16,
        level: [u16; PWM_CHANNELS],
    },
}

impl DeviceState {
    #[must_use]
    pub const fn device_type(&self) -> DeviceType {
        match self {
            DeviceState::SwitchPanel { .. } => DeviceType::SwitchPanel,
            DeviceState::ShaderPanel { .. } => DeviceType::ShaderPanel,
            DeviceState::PwmPanel { .. } => DeviceType::PwmPanel,
        }
    }

    #[must_use]
    pub const fn encoded_len(device: DeviceType) -> usize {
        match device {
            DeviceType::SwitchPanel => 1,
            DeviceType::ShaderPanel => DIGITAL_STATE_BYTES + SHADER_CHANNELS,
            DeviceType::PwmPanel => 2 + 2 * PWM_CHANNELS,
        }
    }
}

/// Requested output changes carried by a set-state request.
///
/// Digital actions are packed four per byte, two bits each, lowest output in
/// the least significant bits: `0` unchanged, `1` off, `2` on, `3` toggle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SetState {
    SwitchPanel {
        actions: [u8; SWITCH_ACTION_BYTES],
    },
    /// Shader targets are `0..=100`, `0xFE` to stop, `0xFF` to leave alone.
    ShaderPanel {
        digital: [u8; DIGITAL_ACTION_BYTES],
        shader: [u8; SHADER_CHANNELS],
    },
    PwmPanel {
        mask: u16,
        command: PwmCommand,
        level: u16,
        duration_ds: u16,
    },
}

impl SetState {
    /// Shader byte requesting a stop.
    pub const SHADER_STOP: u8 = 0xFE;
    /// Shader byte leaving the channel untouched.
    pub const SHADER_UNCHANGED: u8 = 0xFF;

    #[must_use]
    pub const fn device_type(&self) -> DeviceType {
        match self {
            SetState::SwitchPanel { .. } => DeviceType::SwitchPanel,
            SetState::ShaderPanel { .. } => DeviceType::ShaderPanel,
            SetState::PwmPanel { .. } => DeviceType::PwmPanel,
        }
    }

    #[must_use]
    pub const fn encoded_len(device: DeviceType) -> usize {
        match device {
            DeviceType::SwitchPanel => SWITCH_ACTION_BYTES,
            DeviceType::ShaderPanel => DIGITAL_ACTION_BYTES + SHADER_CHANNELS,
            DeviceType::PwmPanel => 2 + 1 + 2 + 2,
        }
    }
}

/// Configuration values exchanged by get-value and set-value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeviceValue {
    SwitchPanel,
    ShaderPanel { setup: [ShaderSetup; SHADER_CHANNELS] },
    PwmPanel { level: [u16; PWM_CHANNELS] },
}

impl DeviceValue {
    #[must_use]
    pub const fn device_type(&self) -> DeviceType {
        match self {
            DeviceValue::SwitchPanel => DeviceType::SwitchPanel,
            DeviceValue::ShaderPanel { .. } => DeviceType::ShaderPanel,
            DeviceValue::PwmPanel { .. } => DeviceType::PwmPanel,
        }
    }

    #[must_use]
    pub const fn encoded_len(device: DeviceType) -> usize {
        match device {
            DeviceType::SwitchPanel => 0,
            DeviceType::ShaderPanel => 6 * SHADER_CHANNELS,
            DeviceType::PwmPanel => 2 * PWM_CHANNELS,
        }
    }
}

/// Kind-specific content of a telegram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Message {
    DevStartup { device_type: DeviceType },
    ReqReboot { receiver: u8 },
    ReqUpdEnter { receiver: u8 },
    RespUpdEnter { receiver: u8 },
    ReqUpdData { receiver: u8, address: u32, data: [u8; UPDATE_CHUNK] },
    RespUpdData { receiver: u8, address: u32 },
    ReqUpdTerm { receiver: u8 },
    RespUpdTerm { receiver: u8, success: bool },
    ReqInfo { receiver: u8 },
    RespInfo { receiver: u8, device_type: DeviceType, version: [u8; VERSION_LEN] },
    ReqGetState { receiver: u8 },
    RespGetState { receiver: u8, state: DeviceState },
    ReqSetState { receiver: u8, state: SetState },
    RespSetState { receiver: u8 },
    ReqGetValue { receiver: u8 },
    RespGetValue { receiver: u8, value: DeviceValue },
    ReqSetValue { receiver: u8, value: DeviceValue },
    RespSetValue { receiver: u8 },
    ReqSwitchState { receiver: u8, state: u8 },
    RespSwitchState { receiver: u8, state: u8 },
    ButtonPressed1,
    ButtonPressed2,
    ButtonPressed12,
    ReqSetAddress { receiver: u8, address: u8 },
    RespSetAddress { receiver: u8 },
    ReqGetAddress { receiver: u8 },
    RespGetAddress { receiver: u8, address: u8 },
    ReqSetClientAddress { receiver: u8, clients: [u8; CLIENT_SLOTS] },
    RespSetClientAddress { receiver: u8 },
    ReqGetClientAddress { receiver: u8 },
    RespGetClientAddress { receiver: u8, clients: [u8; CLIENT_SLOTS] },
    ReqEepromRead { receiver: u8, address: u16 },
    RespEepromRead { receiver: u8, address: u16, data: u8 },
    ReqEepromWrite { receiver: u8, address: u16, data: u8 },
    RespEepromWrite { receiver: u8 },
}

impl Message {
    /// Returns the kind byte for this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Message::DevStartup { .. } => MessageKind::DevStartup,
            Message::ReqReboot { .. } => MessageKind::ReqReboot,
            Message::ReqUpdEnter { .. } => MessageKind::ReqUpdEnter,
            Message::RespUpdEnter { .. } => MessageKind::RespUpdEnter,
            Message::ReqUpdData { .. } => MessageKind::ReqUpdData,
            Message::RespUpdData { .. } => MessageKind::RespUpdData,
            Message::ReqUpdTerm { .. } => MessageKind::ReqUpdTerm,
            Message::RespUpdTerm { .. } => MessageKind::RespUpdTerm,
            Message::ReqInfo { .. } => MessageKind::ReqInfo,
            Message::RespInfo { .. } => MessageKind::RespInfo,
            Message::ReqGetState { .. } => MessageKind::ReqGetState,
            Message::RespGetState { .. } => MessageKind::RespGetState,
            Message::ReqSetState { .. } => MessageKind::ReqSetState,
            Message::RespSetState { .. } => MessageKind::RespSetState,
            Message::ReqGetValue { .. } => MessageKind::ReqGetValue,
            Message::RespGetValue { .. } => MessageKind::RespGetValue,
            Message::ReqSetValue { .. } => MessageKind::ReqSetValue,
            Message::RespSetValue { .. } => MessageKind::RespSetValue,
            Message::ReqSwitchState { .. } => MessageKind::ReqSwitchState,
            Message::RespSwitchState { .. } => MessageKind::RespSwitchState,
            Message::ButtonPressed1 => MessageKind::ButtonPressed1,
            Message::ButtonPressed2 => MessageKind::ButtonPressed2,
            Message::ButtonPressed12 => MessageKind::ButtonPressed12,
            Message::ReqSetAddress { .. } => MessageKind::ReqSetAddress,
            Message::RespSetAddress { .. } => MessageKind::RespSetAddress,
            Message::ReqGetAddress { .. } => MessageKind::ReqGetAddress,
            Message::RespGetAddress { .. } => MessageKind::RespGetAddress,
            Message::ReqSetClientAddress { .. } => MessageKind::ReqSetClientAddress,
            Message::RespSetClientAddress { .. } => MessageKind::RespSetClientAddress,
            Message::ReqGetClientAddress { .. } => MessageKind::ReqGetClientAddress,
            Message::RespGetClientAddress { .. } => MessageKind::RespGetClientAddress,
            Message::ReqEepromRead { .. } => MessageKind::ReqEepromRead,
            Message::RespEepromRead { .. } => MessageKind::RespEepromRead,
            Message::ReqEepromWrite { .. } => MessageKind::ReqEepromWrite,
            Message::RespEepromWrite { .. } => MessageKind::RespEepromWrite,
        }
    }

    /// Returns the addressed node, or `None` for broadcast-only kinds.
    #[must_use]
    pub const fn receiver(&self) -> Option<u8> {
        match *self {
            Message::DevStartup { .. }
            | Message::ButtonPressed1
            | Message::ButtonPressed2
            | Message::ButtonPressed12 => None,
            Message::ReqReboot { receiver }
            | Message::ReqUpdEnter { receiver }
            | Message::RespUpdEnter { receiver }
            | Message::ReqUpdData { receiver, .. }
            | Message::RespUpdData { receiver, .. }
            | Message::ReqUpdTerm { receiver }
            | Message::RespUpdTerm { receiver, .. }
            | Message::ReqInfo { receiver }
            | Message::RespInfo { receiver, .. }
            | Message::ReqGetState { receiver }
            | Message::RespGetState { receiver, .. }
            | Message::ReqSetState { receiver, .. }
            | Message::RespSetState { receiver }
            | Message::ReqGetValue { receiver }
            | Message::RespGetValue { receiver, .. }
            | Message::ReqSetValue { receiver, .. }
            | Message::RespSetValue { receiver }
            | Message::ReqSwitchState { receiver, .. }
            | Message::RespSwitchState { receiver, .. }
            | Message::ReqSetAddress { receiver, .. }
            | Message::RespSetAddress { receiver }
            | Message::ReqGetAddress { receiver }
            | Message::RespGetAddress { receiver, .. }
            | Message::ReqSetClientAddress { receiver, .. }
            | Message::RespSetClientAddress { receiver }
            | Message::ReqGetClientAddress { receiver }
            | Message::RespGetClientAddress { receiver, .. }
            | Message::ReqEepromRead { receiver, .. }
            | Message::RespEepromRead { receiver, .. }
            | Message::ReqEepromWrite { receiver, .. }
            | Message::RespEepromWrite { receiver } => Some(receiver),
        }
    }

    /// Returns the device type discriminator carried on the wire, if any.
    #[must_use]
    pub const fn device_type(&self) -> Option<DeviceType> {
        match self {
            Message::DevStartup { device_type } | Message::RespInfo { device_type, .. } => {
                Some(*device_type)
            }
            Message::RespGetState { state, .. } => Some(state.device_type()),
            Message::ReqSetState { state, .. } => Some(state.device_type()),
            Message::RespGetValue { value, .. } | Message::ReqSetValue { value, .. } => {
                Some(value.device_type())
            }
            _ => None,
        }
    }
}

/// One complete addressed message on the bus.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Telegram {
    pub sender: u8,
    pub message: Message,
}

impl Telegram {
    #[must_use]
    pub const fn new(sender: u8, message: Message) -> Self {
        Self { sender, message }
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_round_trip() {
        for (index, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(usize::from(kind.to_raw()), index);
            assert_eq!(MessageKind::from_raw(kind.to_raw()), Some(*kind));
        }
        assert_eq!(MessageKind::from_raw(0x23), None);
    }

    #[test]
    fn typed_payload_sizes_depend_on_device() {
        assert_eq!(
            MessageKind::ReqSetValue.payload_len(Some(DeviceType::ShaderPanel)),
            Some(90)
        );
        assert_eq!(MessageKind::ReqSetValue.payload_len(None), None);
        assert_eq!(MessageKind::ReqReboot.payload_len(None), Some(0));
    }

    #[test]
    fn unconfigured_setup_is_detected() {
        assert!(!ShaderSetup::UNCONFIGURED.is_configured());
        let setup = ShaderSetup {
            power: 0,
            direction: 1,
            open_ds: 300,
            close_ds: 250,
        };
        assert!(setup.is_configured());
    }
}
