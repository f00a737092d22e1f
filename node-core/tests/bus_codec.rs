use node_core::codec::telegram::{CLIENT_SLOTS, PWM_CHANNELS, SHADER_CHANNELS, UPDATE_CHUNK};
use node_core::codec::{
    DecodeError, DecodeStatus, Decoder, DeviceState, DeviceType, DeviceValue, ESC, Message,
    MessageKind, PwmCommand, STX, SetState, ShaderSetup, Telegram, encode,
};

/// Feeds `bytes` and collects every non-pending result.
fn decode_all(decoder: &mut Decoder, bytes: &[u8]) -> Vec<DecodeStatus> {
    bytes
        .iter()
        .map(|byte| decoder.push(*byte))
        .filter(|status| *status != DecodeStatus::Pending)
        .collect()
}

fn setup(seed: u8) -> ShaderSetup {
    ShaderSetup {
        power: seed,
        direction: seed.wrapping_add(1),
        open_ds: u16::from(seed) * 10 + 2,
        close_ds: 0x1B02,
    }
}

/// One telegram per kind and device type, with reserved bytes in the payloads.
fn samples() -> Vec<Telegram> {
    let receiver = 0x10;
    let mut messages = vec![
        Message::ReqReboot { receiver },
        Message::ReqUpdEnter { receiver },
        Message::RespUpdEnter { receiver },
        Message::ReqUpdData {
            receiver,
            address: 0x0002_1B00,
            data: core::array::from_fn(|index| u8::try_from(index).unwrap() ^ STX),
        },
        Message::RespUpdData {
            receiver,
            address: 0x1B1B_0202,
        },
        Message::ReqUpdTerm { receiver },
        Message::RespUpdTerm {
            receiver,
            success: true,
        },
        Message::ReqInfo { receiver },
        Message::ReqGetState { receiver },
        Message::RespSetState { receiver },
        Message::ReqGetValue { receiver },
        Message::RespSetValue { receiver },
        Message::ReqSwitchState {
            receiver,
            state: 0b10,
        },
        Message::RespSwitchState {
            receiver: ESC,
            state: 0b01,
        },
        Message::ButtonPressed1,
        Message::ButtonPressed2,
        Message::ButtonPressed12,
        Message::ReqSetAddress {
            receiver,
            address: STX,
        },
        Message::RespSetAddress { receiver },
        Message::ReqGetAddress { receiver },
        Message::RespGetAddress {
            receiver,
            address: 0x22,
        },
        Message::ReqSetClientAddress {
            receiver,
            clients: [STX; CLIENT_SLOTS],
        },
        Message::RespSetClientAddress { receiver },
        Message::ReqGetClientAddress { receiver },
        Message::RespGetClientAddress {
            receiver,
            clients: core::array::from_fn(|index| u8::try_from(index).unwrap() + 0x1A),
        },
        Message::ReqEepromRead {
            receiver,
            address: 0x0102,
        },
        Message::RespEepromRead {
            receiver,
            address: 0x0040,
            data: ESC,
        },
        Message::ReqEepromWrite {
            receiver,
            address: 0x001B,
            data: 0xFF,
        },
        Message::RespEepromWrite { receiver },
    ];

    for device_type in [
        DeviceType::SwitchPanel,
        DeviceType::ShaderPanel,
        DeviceType::PwmPanel,
    ] {
        messages.push(Message::DevStartup { device_type });
        messages.push(Message::RespInfo {
            receiver,
            device_type,
            version: *b"node\x02\x1b version 1",
        });
    }

    messages.extend([
        Message::RespGetState {
            receiver,
            state: DeviceState::SwitchPanel { outputs: STX },
        },
        Message::RespGetState {
            receiver,
            state: DeviceState::ShaderPanel {
                digital: [0x01, STX, ESC, 0x80],
                shader: core::array::from_fn(|index| u8::try_from(index * 7).unwrap()),
            },
        },
        Message::RespGetState {
            receiver,
            state: DeviceState::PwmPanel {
                enabled: 0x1B02,
                level: core::array::from_fn(|index| u16::try_from(index * 257).unwrap()),
            },
        },
        Message::ReqSetState {
            receiver,
            state: SetState::SwitchPanel {
                actions: [0b1001_0010, ESC],
            },
        },
        Message::ReqSetState {
            receiver,
            state: SetState::ShaderPanel {
                digital: [STX; 8],
                shader: [
                    0,
                    100,
                    50,
                    SetState::SHADER_STOP,
                    SetState::SHADER_UNCHANGED,
                    2,
                    27,
                    1,
                    99,
                    3,
                    4,
                    5,
                    6,
                    7,
                    8,
                ],
            },
        },
        Message::ReqSetState {
            receiver,
            state: SetState::PwmPanel {
                mask: 0x0003,
                command: PwmCommand::Fade,
                level: 0x021B,
                duration_ds: 20,
            },
        },
        Message::RespGetValue {
            receiver,
            value: DeviceValue::SwitchPanel,
        },
        Message::RespGetValue {
            receiver,
            value: DeviceValue::ShaderPanel {
                setup: core::array::from_fn(|index| setup(u8::try_from(index).unwrap())),
            },
        },
        Message::ReqSetValue {
            receiver,
            value: DeviceValue::PwmPanel {
                level: [0x1B02; PWM_CHANNELS],
            },
        },
        Message::ReqSetValue {
            receiver,
            value: DeviceValue::ShaderPanel {
                setup: [ShaderSetup::UNCONFIGURED; SHADER_CHANNELS],
            },
        },
    ]);

    messages
        .into_iter()
        .map(|message| Telegram::new(0x05, message))
        .collect()
}

#[test]
fn every_kind_survives_the_wire() {
    let telegrams = samples();
    for kind in MessageKind::ALL {
        assert!(
            telegrams.iter().any(|telegram| telegram.kind() == *kind),
            "no sample for {kind:?}"
        );
    }

    let mut decoder = Decoder::new();
    for telegram in &telegrams {
        let frame = encode(telegram).unwrap();
        assert!(!frame[1..].contains(&STX), "unescaped marker in {telegram:?}");
        assert_eq!(
            decode_all(&mut decoder, &frame),
            vec![DecodeStatus::Ok(*telegram)],
            "round trip of {:?}",
            telegram.kind()
        );
    }
}

#[test]
fn back_to_back_frames_decode_independently() {
    let telegrams = samples();
    let stream: Vec<u8> = telegrams
        .iter()
        .flat_map(|telegram| encode(telegram).unwrap())
        .collect();

    let mut decoder = Decoder::new();
    let decoded = decode_all(&mut decoder, &stream);
    let expected: Vec<DecodeStatus> = telegrams.into_iter().map(DecodeStatus::Ok).collect();
    assert_eq!(decoded, expected);
}

#[test]
fn bad_checksum_then_valid_frame() {
    let good = Telegram::new(0x05, Message::ReqGetState { receiver: 0x10 });
    let mut corrupted = encode(&good).unwrap();
    let last = corrupted.len() - 1;
    corrupted[last] = corrupted[last].wrapping_add(1);

    let mut stream = corrupted.to_vec();
    stream.extend_from_slice(&encode(&good).unwrap());

    let mut decoder = Decoder::new();
    let results = decode_all(&mut decoder, &stream);
    assert_eq!(results.len(), 2);
    assert!(matches!(
        results[0],
        DecodeStatus::Error(DecodeError::Checksum { .. })
    ));
    assert_eq!(results[1], DecodeStatus::Ok(good));
}

/// Maps a raw frame index to its position in the unstuffed stream.
fn logical_index(frame: &[u8], raw: usize) -> usize {
    let mut logical = 0;
    let mut index = 1;
    loop {
        let width = if frame[index] == ESC { 2 } else { 1 };
        if raw < index + width {
            return logical;
        }
        index += width;
        logical += 1;
    }
}

#[test]
fn any_corrupted_byte_fails_the_checksum() {
    for telegram in samples() {
        let frame = encode(&telegram).unwrap();
        let kind = telegram.kind();
        let device_type_at = kind
            .has_device_type()
            .then_some(if kind.has_receiver() { 3 } else { 2 });

        for raw in 1..frame.len() {
            let logical = logical_index(&frame, raw);
            let flipped = frame[raw] ^ 0x40;
            let escaped = frame[raw - 1] == ESC;
            // Sender and kind select the layout; the device type sizes it.
            if logical < 2
                || Some(logical) == device_type_at
                || frame[raw] == ESC
                || (!escaped && (flipped == STX || flipped == ESC))
            {
                continue;
            }

            let mut corrupted = frame.clone();
            corrupted[raw] = flipped;
            let mut decoder = Decoder::new();
            let results = decode_all(&mut decoder, &corrupted);
            assert!(
                matches!(
                    results.as_slice(),
                    [DecodeStatus::Error(DecodeError::Checksum { .. })]
                ),
                "{kind:?} byte {raw} flipped gave {results:?}"
            );
        }
    }
}
