use node_core::clock::ManualClock;
use node_core::codec::{
    DeviceState, DeviceType, DeviceValue, Message, PwmCommand, SetState, ShaderSetup, Telegram,
    encode,
};
use node_core::config::NodeConfig;
use node_core::confirm::{ClientTable, ConfirmState};
use node_core::digital::OutputDriver;
use node_core::node::{Button, DispatchError, Node, NodeAction};
use node_core::persist::{RamStorage, Storage};
use node_core::pwm::{NoopPwmDriver, PwmDriver};
use node_core::shader::ShaderError;
use node_core::telemetry::TelemetryEventKind;

const NODE: u8 = 0x10;
const HEAD_END: u8 = 0x01;

/// Output driver that remembers the last level of every pin.
#[derive(Clone, Debug, Default)]
struct Pins {
    high: u32,
}

impl OutputDriver for Pins {
    fn set(&mut self, channel: usize, on: bool) {
        if on {
            self.high |= 1 << channel;
        } else {
            self.high &= !(1 << channel);
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Duties {
    duty: [u16; 16],
}

impl PwmDriver for Duties {
    fn write_duty(&mut self, channel: usize, duty: u16) {
        self.duty[channel] = duty;
    }
}

type TestNode<'a, P = NoopPwmDriver> = Node<&'a ManualClock, Pins, P, RamStorage>;

fn node(clock: &ManualClock, device_type: DeviceType) -> TestNode<'_> {
    Node::new(
        clock,
        NodeConfig::new(NODE, device_type),
        Pins::default(),
        NoopPwmDriver,
        RamStorage::new(),
    )
}

/// Sends `message` from `sender` over the wire and returns the last action.
fn deliver<P: PwmDriver>(
    node: &mut TestNode<'_, P>,
    sender: u8,
    message: Message,
) -> Option<NodeAction> {
    let frame = encode(&Telegram::new(sender, message)).unwrap();
    frame.iter().filter_map(|byte| node.bus_poll(*byte)).last()
}

/// Pops everything queued for the transmitter, reporting each as sent.
fn drain<P: PwmDriver>(node: &mut TestNode<'_, P>) -> Vec<Telegram> {
    let mut sent = Vec::new();
    while let Some(telegram) = node.pop_transmit() {
        node.transmitted(&telegram);
        sent.push(telegram);
    }
    sent
}

fn last_rejection<P: PwmDriver>(node: &TestNode<'_, P>) -> Option<DispatchError> {
    node.telemetry()
        .oldest_first()
        .filter_map(|record| match record.event {
            TelemetryEventKind::Rejected { error, .. } => Some(error),
            _ => None,
        })
        .last()
}

#[test]
fn get_state_reports_pwm_channels() {
    let clock = ManualClock::new(0);
    let mut node = node(&clock, DeviceType::PwmPanel);
    node.pwm_mut().set_level(3, 120).unwrap();
    node.pwm_mut().on(3).unwrap();

    deliver(&mut node, HEAD_END, Message::ReqGetState { receiver: NODE });
    let sent = drain(&mut node);
    assert_eq!(sent.len(), 1);
    let Message::RespGetState {
        receiver,
        state: DeviceState::PwmPanel { enabled, level },
    } = sent[0].message
    else {
        panic!("unexpected response {:?}", sent[0]);
    };
    assert_eq!(sent[0].sender, NODE);
    assert_eq!(receiver, HEAD_END);
    assert_eq!(enabled, 1 << 3);
    assert_eq!(level[3], 120);
}

#[test]
fn telegrams_for_other_nodes_and_own_echo_are_ignored() {
    let clock = ManualClock::new(0);
    let mut node = node(&clock, DeviceType::SwitchPanel);

    deliver(&mut node, HEAD_END, Message::ReqGetState { receiver: 0x11 });
    deliver(&mut node, NODE, Message::ReqGetState { receiver: NODE });
    assert!(drain(&mut node).is_empty());
    assert_eq!(last_rejection(&node), None);
}

#[test]
fn broadcasts_surface_as_actions() {
    let clock = ManualClock::new(0);
    let mut node = node(&clock, DeviceType::SwitchPanel);

    assert_eq!(
        deliver(&mut node, 0x30, Message::ButtonPressed2),
        Some(NodeAction::Button {
            sender: 0x30,
            button: Button::Second
        })
    );
    assert_eq!(
        deliver(
            &mut node,
            0x31,
            Message::DevStartup {
                device_type: DeviceType::ShaderPanel
            }
        ),
        Some(NodeAction::PeerStartup {
            sender: 0x31,
            device_type: DeviceType::ShaderPanel
        })
    );
    assert!(drain(&mut node).is_empty());
}

#[test]
fn wrong_device_payload_is_rejected_silently() {
    let clock = ManualClock::new(0);
    let mut node = node(&clock, DeviceType::SwitchPanel);

    deliver(
        &mut node,
        HEAD_END,
        Message::ReqSetState {
            receiver: NODE,
            state: SetState::PwmPanel {
                mask: 0xFFFF,
                command: PwmCommand::On,
                level: 10,
                duration_ds: 0,
            },
        },
    );
    assert!(drain(&mut node).is_empty());
    assert_eq!(
        last_rejection(&node),
        Some(DispatchError::WrongDevice(DeviceType::PwmPanel))
    );
    assert_eq!(node.pwm().enabled_mask(), 0);
}

#[test]
fn invalid_shader_target_leaves_every_channel_untouched() {
    let clock = ManualClock::new(0);
    let mut node = node(&clock, DeviceType::ShaderPanel);
    let setup = ShaderSetup {
        power: 8,
        direction: 9,
        open_ds: 200,
        close_ds: 200,
    };
    node.configure_shader(0, setup).unwrap();

    let mut shader = [SetState::SHADER_UNCHANGED; 15];
    shader[0] = 40;
    shader[1] = 40;
    // Digital output 2 on: action 2 in bits 4..6 of the first byte.
    let mut digital = [0u8; 8];
    digital[0] = 0b10 << 4;
    deliver(
        &mut node,
        HEAD_END,
        Message::ReqSetState {
            receiver: NODE,
            state: SetState::ShaderPanel { digital, shader },
        },
    );

    assert!(drain(&mut node).is_empty());
    assert_eq!(
        last_rejection(&node),
        Some(DispatchError::Shader(ShaderError::Unconfigured(1)))
    );
    assert_eq!(node.outputs().is_on(2), Some(false));
    assert_eq!(node.shaders().shader(0).unwrap().set_position, 0);
}

#[test]
fn set_value_configures_shaders_and_persists() {
    let clock = ManualClock::new(0);
    let mut node = node(&clock, DeviceType::ShaderPanel);
    let mut setup = [ShaderSetup::UNCONFIGURED; 15];
    setup[2] = ShaderSetup {
        power: 4,
        direction: 5,
        open_ds: 300,
        close_ds: 250,
    };

    deliver(
        &mut node,
        HEAD_END,
        Message::ReqSetValue {
            receiver: NODE,
            value: DeviceValue::ShaderPanel { setup },
        },
    );
    let sent = drain(&mut node);
    assert_eq!(
        sent[0].message,
        Message::RespSetValue { receiver: HEAD_END }
    );
    assert!(node.outputs().is_reserved(4));
    assert_eq!(node.shaders().shader(2).unwrap().close_ms, 25_000);

    let reloaded = NodeConfig::load(node.storage(), DeviceType::SwitchPanel);
    assert_eq!(reloaded.shader_setup[2], setup[2]);

    // A second channel may not claim a relay that is already in use.
    setup[3] = ShaderSetup {
        power: 5,
        direction: 6,
        open_ds: 300,
        close_ds: 250,
    };
    deliver(
        &mut node,
        HEAD_END,
        Message::ReqSetValue {
            receiver: NODE,
            value: DeviceValue::ShaderPanel { setup },
        },
    );
    assert!(drain(&mut node).is_empty());
    assert_eq!(
        last_rejection(&node),
        Some(DispatchError::Shader(ShaderError::RelayConflict))
    );
    assert!(!node.outputs().is_reserved(6));
}

#[test]
fn shared_relays_within_one_request_change_nothing() {
    let clock = ManualClock::new(0);
    let mut node = node(&clock, DeviceType::ShaderPanel);
    let mut setup = [ShaderSetup::UNCONFIGURED; 15];
    let shared = ShaderSetup {
        power: 4,
        direction: 5,
        open_ds: 300,
        close_ds: 250,
    };
    setup[0] = shared;
    setup[1] = shared;

    deliver(
        &mut node,
        HEAD_END,
        Message::ReqSetValue {
            receiver: NODE,
            value: DeviceValue::ShaderPanel { setup },
        },
    );

    assert!(drain(&mut node).is_empty());
    assert_eq!(
        last_rejection(&node),
        Some(DispatchError::Shader(ShaderError::RelayConflict))
    );
    assert_eq!(node.shaders().shader(0).unwrap().relays, None);
    assert!(!node.outputs().is_reserved(4));
    assert!(!node.outputs().is_reserved(5));
    let stored = NodeConfig::load(node.storage(), DeviceType::ShaderPanel);
    assert_eq!(stored.shader_setup[0], ShaderSetup::UNCONFIGURED);
}

#[test]
fn set_address_answers_from_the_new_address() {
    let clock = ManualClock::new(0);
    let mut node = node(&clock, DeviceType::SwitchPanel);

    deliver(
        &mut node,
        HEAD_END,
        Message::ReqSetAddress {
            receiver: NODE,
            address: 0x42,
        },
    );
    let sent = drain(&mut node);
    assert_eq!(sent[0].sender, 0x42);
    assert_eq!(node.config().address, 0x42);
    assert_eq!(node.storage().read(0x000), 0x42);

    deliver(
        &mut node,
        HEAD_END,
        Message::ReqSetAddress {
            receiver: 0x42,
            address: 0xFF,
        },
    );
    assert!(drain(&mut node).is_empty());
    assert_eq!(
        last_rejection(&node),
        Some(DispatchError::InvalidAddress(0xFF))
    );
}

#[test]
fn eeprom_requests_reach_storage() {
    let clock = ManualClock::new(0);
    let mut node = node(&clock, DeviceType::SwitchPanel);

    deliver(
        &mut node,
        HEAD_END,
        Message::ReqEepromWrite {
            receiver: NODE,
            address: 0x3F0,
            data: 0x5A,
        },
    );
    deliver(
        &mut node,
        HEAD_END,
        Message::ReqEepromRead {
            receiver: NODE,
            address: 0x3F0,
        },
    );
    let sent = drain(&mut node);
    assert_eq!(
        sent[1].message,
        Message::RespEepromRead {
            receiver: HEAD_END,
            address: 0x3F0,
            data: 0x5A
        }
    );
}

#[test]
fn reboot_saves_state_and_boot_restores_it() {
    let clock = ManualClock::new(0);
    let mut config = NodeConfig::new(NODE, DeviceType::PwmPanel);
    config.clients.addresses[0] = 0x20;
    let mut storage: RamStorage = RamStorage::new();
    config.store(&mut storage);

    let mut node: TestNode<'_, Duties> =
        Node::new(&clock, config, Pins::default(), Duties::default(), storage);
    node.pwm_mut().set_level(1, 200).unwrap();
    node.pwm_mut().on(1).unwrap();
    node.outputs_mut().set(0, true).unwrap();

    assert_eq!(
        deliver(&mut node, HEAD_END, Message::ReqReboot { receiver: NODE }),
        Some(NodeAction::Reboot)
    );

    let storage = node.storage().clone();
    let mut rebooted: TestNode<'_, Duties> = Node::boot(
        &clock,
        DeviceType::PwmPanel,
        Pins::default(),
        Duties::default(),
        storage,
    );
    assert_eq!(rebooted.config().address, NODE);
    assert_eq!(rebooted.config().clients.addresses[0], 0x20);
    assert_eq!(rebooted.pwm().level(1), Some(200));
    assert_eq!(rebooted.pwm().is_enabled(1), Some(true));
    assert_ne!(rebooted.pwm().driver().duty[1], 0);
    assert_eq!(rebooted.outputs().driver().high & 1, 1);

    let sent = drain(&mut rebooted);
    assert_eq!(
        sent[0].message,
        Message::DevStartup {
            device_type: DeviceType::PwmPanel
        }
    );
}

#[test]
fn newest_power_fail_snapshot_wins() {
    let clock = ManualClock::new(0);
    let mut node = node(&clock, DeviceType::ShaderPanel);
    node.shaders_mut().restore_position(0, 70);
    node.power_fail();
    node.shaders_mut().restore_position(0, 128 + 30);
    node.outputs_mut().set(3, true).unwrap();
    node.power_fail();

    let rebooted: TestNode<'_> = Node::boot(
        &clock,
        DeviceType::ShaderPanel,
        Pins::default(),
        NoopPwmDriver,
        node.storage().clone(),
    );
    assert_eq!(rebooted.shaders().position(0), Some(128 + 30));
    assert_eq!(rebooted.outputs().is_on(3), Some(true));
    assert!(
        rebooted
            .telemetry()
            .oldest_first()
            .any(|record| record.event == TelemetryEventKind::StateRestored)
    );
}

#[test]
fn unresponsive_client_is_given_up() {
    let clock = ManualClock::new(0);
    let mut config = NodeConfig::new(NODE, DeviceType::SwitchPanel);
    let mut clients = ClientTable::EMPTY;
    clients.addresses[..3].copy_from_slice(&[0x20, 0x21, 0x22]);
    config.clients = clients;
    let mut node: TestNode<'_> = Node::new(
        &clock,
        config,
        Pins::default(),
        NoopPwmDriver,
        RamStorage::new(),
    );

    node.check();
    node.outputs_mut().set(0, true).unwrap();

    let mut requests = Vec::new();
    for _ in 0..400 {
        clock.advance(5);
        node.check();
        for telegram in drain(&mut node) {
            let Message::ReqSwitchState { receiver, state } = telegram.message else {
                continue;
            };
            requests.push(receiver);
            if receiver != 0x22 {
                deliver(
                    &mut node,
                    receiver,
                    Message::RespSwitchState {
                        receiver: NODE,
                        state,
                    },
                );
            }
        }
    }

    assert_eq!(requests.iter().filter(|address| **address == 0x20).count(), 1);
    assert_eq!(requests.iter().filter(|address| **address == 0x21).count(), 1);
    assert_eq!(requests.iter().filter(|address| **address == 0x22).count(), 3);

    let confirm = node.confirm();
    assert_eq!(confirm.client(0x20).unwrap().state, ConfirmState::Confirmed);
    assert_eq!(confirm.client(0x21).unwrap().state, ConfirmState::Confirmed);
    assert_eq!(confirm.client(0x22).unwrap().state, ConfirmState::GaveUp);
    assert!(confirm.is_idle());

    // Quiet until the next change.
    for _ in 0..100 {
        clock.advance(10);
        node.check();
    }
    assert!(drain(&mut node).is_empty());

    node.outputs_mut().set(1, true).unwrap();
    for _ in 0..30 {
        clock.advance(10);
        node.check();
    }
    assert!(
        drain(&mut node)
            .iter()
            .any(|telegram| telegram.message
                == Message::ReqSwitchState {
                    receiver: 0x20,
                    state: 0b11
                })
    );
}
