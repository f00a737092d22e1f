use node_core::clock::{Clock, ManualClock};
use node_core::shader::{
    Direction, RelayBank, RelayPair, ShaderController, ShaderEvent, ShaderState, ShaderTiming,
};

const POWER: u8 = 0;
const DIRECTION: u8 = 1;
const TICK_MS: u32 = 10;

/// Relay bank that checks the interlock on every switch.
#[derive(Default)]
struct InterlockedRelays {
    power: bool,
    direction: bool,
    power_on_edges: usize,
    power_off_edges: usize,
    switches_this_tick: usize,
}

impl RelayBank for InterlockedRelays {
    fn switch_relay(&mut self, channel: u8, on: bool) {
        self.switches_this_tick += 1;
        assert!(
            self.switches_this_tick <= 1,
            "two relays switched in one poll tick"
        );
        match channel {
            POWER => {
                if on && !self.power {
                    self.power_on_edges += 1;
                }
                if !on && self.power {
                    self.power_off_edges += 1;
                }
                self.power = on;
            }
            DIRECTION => {
                if on != self.direction {
                    assert!(!self.power, "direction flipped with the motor energised");
                }
                self.direction = on;
            }
            other => panic!("unexpected relay {other}"),
        }
    }
}

fn controller(open_ms: u32, close_ms: u32) -> ShaderController<1> {
    let mut shaders = ShaderController::new(ShaderTiming::default());
    shaders
        .configure(
            0,
            RelayPair {
                power: POWER,
                direction: DIRECTION,
            },
            open_ms,
            close_ms,
        )
        .unwrap();
    shaders
}

/// Polls the channel every tick until `until_ms`, collecting states and events.
fn run(
    shaders: &mut ShaderController<1>,
    relays: &mut InterlockedRelays,
    clock: &ManualClock,
    until_ms: u32,
    states: &mut Vec<ShaderState>,
    events: &mut Vec<ShaderEvent>,
) {
    while clock.now_ms() < until_ms {
        relays.switches_this_tick = 0;
        if let Some(event) = shaders.check_channel(0, clock, relays) {
            events.push(event);
        }
        let state = shaders.state(0).unwrap();
        if states.last() != Some(&state) {
            states.push(state);
        }
        let position = shaders.shader(0).unwrap().actual_position;
        assert!(position <= 100, "position {position} out of range");
        clock.advance(TICK_MS);
    }
}

#[test]
fn closing_from_open_stops_near_target() {
    let clock = ManualClock::new(0);
    let mut relays = InterlockedRelays::default();
    let mut shaders = controller(30_000, 25_000);
    shaders.restore_position(0, 99);

    shaders.set_position(0, 50).unwrap();
    let mut states = Vec::new();
    let mut events = Vec::new();
    run(&mut shaders, &mut relays, &clock, 15_000, &mut states, &mut events);

    assert_eq!(
        states,
        vec![
            ShaderState::CloseInit,
            ShaderState::Closing,
            ShaderState::Exit,
            ShaderState::Stopped,
        ]
    );
    let position = shaders.shader(0).unwrap().actual_position;
    assert!((48..=52).contains(&position), "stopped at {position}");
    assert!(matches!(
        events.last(),
        Some(ShaderEvent::Stopped { channel: 0, .. })
    ));
    assert!(!relays.power);
    assert_eq!(relays.power_on_edges, 1);
    assert_eq!(shaders.last_direction(0), Some(Direction::Close));
}

#[test]
fn same_direction_retarget_keeps_motor_running() {
    let clock = ManualClock::new(0);
    let mut relays = InterlockedRelays::default();
    let mut shaders = controller(30_000, 25_000);
    shaders.restore_position(0, 10);

    shaders.set_position(0, 90).unwrap();
    let mut states = Vec::new();
    let mut events = Vec::new();
    run(&mut shaders, &mut relays, &clock, 5_000, &mut states, &mut events);
    assert_eq!(shaders.state(0), Some(ShaderState::Opening));
    assert!(relays.power);

    shaders.set_position(0, 80).unwrap();
    run(&mut shaders, &mut relays, &clock, 30_000, &mut states, &mut events);

    assert!(!states.contains(&ShaderState::DirChangeOpenInit));
    assert!(!states.contains(&ShaderState::DirChangeCloseInit));
    assert_eq!(relays.power_on_edges, 1);
    assert_eq!(relays.power_off_edges, 1);
    let position = shaders.shader(0).unwrap().actual_position;
    assert!((78..=82).contains(&position), "stopped at {position}");
}

#[test]
fn reversal_pauses_before_flipping_direction() {
    let clock = ManualClock::new(0);
    let mut relays = InterlockedRelays::default();
    let mut shaders = controller(10_000, 10_000);
    shaders.restore_position(0, 50);

    shaders.set_position(0, 90).unwrap();
    let mut states = Vec::new();
    let mut events = Vec::new();
    run(&mut shaders, &mut relays, &clock, 2_000, &mut states, &mut events);
    assert_eq!(shaders.state(0), Some(ShaderState::Opening));

    shaders.set_position(0, 20).unwrap();
    run(&mut shaders, &mut relays, &clock, 20_000, &mut states, &mut events);

    let reversal = states
        .iter()
        .position(|state| *state == ShaderState::DirChangeCloseInit)
        .expect("reversal state entered");
    assert_eq!(states[reversal + 1], ShaderState::CloseInit);
    assert!(events
        .iter()
        .any(|event| matches!(event, ShaderEvent::Reversing { channel: 0 })));
    assert_eq!(shaders.state(0), Some(ShaderState::Stopped));
    let position = shaders.shader(0).unwrap().actual_position;
    assert!((18..=22).contains(&position), "stopped at {position}");
}

#[test]
fn end_stop_runs_past_nominal_travel() {
    let clock = ManualClock::new(0);
    let mut relays = InterlockedRelays::default();
    let mut shaders = controller(10_000, 10_000);
    shaders.restore_position(0, 0);

    shaders.set_position(0, 100).unwrap();
    let mut states = Vec::new();
    let mut events = Vec::new();
    run(&mut shaders, &mut relays, &clock, 10_500, &mut states, &mut events);
    assert_eq!(shaders.state(0), Some(ShaderState::Opening));
    assert_eq!(shaders.position(0), Some(100));

    run(&mut shaders, &mut relays, &clock, 12_000, &mut states, &mut events);
    assert_eq!(shaders.state(0), Some(ShaderState::Stopped));
}

#[test]
fn repeating_the_same_target_is_idempotent() {
    let clock = ManualClock::new(0);
    let mut relays = InterlockedRelays::default();
    let mut shaders = controller(10_000, 10_000);
    shaders.restore_position(0, 30);

    shaders.set_position(0, 60).unwrap();
    let mut states = Vec::new();
    let mut events = Vec::new();
    run(&mut shaders, &mut relays, &clock, 1_000, &mut states, &mut events);
    shaders.set_position(0, 60).unwrap();
    shaders.set_position(0, 60).unwrap();
    run(&mut shaders, &mut relays, &clock, 15_000, &mut states, &mut events);

    assert_eq!(relays.power_on_edges, 1);
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, ShaderEvent::Started { .. }))
            .count(),
        1
    );
    assert_eq!(shaders.state(0), Some(ShaderState::Stopped));
}
