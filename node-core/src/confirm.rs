//! Confirmed multicast of switch-state changes.
//!
//! When the sampled switch state changes, every configured client is sent a
//! switch-state request in turn. After each transmission the scheduler waits
//! out a short collision window, then for an acknowledgement. A client that
//! never answers is retried up to its configured limit and then given up.
//! Once every client is confirmed or given up, nothing more is sent until
//! the next change.

use heapless::Vec;

use crate::clock::{Clock, Millis, elapsed};
use crate::codec::telegram::CLIENT_SLOTS;
use crate::codec::{Message, Telegram};

/// Client address slot that holds no peer.
pub const EMPTY_CLIENT: u8 = 0xFF;
/// Retry limit used when none has been stored.
pub const DEFAULT_MAX_RETRY: u8 = 3;

/// Peers that must confirm state changes, with their retry limits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClientTable {
    pub addresses: [u8; CLIENT_SLOTS],
    pub retries: [u8; CLIENT_SLOTS],
}

impl ClientTable {
    /// Table without any peers.
    pub const EMPTY: Self = Self {
        addresses: [EMPTY_CLIENT; CLIENT_SLOTS],
        retries: [DEFAULT_MAX_RETRY; CLIENT_SLOTS],
    };

    /// Iterates over `(address, max_retry)` of the occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        self.addresses
            .iter()
            .zip(self.retries.iter())
            .filter(|(address, _)| **address != EMPTY_CLIENT)
            .map(|(address, retries)| (*address, *retries))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Timing of the confirmation walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ConfirmConfig {
    /// How often the switch state is sampled for changes.
    pub sample_interval_ms: Millis,
    /// Quiet time after a transmission before answers are awaited.
    pub collision_window_ms: Millis,
    /// How long to wait for an acknowledgement.
    pub response_timeout_ms: Millis,
    /// Upper bound on one complete walk over all clients.
    pub walk_limit_ms: Millis,
}

impl ConfirmConfig {
    pub const DEFAULT_SAMPLE_INTERVAL_MS: Millis = 100;
    pub const DEFAULT_RESPONSE_TIMEOUT_MS: Millis = 100;
    pub const DEFAULT_WALK_LIMIT_MS: Millis = 30_000;
    const COLLISION_BASE_MS: Millis = 10;
    const COLLISION_SLOT_MS: Millis = 2;

    /// Collision window staggered by node address so peers do not collide.
    #[must_use]
    pub const fn collision_window_for(address: u8) -> Millis {
        Self::COLLISION_BASE_MS + Self::COLLISION_SLOT_MS * (address % 16) as Millis
    }

    /// Default timing for the node at `address`.
    #[must_use]
    pub const fn for_address(address: u8) -> Self {
        Self {
            sample_interval_ms: Self::DEFAULT_SAMPLE_INTERVAL_MS,
            collision_window_ms: Self::collision_window_for(address),
            response_timeout_ms: Self::DEFAULT_RESPONSE_TIMEOUT_MS,
            walk_limit_ms: Self::DEFAULT_WALK_LIMIT_MS,
        }
    }
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self::for_address(0)
    }
}

/// Progress of one client.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfirmState {
    /// Still needs a request.
    Init,
    /// Request sent, answer outstanding.
    WaitingAck,
    Confirmed,
    GaveUp,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ClientEntry {
    pub address: u8,
    pub max_retry: u8,
    pub current_retry: u8,
    pub state: ConfirmState,
    pub request_timestamp: Millis,
}

/// Where the scheduler is within the walk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WalkPhase {
    /// Nothing to send.
    Idle,
    /// The current client is due a request.
    Ready,
    /// A request was handed out but has not reached the wire yet.
    InFlight,
    Collision { since: Millis },
    AwaitAck { since: Millis },
}

/// Outcome of a client during [`EventConfirmation::poll`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConfirmEvent {
    Confirmed(u8),
    Retrying { address: u8, attempt: u8 },
    GaveUp(u8),
    WalkAborted,
}

/// Scheduler for confirmed switch-state notifications.
#[derive(Debug)]
pub struct EventConfirmation {
    config: ConfirmConfig,
    clients: Vec<ClientEntry, CLIENT_SLOTS>,
    phase: WalkPhase,
    current: usize,
    target: u8,
    observed: Option<u8>,
    last_sample_at: Option<Millis>,
    walk_started_at: Millis,
    deferred: Option<(u8, ClientTable)>,
}

impl EventConfirmation {
    #[must_use]
    pub const fn new(config: ConfirmConfig) -> Self {
        Self {
            config,
            clients: Vec::new(),
            phase: WalkPhase::Idle,
            current: 0,
            target: 0,
            observed: None,
            last_sample_at: None,
            walk_started_at: 0,
            deferred: None,
        }
    }

    #[must_use]
    pub const fn config(&self) -> ConfirmConfig {
        self.config
    }

    pub fn set_config(&mut self, config: ConfirmConfig) {
        self.config = config;
    }

    #[must_use]
    pub const fn phase(&self) -> WalkPhase {
        self.phase
    }

    /// State value currently being distributed.
    #[must_use]
    pub const fn target(&self) -> u8 {
        self.target
    }

    #[must_use]
    pub fn clients(&self) -> &[ClientEntry] {
        &self.clients
    }

    #[must_use]
    pub fn client(&self, address: u8) -> Option<&ClientEntry> {
        self.clients.iter().find(|entry| entry.address == address)
    }

    /// Returns `true` when nothing is left to send.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self.phase, WalkPhase::Idle)
    }

    /// Samples the switch state at the configured interval.
    ///
    /// The first sample only establishes a baseline. Returns `true` when a
    /// change was detected and a new walk started.
    pub fn sample<C: Clock>(&mut self, clock: &C, state: u8, table: &ClientTable) -> bool {
        let now = clock.now_ms();
        if let Some(at) = self.last_sample_at
            && elapsed(at, now) < self.config.sample_interval_ms
        {
            return false;
        }
        self.last_sample_at = Some(now);

        match self.observed.replace(state) {
            None => false,
            Some(previous) if previous == state => false,
            Some(_) => {
                self.notify_change(clock, state, table);
                true
            }
        }
    }

    /// Starts distributing `state` to every client in `table`.
    ///
    /// A request already handed to the transmitter finishes first; the new
    /// walk begins once it is reported as transmitted.
    pub fn notify_change<C: Clock>(&mut self, clock: &C, state: u8, table: &ClientTable) {
        self.observed = Some(state);
        if self.phase == WalkPhase::InFlight {
            self.deferred = Some((state, *table));
            return;
        }
        self.restart(clock.now_ms(), state, table);
    }

    /// Advances the walk; returns a request to transmit when one is due.
    ///
    /// The caller must report the request with [`Self::transmitted`] once
    /// it has left the node.
    pub fn poll<C: Clock>(&mut self, clock: &C, own_address: u8) -> (Option<Telegram>, Option<ConfirmEvent>) {
        let now = clock.now_ms();

        if self.phase != WalkPhase::Idle
            && self.phase != WalkPhase::InFlight
            && elapsed(self.walk_started_at, now) >= self.config.walk_limit_ms
        {
            self.abort();
            return (None, Some(ConfirmEvent::WalkAborted));
        }

        match self.phase {
            WalkPhase::Idle | WalkPhase::InFlight => (None, None),
            WalkPhase::Ready => {
                let Some(entry) = self.clients.get_mut(self.current) else {
                    self.phase = WalkPhase::Idle;
                    return (None, None);
                };
                entry.state = ConfirmState::WaitingAck;
                entry.request_timestamp = now;
                self.phase = WalkPhase::InFlight;
                let request = Telegram::new(
                    own_address,
                    Message::ReqSwitchState {
                        receiver: entry.address,
                        state: self.target,
                    },
                );
                (Some(request), None)
            }
            WalkPhase::Collision { since } => {
                if elapsed(since, now) >= self.config.collision_window_ms {
                    self.phase = WalkPhase::AwaitAck { since: now };
                }
                (None, None)
            }
            WalkPhase::AwaitAck { since } => {
                let Some(entry) = self.clients.get_mut(self.current) else {
                    self.phase = WalkPhase::Idle;
                    return (None, None);
                };
                if entry.state == ConfirmState::Confirmed {
                    let address = entry.address;
                    self.advance();
                    return (None, Some(ConfirmEvent::Confirmed(address)));
                }
                if elapsed(since, now) < self.config.response_timeout_ms {
                    return (None, None);
                }

                entry.current_retry = entry.current_retry.saturating_add(1);
                let event = if entry.current_retry >= entry.max_retry {
                    entry.state = ConfirmState::GaveUp;
                    ConfirmEvent::GaveUp(entry.address)
                } else {
                    entry.state = ConfirmState::Init;
                    ConfirmEvent::Retrying {
                        address: entry.address,
                        attempt: entry.current_retry,
                    }
                };
                self.advance();
                (None, Some(event))
            }
        }
    }

    /// Records that the last request from [`Self::poll`] was transmitted.
    pub fn transmitted<C: Clock>(&mut self, clock: &C) {
        if self.phase != WalkPhase::InFlight {
            return;
        }
        let now = clock.now_ms();
        self.phase = WalkPhase::Collision { since: now };
        if let Some((state, table)) = self.deferred.take() {
            self.restart(now, state, &table);
        }
    }

    /// Handles a switch-state response from `sender`.
    ///
    /// Returns `true` when it confirmed an outstanding request.
    pub fn acknowledge(&mut self, sender: u8, state: u8) -> bool {
        if state != self.target {
            return false;
        }
        match self
            .clients
            .iter_mut()
            .find(|entry| entry.address == sender && entry.state == ConfirmState::WaitingAck)
        {
            Some(entry) => {
                entry.state = ConfirmState::Confirmed;
                true
            }
            None => false,
        }
    }

    fn restart(&mut self, now: Millis, state: u8, table: &ClientTable) {
        self.clients.clear();
        for (address, max_retry) in table.iter() {
            // The table has exactly as many slots as the walk.
            let _ = self.clients.push(ClientEntry {
                address,
                max_retry,
                current_retry: 0,
                state: ConfirmState::Init,
                request_timestamp: now,
            });
        }
        self.target = state;
        self.current = 0;
        self.walk_started_at = now;
        self.deferred = None;
        self.phase = if self.clients.is_empty() {
            WalkPhase::Idle
        } else {
            WalkPhase::Ready
        };
    }

    fn advance(&mut self) {
        let count = self.clients.len();
        for offset in 1..=count {
            let index = (self.current + offset) % count;
            if self.clients[index].state == ConfirmState::Init {
                self.current = index;
                self.phase = WalkPhase::Ready;
                return;
            }
        }
        self.phase = WalkPhase::Idle;
    }

    fn abort(&mut self) {
        for entry in &mut self.clients {
            if matches!(entry.state, ConfirmState::Init | ConfirmState::WaitingAck) {
                entry.state = ConfirmState::GaveUp;
            }
        }
        self.phase = WalkPhase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn table(addresses: &[u8]) -> ClientTable {
        let mut table = ClientTable::EMPTY;
        table.addresses[..addresses.len()].copy_from_slice(addresses);
        table
    }

    #[test]
    fn first_sample_is_only_a_baseline() {
        let clock = ManualClock::new(0);
        let mut confirm = EventConfirmation::new(ConfirmConfig::default());
        let clients = table(&[0x10]);
        assert!(!confirm.sample(&clock, 0b01, &clients));
        clock.advance(ConfirmConfig::DEFAULT_SAMPLE_INTERVAL_MS);
        assert!(!confirm.sample(&clock, 0b01, &clients));
        clock.advance(ConfirmConfig::DEFAULT_SAMPLE_INTERVAL_MS);
        assert!(confirm.sample(&clock, 0b11, &clients));
        assert_eq!(confirm.phase(), WalkPhase::Ready);
    }

    #[test]
    fn change_while_in_flight_is_deferred() {
        let clock = ManualClock::new(0);
        let mut confirm = EventConfirmation::new(ConfirmConfig::default());
        let clients = table(&[0x10, 0x11]);

        confirm.notify_change(&clock, 1, &clients);
        let (request, _) = confirm.poll(&clock, 0x05);
        assert!(request.is_some());

        confirm.notify_change(&clock, 2, &clients);
        assert_eq!(confirm.target(), 1);

        confirm.transmitted(&clock);
        assert_eq!(confirm.target(), 2);
        assert_eq!(confirm.phase(), WalkPhase::Ready);
        assert!(
            confirm
                .clients()
                .iter()
                .all(|entry| entry.state == ConfirmState::Init)
        );
    }

    #[test]
    fn change_while_awaiting_ack_restarts_the_walk() {
        let clock = ManualClock::new(0);
        let config = ConfirmConfig::default();
        let mut confirm = EventConfirmation::new(config);
        let clients = table(&[0x10, 0x11]);

        confirm.notify_change(&clock, 1, &clients);
        assert!(confirm.poll(&clock, 0x05).0.is_some());
        confirm.transmitted(&clock);
        assert!(confirm.acknowledge(0x10, 1));
        clock.advance(config.collision_window_ms);
        confirm.poll(&clock, 0x05);
        assert_eq!(
            confirm.poll(&clock, 0x05),
            (None, Some(ConfirmEvent::Confirmed(0x10)))
        );

        assert!(confirm.poll(&clock, 0x05).0.is_some());
        confirm.transmitted(&clock);
        clock.advance(config.collision_window_ms);
        confirm.poll(&clock, 0x05);
        assert!(matches!(confirm.phase(), WalkPhase::AwaitAck { .. }));

        confirm.notify_change(&clock, 2, &clients);
        assert_eq!(confirm.target(), 2);
        assert!(
            confirm
                .clients()
                .iter()
                .all(|entry| entry.state == ConfirmState::Init)
        );
        let (request, _) = confirm.poll(&clock, 0x05);
        assert_eq!(
            request.map(|telegram| telegram.message),
            Some(Message::ReqSwitchState {
                receiver: 0x10,
                state: 2
            })
        );
    }

    #[test]
    fn collision_window_depends_on_address() {
        assert_eq!(ConfirmConfig::collision_window_for(0), 10);
        assert_eq!(ConfirmConfig::collision_window_for(0x13), 16);
    }

    #[test]
    fn empty_table_stays_idle() {
        let clock = ManualClock::new(0);
        let mut confirm = EventConfirmation::new(ConfirmConfig::default());
        confirm.notify_change(&clock, 1, &ClientTable::EMPTY);
        assert!(confirm.is_idle());
        assert_eq!(confirm.poll(&clock, 1), (None, None));
    }
}
