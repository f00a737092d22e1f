//! The node aggregate: bus codec, controllers, persistence and telemetry.
//!
//! The firmware and the emulator both drive a [`Node`] the same way: feed
//! received bytes into [`Node::bus_poll`], call [`Node::check`] from the
//! main loop, and drain [`Node::pop_transmit`] into the transmitter,
//! reporting each sent telegram back through [`Node::transmitted`].

mod dispatch;

use heapless::Deque;

use crate::clock::Clock;
use crate::codec::telegram::{DIGITAL_STATE_BYTES, SHADER_CHANNELS};
use crate::codec::{
    DecodeStatus, Decoder, DeviceState, DeviceType, DeviceValue, Message, MessageKind,
    ShaderSetup, Telegram,
};
use crate::config::NodeConfig;
use crate::confirm::{ConfirmEvent, EventConfirmation};
use crate::digital::{DigitalOutputs, OutputDriver};
use crate::persist::{StateLog, StateSnapshot, Storage};
use crate::pwm::{PwmController, PwmDriver, PwmEvent};
use crate::shader::{RelayPair, ShaderController, ShaderError, ShaderEvent};
use crate::telemetry::{TelemetryEventKind, TelemetryRecorder};

pub use dispatch::DispatchError;

/// Number of telegrams that can wait for the transmitter.
pub const TX_QUEUE_DEPTH: usize = 8;

/// Side effects the runtime must carry out on behalf of the node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeAction {
    /// Restart through the watchdog; state has already been saved.
    Reboot,
    /// Restart into the bootloader; state has already been saved.
    EnterBootloader,
    /// A peer broadcast a button press.
    Button { sender: u8, button: Button },
    /// A peer announced that it booted.
    PeerStartup { sender: u8, device_type: DeviceType },
}

/// Button reported by a button-pressed broadcast.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Button {
    First,
    Second,
    Both,
}

/// A complete field-bus node.
pub struct Node<C, D, P, S>
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
{
    clock: C,
    config: NodeConfig,
    storage: S,
    decoder: Decoder,
    outputs: DigitalOutputs<D>,
    shaders: ShaderController,
    pwm: PwmController<P>,
    confirm: EventConfirmation,
    state_log: StateLog,
    tx: Deque<Telegram, TX_QUEUE_DEPTH>,
    telemetry: TelemetryRecorder,
}

impl<C, D, P, S> Node<C, D, P, S>
where
    C: Clock,
    D: OutputDriver,
    P: PwmDriver,
    S: Storage,
{
    /// Builds a node from an explicit configuration.
    ///
    /// Shader channels whose setup is invalid are left unconfigured.
    pub fn new(clock: C, config: NodeConfig, outputs: D, pwm: P, storage: S) -> Self {
        let (state_log, _) = StateLog::scan(&storage);
        let mut node = Self {
            clock,
            config,
            storage,
            decoder: Decoder::new(),
            outputs: DigitalOutputs::new(outputs),
            shaders: ShaderController::new(config.shader_timing),
            pwm: PwmController::new(pwm, config.fade),
            confirm: EventConfirmation::new(config.confirm),
            state_log,
            tx: Deque::new(),
            telemetry: TelemetryRecorder::new(),
        };

        for channel in 0..SHADER_CHANNELS {
            let setup = node.config.shader_setup[channel];
            if setup.is_configured() && node.apply_shader_setup(channel, setup).is_err() {
                node.config.shader_setup[channel] = ShaderSetup::UNCONFIGURED;
            }
        }
        node
    }

    /// Loads configuration from `storage`, restores the saved outputs and
    /// queues the startup announcement.
    pub fn boot(clock: C, device_type: DeviceType, outputs: D, pwm: P, storage: S) -> Self {
        let config = NodeConfig::load(&storage, device_type);
        let mut node = Self::new(clock, config, outputs, pwm, storage);
        node.restore();
        node.announce();
        node
    }

    /// Queues a device-startup broadcast.
    pub fn announce(&mut self) {
        self.enqueue(Telegram::new(
            self.config.address,
            Message::DevStartup {
                device_type: self.config.device_type,
            },
        ));
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Storage handle, e.g. for flushing a write-back cache.
    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn outputs(&self) -> &DigitalOutputs<D> {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut DigitalOutputs<D> {
        &mut self.outputs
    }

    pub fn shaders(&self) -> &ShaderController {
        &self.shaders
    }

    pub fn shaders_mut(&mut self) -> &mut ShaderController {
        &mut self.shaders
    }

    pub fn pwm(&self) -> &PwmController<P> {
        &self.pwm
    }

    pub fn pwm_mut(&mut self) -> &mut PwmController<P> {
        &mut self.pwm
    }

    /// Outputs together with the clock their delays are measured against.
    pub fn clock_and_outputs(&mut self) -> (&C, &mut DigitalOutputs<D>) {
        (&self.clock, &mut self.outputs)
    }

    /// PWM channels together with the clock their fades are measured against.
    pub fn clock_and_pwm(&mut self) -> (&C, &mut PwmController<P>) {
        (&self.clock, &mut self.pwm)
    }

    pub fn confirm(&self) -> &EventConfirmation {
        &self.confirm
    }

    pub fn telemetry(&self) -> &TelemetryRecorder {
        &self.telemetry
    }

    /// Telegrams waiting for the transmitter.
    pub fn pending_transmit(&self) -> impl Iterator<Item = &Telegram> + '_ {
        self.tx.iter()
    }

    /// Feeds one received byte; completed telegrams are dispatched.
    pub fn bus_poll(&mut self, byte: u8) -> Option<NodeAction> {
        match self.decoder.push(byte) {
            DecodeStatus::Pending => None,
            DecodeStatus::Error(error) => {
                self.record(TelemetryEventKind::FramingError(error));
                None
            }
            DecodeStatus::Ok(telegram) => match self.dispatch(&telegram) {
                Ok(action) => action,
                Err(DispatchError::NotAddressed) => None,
                Err(error) => {
                    self.record(TelemetryEventKind::Rejected {
                        kind: telegram.kind(),
                        error,
                    });
                    None
                }
            },
        }
    }

    /// Runs one pass over every controller.
    pub fn check(&mut self) {
        if let Some(change) = self.outputs.check(&self.clock) {
            self.record(TelemetryEventKind::OutputSwitched {
                channel: narrow(change.channel),
                on: change.on,
            });
        }

        if let Some(event) = self.shaders.check(&self.clock, &mut self.outputs) {
            self.record(match event {
                ShaderEvent::Started { channel, direction } => TelemetryEventKind::ShaderStarted {
                    channel: narrow(channel),
                    direction,
                },
                ShaderEvent::Reversing { channel } => TelemetryEventKind::ShaderReversing {
                    channel: narrow(channel),
                },
                ShaderEvent::Stopped { channel, position } => TelemetryEventKind::ShaderStopped {
                    channel: narrow(channel),
                    position,
                },
            });
        }

        if let Some(event) = self.pwm.check(&self.clock) {
            self.record(match event {
                PwmEvent::FadeComplete { channel, level } => TelemetryEventKind::FadeComplete {
                    channel: narrow(channel),
                    level,
                },
                PwmEvent::SwitchedOff { channel } => TelemetryEventKind::PwmSwitchedOff {
                    channel: narrow(channel),
                },
            });
        }

        self.check_confirmation();
    }

    /// Next telegram for the transmitter.
    pub fn pop_transmit(&mut self) -> Option<Telegram> {
        let telegram = self.tx.pop_front()?;
        self.record(TelemetryEventKind::TelegramSent {
            kind: telegram.kind(),
        });
        Some(telegram)
    }

    /// Reports that `telegram` has left the node.
    pub fn transmitted(&mut self, telegram: &Telegram) {
        if telegram.kind() == MessageKind::ReqSwitchState {
            self.confirm.transmitted(&self.clock);
        }
    }

    /// Switch state distributed to clients: the low two digital outputs.
    #[must_use]
    pub fn switch_state(&self) -> u8 {
        self.outputs.state_mask().to_le_bytes()[0] & 0b11
    }

    /// Current output state in the wire form of this device type.
    #[must_use]
    pub fn device_state(&self) -> DeviceState {
        let mask = self.outputs.state_mask();
        match self.config.device_type {
            DeviceType::SwitchPanel => DeviceState::SwitchPanel {
                outputs: mask.to_le_bytes()[0],
            },
            DeviceType::ShaderPanel => {
                let bytes: [u8; DIGITAL_STATE_BYTES] = mask.to_le_bytes();
                DeviceState::ShaderPanel {
                    digital: bytes,
                    shader: self.shaders.positions(),
                }
            }
            DeviceType::PwmPanel => DeviceState::PwmPanel {
                enabled: self.pwm.enabled_mask(),
                level: self.pwm.levels(),
            },
        }
    }

    /// Configuration values in the wire form of this device type.
    #[must_use]
    pub fn device_value(&self) -> DeviceValue {
        match self.config.device_type {
            DeviceType::SwitchPanel => DeviceValue::SwitchPanel,
            DeviceType::ShaderPanel => DeviceValue::ShaderPanel {
                setup: self.config.shader_setup,
            },
            DeviceType::PwmPanel => DeviceValue::PwmPanel {
                level: self.pwm.levels(),
            },
        }
    }

    /// Assigns relays and travel times to a shader channel and persists them.
    ///
    /// An unconfigured setup releases the channel's relays.
    ///
    /// # Errors
    ///
    /// Rejects unknown or moving channels, invalid durations, and relays that
    /// do not exist or already belong to another channel.
    pub fn configure_shader(&mut self, channel: usize, setup: ShaderSetup) -> Result<(), ShaderError> {
        self.validate_shader_setup(channel, setup)?;
        self.apply_shader_setup(channel, setup)?;
        self.config.shader_setup[channel] = setup;
        self.config.store_shader_setup(&mut self.storage, channel);
        Ok(())
    }

    /// Captures the output state for the power-fail log.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            digital: self.outputs.state_mask(),
            shader: self.shaders.positions(),
            pwm_enabled: self.pwm.enabled_mask(),
            pwm_level: self.pwm.levels(),
        }
    }

    /// Saves the output state; called when supply voltage drops.
    pub fn power_fail(&mut self) {
        let snapshot = self.snapshot();
        self.state_log.append(&mut self.storage, &snapshot);
        self.record(TelemetryEventKind::StateSaved);
    }

    /// Restores outputs from the newest saved snapshot.
    ///
    /// Returns `true` when a snapshot was found.
    pub fn restore(&mut self) -> bool {
        let (log, snapshot) = StateLog::scan(&self.storage);
        self.state_log = log;
        let Some(snapshot) = snapshot else {
            return false;
        };

        self.outputs.restore_mask(snapshot.digital);
        for (channel, position) in snapshot.shader.iter().enumerate() {
            self.shaders.restore_position(channel, *position);
        }
        self.pwm.restore(snapshot.pwm_enabled, &snapshot.pwm_level);
        self.record(TelemetryEventKind::StateRestored);
        true
    }

    fn check_confirmation(&mut self) {
        let state = self.switch_state();
        if self.confirm.sample(&self.clock, state, &self.config.clients) {
            self.record(TelemetryEventKind::SwitchStateChanged { state });
        }

        // A request is only handed out when it can be queued.
        if self.tx.is_full() {
            return;
        }
        let (request, event) = self.confirm.poll(&self.clock, self.config.address);
        if let Some(request) = request {
            self.enqueue(request);
        }
        if let Some(event) = event {
            self.record(match event {
                ConfirmEvent::Confirmed(address) => TelemetryEventKind::ClientConfirmed { address },
                ConfirmEvent::Retrying { address, attempt } => {
                    TelemetryEventKind::ClientRetry { address, attempt }
                }
                ConfirmEvent::GaveUp(address) => TelemetryEventKind::ClientGaveUp { address },
                ConfirmEvent::WalkAborted => TelemetryEventKind::ConfirmWalkAborted,
            });
        }
    }

    fn validate_shader_setup(&self, channel: usize, setup: ShaderSetup) -> Result<(), ShaderError> {
        let shader = self
            .shaders
            .shader(channel)
            .ok_or(ShaderError::InvalidChannel(channel))?;
        if shader.state != crate::shader::ShaderState::Stopped {
            return Err(ShaderError::Busy(channel));
        }
        if !setup.is_configured() {
            return Ok(());
        }
        if setup.open_ds == 0 || setup.close_ds == 0 {
            return Err(ShaderError::InvalidDuration);
        }
        if setup.power == setup.direction {
            return Err(ShaderError::RelayConflict);
        }

        let own = shader.relays;
        for relay in [setup.power, setup.direction] {
            let index = usize::from(relay);
            if index >= self.outputs.capacity() {
                return Err(ShaderError::RelayConflict);
            }
            let owned_here =
                own.is_some_and(|pair| pair.power == relay || pair.direction == relay);
            if self.outputs.is_reserved(index) && !owned_here {
                return Err(ShaderError::RelayConflict);
            }
        }
        Ok(())
    }

    fn apply_shader_setup(&mut self, channel: usize, setup: ShaderSetup) -> Result<(), ShaderError> {
        self.validate_shader_setup(channel, setup)?;
        let position = self.shaders.position(channel);
        if let Some(previous) = self.shaders.unconfigure(channel)? {
            self.outputs.release(usize::from(previous.power));
            self.outputs.release(usize::from(previous.direction));
        }
        if !setup.is_configured() {
            return Ok(());
        }

        let relays = RelayPair {
            power: setup.power,
            direction: setup.direction,
        };
        self.shaders.configure(
            channel,
            relays,
            u32::from(setup.open_ds) * 100,
            u32::from(setup.close_ds) * 100,
        )?;
        if let Some(position) = position {
            self.shaders.restore_position(channel, position);
        }
        for relay in [setup.power, setup.direction] {
            self.outputs
                .reserve(usize::from(relay))
                .map_err(|_| ShaderError::RelayConflict)?;
        }
        Ok(())
    }

    fn enqueue(&mut self, telegram: Telegram) {
        if self.tx.push_back(telegram).is_err() {
            self.record(TelemetryEventKind::TransmitOverflow);
        }
    }

    fn record(&mut self, event: TelemetryEventKind) {
        let now = self.clock.now_ms();
        self.telemetry.record(event, now);
    }
}

fn narrow(channel: usize) -> u8 {
    u8::try_from(channel).unwrap_or(u8::MAX)
}
