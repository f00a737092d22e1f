use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use node_core::clock::{Clock, ManualClock, Millis};
use node_core::codec::{DeviceType, Telegram, encode};
use node_core::config::{DEFAULT_NODE_ADDRESS, NodeConfig};
use node_core::console::{ConsoleError, HELP, Outcome, StatusFormatter, execute_line};
use node_core::digital::OutputDriver;
use node_core::persist::{RamStorage, Storage};
use node_core::pwm::{MAX_PWM_CHANNELS, PwmDriver};
use node_core::telemetry::{EventId, TelemetryEventKind};
use node_core::{Node, NodeAction};

/// Session settings chosen on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Options {
    pub device_type: DeviceType,
    pub address: u8,
    pub transcript: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device_type: DeviceType::ShaderPanel,
            address: 0x10,
            transcript: None,
        }
    }
}

/// How a line of output should be presented.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineKind {
    Reply,
    Error,
    /// A telegram the node put on the bus.
    Transmit,
    Telemetry,
    /// Telemetry that reports a fault.
    Warning,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputLine {
    pub kind: LineKind,
    pub text: String,
}

impl OutputLine {
    fn reply(text: impl Into<String>) -> Self {
        Self {
            kind: LineKind::Reply,
            text: text.into(),
        }
    }

    fn error(text: impl Into<String>) -> Self {
        Self {
            kind: LineKind::Error,
            text: text.into(),
        }
    }
}

/// Simulated clock shared between the session and the node.
#[derive(Clone, Debug, Default)]
pub struct SimClock(Rc<ManualClock>);

impl SimClock {
    fn advance(&self, ms: Millis) {
        self.0.advance(ms);
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> Millis {
        self.0.now_ms()
    }
}

/// Output pins, bit `n` is output `n`.
#[derive(Clone, Debug, Default)]
pub struct SimPins(Rc<Cell<u32>>);

impl SimPins {
    fn levels(&self) -> u32 {
        self.0.get()
    }
}

impl OutputDriver for SimPins {
    fn set(&mut self, channel: usize, on: bool) {
        let Some(bit) = u32::try_from(channel)
            .ok()
            .and_then(|channel| 1u32.checked_shl(channel))
        else {
            return;
        };
        let levels = self.0.get();
        self.0.set(if on { levels | bit } else { levels & !bit });
    }
}

/// Compare values last written to each dimmer.
#[derive(Clone, Debug, Default)]
pub struct SimDimmers(Rc<RefCell<[u16; MAX_PWM_CHANNELS]>>);

impl SimDimmers {
    fn duties(&self) -> [u16; MAX_PWM_CHANNELS] {
        *self.0.borrow()
    }
}

impl PwmDriver for SimDimmers {
    fn write_duty(&mut self, channel: usize, duty: u16) {
        if let Some(slot) = self.0.borrow_mut().get_mut(channel) {
            *slot = duty;
        }
    }
}

type EmulatedNode = Node<SimClock, SimPins, SimDimmers, RamStorage>;

pub struct Session {
    node: EmulatedNode,
    clock: SimClock,
    pins: SimPins,
    dimmers: SimDimmers,
    device_type: DeviceType,
    next_event: EventId,
    startup: Vec<OutputLine>,
    transcript: Option<TranscriptLogger>,
}

impl Session {
    pub fn new(options: &Options) -> io::Result<Self> {
        let transcript = options
            .transcript
            .as_deref()
            .map(TranscriptLogger::new)
            .transpose()?;

        let clock = SimClock::default();
        let pins = SimPins::default();
        let dimmers = SimDimmers::default();

        let mut storage: RamStorage = RamStorage::new();
        if options.address != DEFAULT_NODE_ADDRESS {
            NodeConfig::new(options.address, options.device_type).store(&mut storage);
        }
        let node = Node::boot(
            clock.clone(),
            options.device_type,
            pins.clone(),
            dimmers.clone(),
            storage,
        );

        let mut session = Self {
            node,
            clock,
            pins,
            dimmers,
            device_type: options.device_type,
            next_event: 0,
            startup: Vec::new(),
            transcript,
        };

        let mut startup = Vec::new();
        session.pump(&mut startup);
        session.record_output(&startup)?;
        session.startup = startup;
        Ok(session)
    }

    /// Output produced while booting: the startup announcement and telemetry.
    pub fn take_startup(&mut self) -> Vec<OutputLine> {
        std::mem::take(&mut self.startup)
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<OutputLine>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.append_line(self.clock.now_ms(), TranscriptRole::Host, trimmed)?;
        }

        let mut lines = Vec::new();
        let result = execute_line(&mut self.node, trimmed);
        self.describe(result, &mut lines);
        self.pump(&mut lines);
        self.record_output(&lines)?;
        Ok(lines)
    }

    /// The emulated node.
    pub fn node(&self) -> &EmulatedNode {
        &self.node
    }

    fn describe(&mut self, result: Result<Outcome, ConsoleError>, lines: &mut Vec<OutputLine>) {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                lines.push(OutputLine::error(format!("ERR {err}")));
                return;
            }
        };

        match outcome {
            Outcome::Done => lines.push(OutputLine::reply("ok")),
            Outcome::Advance(ms) => {
                self.advance(ms, lines);
                lines.push(OutputLine::reply(format!("ok t={}ms", self.clock.now_ms())));
            }
            Outcome::Status => self.status(lines),
            Outcome::Help => {
                lines.extend(HELP.iter().map(|line| OutputLine::reply(*line)));
                lines.push(OutputLine::reply("exit | quit"));
            }
            Outcome::Received { actions } => {
                for action in actions {
                    self.apply_action(action, lines);
                }
                lines.push(OutputLine::reply("ok"));
            }
            Outcome::Snapshot => lines.push(OutputLine::reply("state saved")),
            Outcome::Restored(true) => lines.push(OutputLine::reply("state restored")),
            Outcome::Restored(false) => lines.push(OutputLine::reply("no saved state")),
        }
    }

    /// Steps the clock one millisecond at a time, running the node after each.
    fn advance(&mut self, ms: Millis, lines: &mut Vec<OutputLine>) {
        for _ in 0..ms {
            self.clock.advance(1);
            self.node.check();
            self.transmit(lines);
        }
    }

    fn apply_action(&mut self, action: NodeAction, lines: &mut Vec<OutputLine>) {
        match action {
            NodeAction::Reboot => {
                // Flush anything queued before the restart.
                self.pump(lines);
                lines.push(OutputLine::reply("node rebooting"));
                let storage = self.node.storage().clone();
                self.node = Node::boot(
                    self.clock.clone(),
                    self.device_type,
                    self.pins.clone(),
                    self.dimmers.clone(),
                    storage,
                );
            }
            NodeAction::EnterBootloader => {
                lines.push(OutputLine::reply("bootloader requested (not emulated)"));
            }
            NodeAction::Button { sender, button } => {
                lines.push(OutputLine::reply(format!(
                    "button {button:?} pressed at 0x{sender:02X}"
                )));
            }
            NodeAction::PeerStartup {
                sender,
                device_type,
            } => lines.push(OutputLine::reply(format!(
                "peer 0x{sender:02X} started as {}",
                device_type.label()
            ))),
        }
    }

    fn status(&self, lines: &mut Vec<OutputLine>) {
        let mut text = String::new();
        if StatusFormatter::new(&self.node).write_all(&mut text).is_err() {
            lines.push(OutputLine::error("ERR status formatting failed"));
            return;
        }
        lines.extend(text.lines().map(OutputLine::reply));

        lines.push(OutputLine::reply(format!("pins 0b{:032b}", self.pins.levels())));
        let mut duties = String::from("duty");
        for (channel, duty) in self.dimmers.duties().iter().enumerate() {
            if *duty > 0 {
                let _ = write!(duties, " {channel}={duty}");
            }
        }
        lines.push(OutputLine::reply(duties));
    }

    /// Drains the transmit queue and new telemetry into `lines`.
    fn pump(&mut self, lines: &mut Vec<OutputLine>) {
        self.transmit(lines);

        for record in self.node.telemetry().since(self.next_event) {
            let kind = match record.event {
                TelemetryEventKind::FramingError(_)
                | TelemetryEventKind::Rejected { .. }
                | TelemetryEventKind::ClientGaveUp { .. }
                | TelemetryEventKind::ConfirmWalkAborted
                | TelemetryEventKind::TransmitOverflow => LineKind::Warning,
                _ => LineKind::Telemetry,
            };
            lines.push(OutputLine {
                kind,
                text: format!("[{:>8} ms] {}", record.timestamp_ms, record.event),
            });
        }
        self.next_event = self.node.telemetry().next_id();
    }

    fn transmit(&mut self, lines: &mut Vec<OutputLine>) {
        while let Some(telegram) = self.node.pop_transmit() {
            lines.push(match encode(&telegram) {
                Ok(frame) => OutputLine {
                    kind: LineKind::Transmit,
                    text: format!("tx {} | {}", describe_telegram(&telegram), hex(&frame)),
                },
                Err(err) => OutputLine::error(format!("ERR encode {err}")),
            });
            self.node.transmitted(&telegram);
        }
    }

    fn record_output(&mut self, lines: &[OutputLine]) -> io::Result<()> {
        let now = self.clock.now_ms();
        if let Some(transcript) = self.transcript.as_mut() {
            for line in lines {
                transcript.append_line(now, TranscriptRole::Emulator, &line.text)?;
            }
        }
        Ok(())
    }
}

fn describe_telegram(telegram: &Telegram) -> String {
    let mut text = format!("{:?} from 0x{:02X}", telegram.kind(), telegram.sender);
    if let Some(receiver) = telegram.message.receiver() {
        let _ = write!(text, " to 0x{receiver:02X}");
    }
    text
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Appends every exchanged line to a file, stamped with simulated time.
struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        logger.write_header()?;
        Ok(logger)
    }

    fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.writer, "# Node emulator transcript")?;
        writeln!(self.writer, "# Timestamps are simulated milliseconds")?;
        writeln!(self.writer)?;
        self.writer.flush()
    }

    fn append_line(&mut self, now_ms: Millis, role: TranscriptRole, line: &str) -> io::Result<()> {
        writeln!(self.writer, "[+{now_ms:>8} ms] {} {line}", role.prefix())?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use node_core::codec::Message;

    fn session(device_type: DeviceType) -> Session {
        Session::new(&Options {
            device_type,
            address: 0x10,
            transcript: None,
        })
        .unwrap()
    }

    fn rx_line(telegram: &Telegram) -> String {
        format!("rx {}", hex(&encode(telegram).unwrap()))
    }

    fn texts(lines: &[OutputLine], kind: LineKind) -> Vec<&str> {
        lines
            .iter()
            .filter(|line| line.kind == kind)
            .map(|line| line.text.as_str())
            .collect()
    }

    #[test]
    fn boot_announces_the_node() {
        let mut session = session(DeviceType::PwmPanel);
        let startup = session.take_startup();
        let sent = texts(&startup, LineKind::Transmit);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("tx DevStartup from 0x10"));
        assert!(session.take_startup().is_empty());
    }

    #[test]
    fn tick_runs_a_fade_to_completion() {
        let mut session = session(DeviceType::PwmPanel);
        session.handle_command("pwm 0 fade 0 255 1s").unwrap();
        let lines = session.handle_command("tick 2s").unwrap();

        assert_eq!(session.node().pwm().level(0), Some(255));
        assert!(
            texts(&lines, LineKind::Telemetry)
                .iter()
                .any(|line| line.ends_with("pwm 0 reached 255"))
        );
        assert_eq!(texts(&lines, LineKind::Reply), vec!["ok t=2000ms"]);

        let status = session.handle_command("status").unwrap();
        assert!(
            texts(&status, LineKind::Reply)
                .iter()
                .any(|line| line.starts_with("duty 0="))
        );
    }

    #[test]
    fn injected_requests_are_answered() {
        let mut session = session(DeviceType::ShaderPanel);
        let request = Telegram::new(0x01, Message::ReqGetState { receiver: 0x10 });
        let lines = session.handle_command(&rx_line(&request)).unwrap();

        let sent = texts(&lines, LineKind::Transmit);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].starts_with("tx RespGetState from 0x10 to 0x01 | 02 10"));
    }

    #[test]
    fn reboot_restores_saved_levels() {
        let mut session = session(DeviceType::PwmPanel);
        session.handle_command("pwm 3 level 120").unwrap();
        session.handle_command("pwm 3 on").unwrap();

        let reboot = Telegram::new(0x01, Message::ReqReboot { receiver: 0x10 });
        let lines = session.handle_command(&rx_line(&reboot)).unwrap();
        assert!(texts(&lines, LineKind::Reply).contains(&"node rebooting"));
        assert!(
            texts(&lines, LineKind::Transmit)
                .iter()
                .any(|line| line.starts_with("tx DevStartup"))
        );

        assert_eq!(session.node().pwm().level(3), Some(120));
        assert_eq!(session.node().pwm().is_enabled(3), Some(true));
    }

    #[test]
    fn errors_are_flagged() {
        let mut session = session(DeviceType::ShaderPanel);
        let lines = session.handle_command("shader 0 pos 150").unwrap();
        assert_eq!(lines[0].kind, LineKind::Error);

        let lines = session.handle_command("bogus").unwrap();
        assert!(lines[0].text.starts_with("ERR syntax error"));
    }

    #[test]
    fn transcript_records_both_sides() {
        let path = std::env::temp_dir().join(format!(
            "node-emulator-transcript-{}.log",
            std::process::id()
        ));
        let mut session = Session::new(&Options {
            device_type: DeviceType::SwitchPanel,
            address: 0x22,
            transcript: Some(path.clone()),
        })
        .unwrap();
        session.handle_command("help").unwrap();
        drop(session);

        let contents = fs::read_to_string(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(contents.starts_with("# Node emulator transcript"));
        assert!(contents.contains("EMU < tx DevStartup from 0x22"));
        assert!(contents.contains("HOST> help"));
        assert!(contents.contains("EMU < exit | quit"));
    }
}
