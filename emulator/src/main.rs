mod session;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use crossterm::style::Stylize;
use node_core::codec::DeviceType;

use session::{LineKind, Options, OutputLine, Session};

const USAGE: &str =
    "Usage: node-emulator [--type <switch|shader|pwm>] [--address <hex>] [--transcript <path>]";

fn main() -> io::Result<()> {
    let options = parse_options(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(&options)?;
    let mut line = String::new();

    writeln!(
        writer,
        "Node emulator ready ({} at 0x{:02X}). Type `help` for commands or `exit` to quit.",
        options.device_type.label(),
        options.address
    )?;
    for output in session.take_startup() {
        print_line(&mut writer, &output)?;
    }

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        for output in session.handle_command(trimmed)? {
            print_line(&mut writer, &output)?;
        }
    }

    Ok(())
}

fn print_line<W: Write>(writer: &mut W, line: &OutputLine) -> io::Result<()> {
    match line.kind {
        LineKind::Reply => writeln!(writer, "{}", line.text),
        LineKind::Error => writeln!(writer, "{}", line.text.as_str().red()),
        LineKind::Transmit => writeln!(writer, "{}", line.text.as_str().cyan()),
        LineKind::Telemetry => writeln!(writer, "{}", line.text.as_str().dark_grey()),
        LineKind::Warning => writeln!(writer, "{}", line.text.as_str().yellow()),
    }
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_options(mut args: impl Iterator<Item = String>) -> Result<Options, String> {
    let mut options = Options::default();
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let mut value = || {
            inline
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| format!("Expected value after {flag}"))
        };

        match flag.as_str() {
            "--transcript" => options.transcript = Some(PathBuf::from(value()?)),
            "--type" => options.device_type = parse_device_type(&value()?)?,
            "--address" => options.address = parse_address(&value()?)?,
            other => return Err(format!("Unknown argument `{other}`")),
        }
    }
    Ok(options)
}

fn parse_device_type(tag: &str) -> Result<DeviceType, String> {
    [
        DeviceType::SwitchPanel,
        DeviceType::ShaderPanel,
        DeviceType::PwmPanel,
    ]
    .into_iter()
    .find(|device| device.label().eq_ignore_ascii_case(tag))
    .ok_or_else(|| format!("Unknown device type `{tag}`"))
}

fn parse_address(text: &str) -> Result<u8, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    match u8::from_str_radix(digits, 16) {
        Ok(0xFF) => Err("Address 0xFF is reserved for broadcast".to_string()),
        Ok(address) => Ok(address),
        Err(err) => Err(format!("Invalid address `{text}`: {err}")),
    }
}
