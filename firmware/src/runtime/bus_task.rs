use defmt::{Debug2Format, Display2Format, info, warn};
use embassy_futures::select::{Either4, select4};
use embassy_stm32::peripherals::IWDG;
use embassy_stm32::wdg::IndependentWatchdog;
use embassy_time::{Duration, Ticker};
use node_core::NodeAction;
use node_core::clock::Clock;
use node_core::codec::encode;
use node_core::console::execute_line;

use super::{CONSOLE_LINES, CONSOLE_REPLIES, FirmwareNode};
use crate::console::{ConsoleReply, render_reply};
use crate::hw::power::POWER_FAIL_SIGNAL;
use crate::hw::reset::PendingReset;
use crate::hw::{Rs485, StoragePage};
use crate::telemetry::{TelemetryDrain, emit_missed, emit_record};

const CHECK_INTERVAL: Duration = Duration::from_millis(1);
const RECEIVE_CHUNK: usize = 32;

/// Owns the node and runs its cooperative loop.
#[embassy_executor::task]
pub async fn run(
    node: &'static mut FirmwareNode,
    mut bus: Rs485,
    mut page: StoragePage,
    mut watchdog: IndependentWatchdog<'static, IWDG>,
) -> ! {
    let mut ticker = Ticker::every(CHECK_INTERVAL);
    let mut telemetry = TelemetryDrain::new();
    let mut chunk = [0u8; RECEIVE_CHUNK];
    let mut reset = PendingReset::None;

    info!(
        "node: address {:#x}, {}",
        node.config().address,
        node.config().device_type.label()
    );

    loop {
        let event = select4(
            bus.receive(&mut chunk),
            ticker.next(),
            POWER_FAIL_SIGNAL.wait(),
            CONSOLE_LINES.receive(),
        )
        .await;

        match event {
            Either4::First(Ok(count)) => {
                for byte in &chunk[..count] {
                    if let Some(action) = node.bus_poll(*byte) {
                        if let Some(requested) = handle_action(node, &mut page, action) {
                            reset.request(requested);
                        }
                    }
                }
            }
            Either4::First(Err(error)) => warn!("bus: receive error {}", Debug2Format(&error)),
            Either4::Second(()) => node.check(),
            Either4::Third(()) => {
                critical_section::with(|_| node.power_fail());
                commit(node, &mut page);
                reset.request(PendingReset::PowerFail);
            }
            Either4::Fourth(line) => {
                let result = execute_line(node, &line);
                let mut reply = ConsoleReply::new();
                if render_reply(&mut reply, node, &result).is_err() {
                    warn!("console: reply truncated");
                }
                CONSOLE_REPLIES.send(reply).await;
            }
        }

        if !reset.keeps_running() {
            halt().await;
        }

        transmit(node, &mut bus).await;

        emit_missed(telemetry.drain(node.telemetry(), emit_record));

        let now = node.clock().now_ms();
        if let Err(error) = node.storage_mut().poll_commit(&mut page, now) {
            warn!("storage: commit failed {}", Debug2Format(&error));
        }

        if reset.feeds_watchdog() {
            watchdog.pet();
        } else if reset == PendingReset::Bootloader && node.pending_transmit().next().is_none() {
            cortex_m::peripheral::SCB::sys_reset();
        }
    }
}

fn handle_action(
    node: &mut FirmwareNode,
    page: &mut StoragePage,
    action: NodeAction,
) -> Option<PendingReset> {
    match action {
        NodeAction::Reboot => {
            info!("node: reboot requested");
            commit(node, page);
            Some(PendingReset::Watchdog)
        }
        NodeAction::EnterBootloader => {
            info!("node: entering bootloader");
            commit(node, page);
            Some(PendingReset::Bootloader)
        }
        NodeAction::Button { sender, button } => {
            info!("bus: button {} from {:#x}", Debug2Format(&button), sender);
            None
        }
        NodeAction::PeerStartup {
            sender,
            device_type,
        } => {
            info!("bus: {:#x} started as {}", sender, device_type.label());
            None
        }
    }
}

/// Parks the loop with outputs frozen until the watchdog restarts the node,
/// which then restores the saved state on boot.
async fn halt() -> ! {
    warn!("node: supply failing, waiting for watchdog reset");
    loop {
        core::future::pending::<()>().await;
    }
}

fn commit(node: &mut FirmwareNode, page: &mut StoragePage) {
    if let Err(error) = node.storage_mut().commit(page) {
        warn!("storage: commit failed {}", Debug2Format(&error));
    }
}

async fn transmit(node: &mut FirmwareNode, bus: &mut Rs485) {
    while let Some(telegram) = node.pop_transmit() {
        match encode(&telegram) {
            Ok(frame) => {
                if let Err(error) = bus.send(&frame).await {
                    warn!("bus: transmit error {}", Debug2Format(&error));
                }
            }
            Err(error) => warn!("bus: {}", Display2Format(&error)),
        }
        node.transmitted(&telegram);
    }
}
