use cortex_m::interrupt;
use cortex_m::register::primask;
use critical_section::{self, RawRestoreState};
use defmt::unwrap;
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_stm32 as hal;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::flash::Flash;
use embassy_stm32::gpio::{Level, Output, OutputType, Pull, Speed};
use embassy_stm32::time::khz;
use embassy_stm32::timer::low_level::CountingMode;
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};
use embassy_stm32::usart::{BufferedInterruptHandler, BufferedUart, Config as UartConfig};
use embassy_stm32::wdg::IndependentWatchdog;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use node_core::Node;
use node_core::codec::{DeviceType, MAX_FRAME};
use node_core::pwm::FadeConfig;
use static_cell::StaticCell;

use crate::console::{ConsoleLine, ConsoleReply};
use crate::hw::flash::ShadowStorage;
use crate::hw::{EmbassyClock, RelayOutputs, Rs485, StoragePage, TimerPwm, power};

mod bus_task;
mod console_task;

critical_section::set_impl!(InterruptCriticalSection);

struct InterruptCriticalSection;

unsafe impl critical_section::Impl for InterruptCriticalSection {
    unsafe fn acquire() -> RawRestoreState {
        let primask = primask::read();
        interrupt::disable();
        primask.is_active()
    }

    unsafe fn release(restore_state: RawRestoreState) {
        if restore_state {
            unsafe {
                interrupt::enable();
            }
        }
    }
}

/// Device type announced until one is written to storage.
const DEVICE_TYPE: DeviceType = DeviceType::ShaderPanel;

const BUS_BAUD: u32 = 19_200;
const CONSOLE_BAUD: u32 = 115_200;
const BUS_BUFFER_SIZE: usize = 2 * MAX_FRAME;
const CONSOLE_BUFFER_SIZE: usize = 256;
const WATCHDOG_TIMEOUT_US: u32 = 2_000_000;

pub(super) type FirmwareNode = Node<EmbassyClock, RelayOutputs, TimerPwm, ShadowStorage>;

pub(super) static CONSOLE_LINES: Channel<CriticalSectionRawMutex, ConsoleLine, 1> = Channel::new();
pub(super) static CONSOLE_REPLIES: Channel<CriticalSectionRawMutex, ConsoleReply, 1> =
    Channel::new();

static NODE: StaticCell<FirmwareNode> = StaticCell::new();
static BUS_TX_BUFFER: StaticCell<[u8; BUS_BUFFER_SIZE]> = StaticCell::new();
static BUS_RX_BUFFER: StaticCell<[u8; BUS_BUFFER_SIZE]> = StaticCell::new();
static CONSOLE_TX_BUFFER: StaticCell<[u8; CONSOLE_BUFFER_SIZE]> = StaticCell::new();
static CONSOLE_RX_BUFFER: StaticCell<[u8; CONSOLE_BUFFER_SIZE]> = StaticCell::new();

hal::bind_interrupts!(struct UartIrqs {
    USART1 => BufferedInterruptHandler<hal::peripherals::USART1>;
    USART2_LPUART2 => BufferedInterruptHandler<hal::peripherals::USART2>;
});

#[embassy_executor::main]
pub async fn main(spawner: Spawner) {
    let p = hal::init(hal::Config::default());

    let relays = RelayOutputs::new([
        Output::new(p.PA0, Level::Low, Speed::Low),
        Output::new(p.PA1, Level::Low, Speed::Low),
        Output::new(p.PA4, Level::Low, Speed::Low),
        Output::new(p.PA5, Level::Low, Speed::Low),
        Output::new(p.PA8, Level::Low, Speed::Low),
        Output::new(p.PA11, Level::Low, Speed::Low),
        Output::new(p.PA15, Level::Low, Speed::Low),
        Output::new(p.PB3, Level::Low, Speed::Low),
    ]);

    let timer = SimplePwm::new(
        p.TIM3,
        Some(PwmPin::new(p.PA6, OutputType::PushPull)),
        Some(PwmPin::new(p.PA7, OutputType::PushPull)),
        Some(PwmPin::new(p.PB0, OutputType::PushPull)),
        Some(PwmPin::new(p.PB1, OutputType::PushPull)),
        khz(1),
        CountingMode::EdgeAlignedUp,
    );
    let dimmers = TimerPwm::new(timer, FadeConfig::default().resolution);

    let mut page = StoragePage::new(Flash::new_blocking(p.FLASH));
    let storage = match ShadowStorage::load(&mut page) {
        Ok(storage) => storage,
        Err(error) => {
            defmt::warn!("storage: read failed ({}), starting erased", defmt::Debug2Format(&error));
            ShadowStorage::erased()
        }
    };

    let node = NODE.init(Node::boot(EmbassyClock, DEVICE_TYPE, relays, dimmers, storage));

    let mut bus_config = UartConfig::default();
    bus_config.baudrate = BUS_BAUD;
    let bus_uart = unwrap!(BufferedUart::new(
        p.USART1,
        p.PA10,
        p.PA9,
        BUS_TX_BUFFER.init([0; BUS_BUFFER_SIZE]),
        BUS_RX_BUFFER.init([0; BUS_BUFFER_SIZE]),
        UartIrqs,
        bus_config,
    ));
    let (bus_tx, bus_rx) = bus_uart.split();
    let bus = Rs485::new(bus_tx, bus_rx, Output::new(p.PA12, Level::Low, Speed::High));

    let mut console_config = UartConfig::default();
    console_config.baudrate = CONSOLE_BAUD;
    let console_uart = unwrap!(BufferedUart::new(
        p.USART2,
        p.PA3,
        p.PA2,
        CONSOLE_TX_BUFFER.init([0; CONSOLE_BUFFER_SIZE]),
        CONSOLE_RX_BUFFER.init([0; CONSOLE_BUFFER_SIZE]),
        UartIrqs,
        console_config,
    ));
    let (console_tx, console_rx) = console_uart.split();

    let sense = ExtiInput::new(p.PB4, p.EXTI4, Pull::Up);

    let mut watchdog = IndependentWatchdog::new(p.IWDG, WATCHDOG_TIMEOUT_US);
    watchdog.unleash();

    unwrap!(spawner.spawn(power::monitor(sense)));
    unwrap!(spawner.spawn(console_task::run(console_tx, console_rx)));
    unwrap!(spawner.spawn(bus_task::run(node, bus, page, watchdog)));

    core::future::pending::<()>().await;
}
