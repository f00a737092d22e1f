use embassy_stm32::flash::{Blocking, Error as FlashError, Flash};
use embassy_stm32::gpio::Output;
use embassy_stm32::peripherals::TIM3;
use embassy_stm32::timer::Channel;
use embassy_stm32::timer::simple_pwm::SimplePwm;
use embassy_stm32::usart::{BufferedUartRx, BufferedUartTx, Error as UartError};
use embassy_time::Instant;
use embedded_io_async::{Read, Write};
use node_core::clock::{Clock, Millis};
use node_core::digital::OutputDriver;
use node_core::pwm::{PwmDriver, PwmResolution};

use super::flash::{FlashPage, StorageImage};
use super::{scale_duty, wrap_millis};

/// Relay outputs wired to GPIO on this board.
pub const RELAY_COUNT: usize = 8;

/// Last 2 KiB page of the 512 KiB flash, relative to the flash base.
const STORAGE_PAGE_OFFSET: u32 = 0x7_F800;
const STORAGE_PAGE_SIZE: u32 = 0x800;

const PWM_CHANNELS: [Channel; 4] = [Channel::Ch1, Channel::Ch2, Channel::Ch3, Channel::Ch4];

/// Node clock on top of the embassy time driver.
pub struct EmbassyClock;

impl Clock for EmbassyClock {
    fn now_ms(&self) -> Millis {
        wrap_millis(Instant::now().as_millis())
    }
}

/// Relay drivers; channels past [`RELAY_COUNT`] are not populated.
pub struct RelayOutputs {
    pins: [Output<'static>; RELAY_COUNT],
}

impl RelayOutputs {
    pub fn new(pins: [Output<'static>; RELAY_COUNT]) -> Self {
        Self { pins }
    }
}

impl OutputDriver for RelayOutputs {
    fn set(&mut self, channel: usize, on: bool) {
        if let Some(pin) = self.pins.get_mut(channel) {
            if on {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
    }
}

/// Four dimmer channels on TIM3.
pub struct TimerPwm {
    pwm: SimplePwm<'static, TIM3>,
    full_scale: u16,
}

impl TimerPwm {
    pub fn new(mut pwm: SimplePwm<'static, TIM3>, resolution: PwmResolution) -> Self {
        for channel in PWM_CHANNELS {
            let mut output = pwm.channel(channel);
            output.set_duty_cycle(0);
            output.enable();
        }
        Self {
            pwm,
            full_scale: resolution.max_level(),
        }
    }
}

impl PwmDriver for TimerPwm {
    fn write_duty(&mut self, channel: usize, duty: u16) {
        let Some(channel) = PWM_CHANNELS.get(channel) else {
            return;
        };
        let mut output = self.pwm.channel(*channel);
        let max = output.max_duty_cycle();
        output.set_duty_cycle(scale_duty(duty, self.full_scale, max));
    }
}

/// Flash page that backs the node's storage image.
pub struct StoragePage {
    flash: Flash<'static, Blocking>,
}

impl StoragePage {
    pub fn new(flash: Flash<'static, Blocking>) -> Self {
        Self { flash }
    }
}

impl FlashPage for StoragePage {
    type Error = FlashError;

    fn load(&mut self, image: &mut StorageImage) -> Result<(), FlashError> {
        self.flash.blocking_read(STORAGE_PAGE_OFFSET, image)
    }

    fn program(&mut self, image: &StorageImage) -> Result<(), FlashError> {
        self.flash
            .blocking_erase(STORAGE_PAGE_OFFSET, STORAGE_PAGE_OFFSET + STORAGE_PAGE_SIZE)?;
        self.flash.blocking_write(STORAGE_PAGE_OFFSET, image)
    }
}

/// Half-duplex RS-485 transceiver with a driver-enable pin.
pub struct Rs485 {
    tx: BufferedUartTx<'static>,
    rx: BufferedUartRx<'static>,
    driver_enable: Output<'static>,
}

impl Rs485 {
    pub fn new(
        tx: BufferedUartTx<'static>,
        rx: BufferedUartRx<'static>,
        driver_enable: Output<'static>,
    ) -> Self {
        Self {
            tx,
            rx,
            driver_enable,
        }
    }

    /// Reads whatever has arrived, waiting for at least one byte.
    pub async fn receive(&mut self, buffer: &mut [u8]) -> Result<usize, UartError> {
        self.rx.read(buffer).await
    }

    /// Drives the bus for the duration of one frame.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), UartError> {
        self.driver_enable.set_high();
        let written = self.tx.write_all(frame).await;
        // The transmitter must be idle before the line is released.
        let flushed = self.tx.flush().await;
        self.driver_enable.set_low();
        written.and(flushed)
    }
}
