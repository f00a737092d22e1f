use core::panic::PanicInfo;
use defmt::error;

// Relays stay where they are; the watchdog restarts the node.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    error!("panic: {}", defmt::Display2Format(info));
    cortex_m::asm::udf();
}
