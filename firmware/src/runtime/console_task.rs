use defmt::{Debug2Format, warn};
use embassy_stm32::usart::{BufferedUartRx, BufferedUartTx};
use embedded_io_async::{Read, Write};

use super::{CONSOLE_LINES, CONSOLE_REPLIES};
use crate::console::{LineBuffer, line_error_reply};

const BANNER: &[u8] = b"\r\nhomebus node console, type `help`\r\n";
const PROMPT: &[u8] = b"> ";

#[embassy_executor::task]
pub async fn run(mut tx: BufferedUartTx<'static>, mut rx: BufferedUartRx<'static>) -> ! {
    let mut line = LineBuffer::new();
    let mut chunk = [0u8; 16];

    write_raw(&mut tx, BANNER).await;
    write_raw(&mut tx, PROMPT).await;

    loop {
        let count = match rx.read(&mut chunk).await {
            Ok(count) => count,
            Err(error) => {
                warn!("console: read error {}", Debug2Format(&error));
                continue;
            }
        };

        write_raw(&mut tx, &chunk[..count]).await;

        for byte in &chunk[..count] {
            let Some(result) = line.ingest(*byte) else {
                continue;
            };
            let reply = match result {
                Ok(text) => {
                    CONSOLE_LINES.send(text).await;
                    CONSOLE_REPLIES.receive().await
                }
                Err(error) => line_error_reply(error),
            };

            write_raw(&mut tx, b"\r\n").await;
            for reply_line in reply.lines() {
                write_raw(&mut tx, reply_line.as_bytes()).await;
                write_raw(&mut tx, b"\r\n").await;
            }
            write_raw(&mut tx, PROMPT).await;
        }
    }
}

async fn write_raw(tx: &mut BufferedUartTx<'static>, bytes: &[u8]) {
    if let Err(error) = tx.write_all(bytes).await {
        warn!("console: write error {}", Debug2Format(&error));
    }
}
