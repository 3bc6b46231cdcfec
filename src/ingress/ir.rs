//! IR / rotary bus sniffer.
//!
//! Reads raw key codes from the serial sniffer device one byte at a time on
//! a blocking worker, runs them through the shared translator, and
//! dispatches the resulting intents. Device loss reopens with the same
//! backoff discipline as the HID reader.

use std::io::Read;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ingress::{IntentSink, Translator};

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Bounded code queue; stale presses are droppable.
const QUEUE_CAPACITY: usize = 32;

/// Run the IR ingress until cancelled.
pub async fn run(device: String, sink: IntentSink, cancel: CancellationToken) {
    let (tx, mut rx) = mpsc::channel::<u8>(QUEUE_CAPACITY);

    let reader_cancel = cancel.clone();
    let reader_device = device.clone();
    tokio::task::spawn_blocking(move || read_loop(reader_device, tx, reader_cancel));

    let mut translator = Translator::default();
    loop {
        let code = tokio::select! {
            _ = cancel.cancelled() => break,
            code = rx.recv() => match code {
                Some(code) => code,
                None => break,
            },
        };
        if let Some(intent) = translator.feed(code) {
            debug!(code = format!("{:02x}", code), ?intent, "IR intent");
            sink.dispatch(intent).await;
        }
    }

    info!("IR ingress stopped");
}

fn read_loop(device: String, tx: mpsc::Sender<u8>, cancel: CancellationToken) {
    let mut backoff = BACKOFF_INITIAL;

    while !cancel.is_cancelled() {
        let mut port = match std::fs::File::open(&device) {
            Ok(port) => {
                info!(device = %device, "IR sniffer open");
                backoff = BACKOFF_INITIAL;
                port
            }
            Err(e) => {
                debug!(device = %device, error = %e, "IR open failed, backing off");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        };

        let mut byte = [0u8; 1];
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match port.read_exact(&mut byte) {
                Ok(()) => {
                    // Dropping on overflow loses a stale press, not state.
                    if tx.try_send(byte[0]).is_err() && tx.is_closed() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(device = %device, error = %e, "IR read failed, reopening");
                    break;
                }
            }
        }

        std::thread::sleep(backoff);
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}
