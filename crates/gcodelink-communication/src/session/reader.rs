//! Reader task
//!
//! Runs on a blocking thread for the life of a connection. Each line is
//! decoded and applied to the shared state; the active writer is woken after
//! every acknowledgement or resend so it can re-check the flow gate.

use super::Shared;
use crate::communication::{is_fatal_io, LinkReader, ReadOutcome};
use crate::transport::{command_lines, decode, Inbound, ResendDisposition};
use gcodelink_core::ConnectionError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) fn run(
    shared: Arc<Shared>,
    mut link: Box<dyn LinkReader>,
    read_timeout: Duration,
    stop: Arc<AtomicBool>,
    failures: mpsc::UnboundedSender<ConnectionError>,
) {
    tracing::debug!("Reader started");
    let mut consecutive_errors = 0;

    while !stop.load(Ordering::SeqCst) {
        match link.read_line(read_timeout) {
            Ok(ReadOutcome::Line(line)) => {
                consecutive_errors = 0;
                handle_line(&shared, &line);
            }
            Ok(ReadOutcome::Timeout) => consecutive_errors = 0,
            Err(error) if is_fatal_io(&error) => {
                tracing::error!("Read failed: {}", error);
                let _ = failures.send(ConnectionError::Closed {
                    reason: error.to_string(),
                });
                return;
            }
            Err(error) => {
                consecutive_errors += 1;
                if consecutive_errors > shared.config.max_io_retries {
                    let _ = failures.send(ConnectionError::RetriesExhausted {
                        operation: "read".to_string(),
                        attempts: consecutive_errors,
                        reason: error.to_string(),
                    });
                    return;
                }
                tracing::warn!(
                    "Transient read failure ({}/{}): {}",
                    consecutive_errors,
                    shared.config.max_io_retries,
                    error
                );
                std::thread::sleep(shared.config.retry_backoff);
            }
        }
    }

    // hand over whatever already arrived before the channel is released
    while let Ok(true) = link.is_data_available() {
        match link.read_line(shared.config.poll_interval) {
            Ok(ReadOutcome::Line(line)) => handle_line(&shared, &line),
            _ => break,
        }
    }

    tracing::debug!("Reader stopped");
}

fn handle_line(shared: &Shared, line: &str) {
    match decode(line) {
        Inbound::Ack(ack) => {
            tracing::trace!("< {}", line);
            let report = shared.state.lock().on_ack(ack);
            shared.notify.notify_one();
            if let Some(report) = report {
                shared.sinks.info.show(&report);
            }
        }
        Inbound::Resend(request) => {
            let disposition = shared.state.lock().on_resend(request);
            match disposition {
                ResendDisposition::Accepted => {
                    tracing::info!("Resending from line {}", request.from_sequence)
                }
                ResendDisposition::Restarted => {
                    tracing::info!("Restarting replay from line {}", request.from_sequence)
                }
                ResendDisposition::Ignored => {
                    tracing::warn!("Ignoring resend request for line {}", request.from_sequence)
                }
                ResendDisposition::Fatal(error) => tracing::error!("{}", error),
            }
            shared.notify.notify_one();
        }
        Inbound::Info(text) => {
            shared.sinks.info.show(&text);
            if shared.config.is_ready_line(&text) {
                mark_ready(shared);
            }
        }
    }
}

/// First readiness announcement on a connection queues the startup commands
fn mark_ready(shared: &Shared) {
    let newly_ready = {
        let mut state = shared.state.lock();
        if state.ready {
            false
        } else {
            state.ready = true;
            for command in &shared.config.startup_commands {
                let lines = command_lines(command).map(|line| shared.config.prepare(line));
                state.priority.extend(lines);
            }
            true
        }
    };

    if newly_ready {
        tracing::info!("Firmware ready");
        shared.sinks.status.show("Printer ready");
        shared.notify.notify_one();
    }
}
