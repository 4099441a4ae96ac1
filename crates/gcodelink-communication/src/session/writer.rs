//! Writer tasks
//!
//! A single supervisor task per connection owns the writing half of the
//! channel. It runs the interactive writer until a stream is requested, runs
//! the streaming writer to completion or abort, then resumes the interactive
//! writer. The handoff happens inside one task, so the two writers can never
//! be active together.

use super::Shared;
use crate::communication::{is_fatal_io, LinkWriter};
use crate::transport::{command_lines, CommandSource, Frame, Selection, TransportConfig, TransportState};
use chrono::{DateTime, Utc};
use gcodelink_core::{ConnectionError, Error, Result, SessionError, SessionState, StreamOutcome, StreamReport};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

/// Requests from the session to the writer supervisor
pub(crate) enum WriterCommand {
    /// Stop the interactive writer and stream `source`
    StartStream {
        source: Box<dyn CommandSource>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Stop the streaming writer
    AbortStream { reply: oneshot::Sender<Result<()>> },
    /// Stop writing altogether
    Shutdown,
}

enum WriterExit {
    /// Back to the interactive writer
    Resume,
    Shutdown,
    ChannelLost(ConnectionError),
}

enum Handoff {
    Stream(Box<dyn CommandSource>, oneshot::Sender<Result<()>>),
    Exit(WriterExit),
}

enum Drain {
    Drained,
    Expired,
    Interrupted(WriterCommand),
}

pub(crate) async fn supervise(
    shared: Arc<Shared>,
    mut link: Box<dyn LinkWriter>,
    mut control: mpsc::UnboundedReceiver<WriterCommand>,
    failures: mpsc::UnboundedSender<ConnectionError>,
) -> Box<dyn LinkWriter> {
    tracing::debug!("Writer started");

    loop {
        let exit = match interactive(&shared, link.as_mut(), &mut control).await {
            Handoff::Stream(source, reply) => {
                tracing::debug!("Interactive writer stopped for stream");
                stream(&shared, link.as_mut(), &mut control, source, reply).await
            }
            Handoff::Exit(exit) => exit,
        };

        match exit {
            WriterExit::Resume => tracing::debug!("Interactive writer resumed"),
            WriterExit::Shutdown => break,
            WriterExit::ChannelLost(error) => {
                let _ = failures.send(error);
                break;
            }
        }
    }

    tracing::debug!("Writer stopped");
    link
}

async fn interactive(
    shared: &Shared,
    link: &mut dyn LinkWriter,
    control: &mut mpsc::UnboundedReceiver<WriterCommand>,
) -> Handoff {
    loop {
        match control.try_recv() {
            Ok(WriterCommand::StartStream { source, reply }) => {
                return Handoff::Stream(source, reply)
            }
            Ok(WriterCommand::AbortStream { reply }) => {
                let _ = reply.send(Err(SessionError::NoActiveStream.into()));
            }
            Ok(WriterCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                return Handoff::Exit(WriterExit::Shutdown)
            }
            Err(TryRecvError::Empty) => {}
        }

        let selection = shared.state.lock().select(&mut None);
        match selection {
            Ok(Selection::Idle | Selection::Blocked) => idle_wait(shared).await,
            Ok(selection) => {
                if let Err(error) = transmit(shared, link, selection).await {
                    return Handoff::Exit(WriterExit::ChannelLost(error));
                }
            }
            Err(fault) => tracing::warn!("Ignoring protocol fault outside a stream: {}", fault),
        }
    }
}

async fn stream(
    shared: &Shared,
    link: &mut dyn LinkWriter,
    control: &mut mpsc::UnboundedReceiver<WriterCommand>,
    mut source: Box<dyn CommandSource>,
    reply: oneshot::Sender<Result<()>>,
) -> WriterExit {
    let config = &shared.config;

    match drain(shared, control, config.ack_stall_warning).await {
        Drain::Drained => {}
        Drain::Expired => tracing::warn!(
            "Starting stream with {} unacknowledged commands",
            shared.state.lock().flow.pending()
        ),
        Drain::Interrupted(WriterCommand::AbortStream { reply: abort }) => {
            let _ = reply.send(Err(Error::other("Stream start cancelled")));
            let _ = abort.send(Ok(()));
            return WriterExit::Resume;
        }
        Drain::Interrupted(_) => {
            let _ = reply.send(Err(SessionError::NotConnected.into()));
            return WriterExit::Shutdown;
        }
    }

    if let Err(error) = source.rewind() {
        let _ = reply.send(Err(error.into()));
        return WriterExit::Resume;
    }

    let reset = Frame::encode(None, &config.line_reset_command);
    let begun = {
        let mut state = shared.state.lock();
        let begun = state.begin_stream(source.len_hint().unwrap_or(0));
        if begun.is_ok() && reset.is_some() {
            state.flow.on_send(None);
        }
        begun
    };
    if let Err(error) = begun {
        let _ = reply.send(Err(error.into()));
        return WriterExit::Resume;
    }

    let started_at = Utc::now();
    let _ = reply.send(Ok(()));
    shared.sinks.status.show("Streaming started");

    if let Some(reset) = reset {
        if let Err(error) = transmit(shared, link, Selection::Priority(reset)).await {
            finish(shared, StreamOutcome::ChannelLost, started_at);
            return WriterExit::ChannelLost(error);
        }
        // no numbered frame before the reset is acknowledged
        let mut stall_warned = false;
        loop {
            match drain(shared, control, config.ack_stall_warning).await {
                Drain::Drained => break,
                Drain::Expired => {
                    if !stall_warned {
                        stall_warned = true;
                        warn_stall(shared, config.ack_stall_warning);
                    }
                }
                Drain::Interrupted(WriterCommand::AbortStream { reply }) => {
                    finish(shared, StreamOutcome::Aborted, started_at);
                    let _ = reply.send(Ok(()));
                    return WriterExit::Resume;
                }
                Drain::Interrupted(_) => {
                    finish(shared, StreamOutcome::ChannelLost, started_at);
                    return WriterExit::Shutdown;
                }
            }
        }
    }

    let mut lookahead: Option<String> = None;
    let mut queued = VecDeque::new();
    let mut exhausted = false;
    let mut lines_read = 0;
    let mut stall_warned = false;

    loop {
        // cancellation is observed between frames, never mid-write
        match control.try_recv() {
            Ok(WriterCommand::AbortStream { reply }) => {
                finish(shared, StreamOutcome::Aborted, started_at);
                let _ = reply.send(Ok(()));
                return WriterExit::Resume;
            }
            Ok(WriterCommand::StartStream { reply, .. }) => {
                let _ = reply.send(Err(SessionError::StreamActive.into()));
            }
            Ok(WriterCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                finish(shared, StreamOutcome::ChannelLost, started_at);
                return WriterExit::Shutdown;
            }
            Err(TryRecvError::Empty) => {}
        }

        if lookahead.is_none() && !exhausted {
            match next_payload(source.as_mut(), config, &mut queued, &mut lines_read) {
                Ok(Some(payload)) => lookahead = Some(payload),
                Ok(None) => exhausted = true,
                Err(error) => {
                    tracing::error!("Failed reading stream source: {}", error);
                    shared
                        .sinks
                        .status
                        .show(&format!("Stream source failed: {}", error));
                    finish(shared, StreamOutcome::SourceFailed, started_at);
                    return WriterExit::Resume;
                }
            }
        }

        let (selection, complete, ack_wait) = {
            let mut state = shared.state.lock();
            state.progress.lines_read = lines_read;
            if exhausted && state.session == SessionState::Streaming {
                settle(&mut state, SessionState::Finalizing);
            }
            let selection = state.select(&mut lookahead);
            let complete = matches!(selection, Ok(Selection::Idle))
                && state.session == SessionState::Finalizing
                && state.flow.pending() == 0;
            (selection, complete, state.flow.ack_wait())
        };

        match selection {
            Ok(Selection::Idle) if complete => {
                finish(shared, StreamOutcome::Completed, started_at);
                return WriterExit::Resume;
            }
            Ok(Selection::Idle | Selection::Blocked) => {
                match ack_wait {
                    Some(waited) if waited >= config.ack_stall_warning => {
                        if !stall_warned {
                            stall_warned = true;
                            warn_stall(shared, waited);
                        }
                    }
                    _ => stall_warned = false,
                }
                idle_wait(shared).await;
            }
            Ok(selection) => {
                if let Err(error) = transmit(shared, link, selection).await {
                    finish(shared, StreamOutcome::ChannelLost, started_at);
                    return WriterExit::ChannelLost(error);
                }
            }
            Err(fault) => {
                tracing::error!("Stream desynchronized: {}", fault);
                shared
                    .sinks
                    .status
                    .show(&format!("Stream aborted: {}", fault));
                finish(shared, StreamOutcome::Desynchronized, started_at);
                return WriterExit::Resume;
            }
        }
    }
}

/// Next non-empty payload from the source, counting every item consumed
///
/// An item spanning several lines yields one payload per line, held in
/// `queued` until taken.
fn next_payload(
    source: &mut dyn CommandSource,
    config: &TransportConfig,
    queued: &mut VecDeque<String>,
    lines_read: &mut u64,
) -> io::Result<Option<String>> {
    loop {
        if let Some(payload) = queued.pop_front() {
            return Ok(Some(payload));
        }
        let Some(item) = source.next_line()? else {
            return Ok(None);
        };
        *lines_read += 1;
        queued.extend(command_lines(&item).map(|line| config.prepare(line)));
    }
}

fn warn_stall(shared: &Shared, waited: Duration) {
    tracing::warn!("No acknowledgement for {:?}", waited);
    shared.sinks.status.show(&format!(
        "No acknowledgement from firmware for {}s",
        waited.as_secs()
    ));
}

/// Wait for in-flight frames to be acknowledged, up to `limit`
async fn drain(
    shared: &Shared,
    control: &mut mpsc::UnboundedReceiver<WriterCommand>,
    limit: Duration,
) -> Drain {
    let deadline = Instant::now() + limit;
    loop {
        if shared.state.lock().flow.pending() == 0 {
            return Drain::Drained;
        }
        match control.try_recv() {
            Ok(WriterCommand::StartStream { reply, .. }) => {
                let _ = reply.send(Err(SessionError::StreamActive.into()));
            }
            Ok(command) => return Drain::Interrupted(command),
            Err(TryRecvError::Disconnected) => return Drain::Interrupted(WriterCommand::Shutdown),
            Err(TryRecvError::Empty) => {}
        }
        if Instant::now() >= deadline {
            return Drain::Expired;
        }
        idle_wait(shared).await;
    }
}

/// Bounded wait, cut short by the reader or the session
async fn idle_wait(shared: &Shared) {
    let _ = tokio::time::timeout(shared.config.poll_interval, shared.notify.notified()).await;
}

async fn transmit(
    shared: &Shared,
    link: &mut dyn LinkWriter,
    selection: Selection,
) -> std::result::Result<(), ConnectionError> {
    let wire = match selection {
        Selection::Replay { sequence, wire } => {
            tracing::debug!("Replaying line {}", sequence);
            wire
        }
        Selection::Priority(frame) | Selection::Bulk(frame) => frame.to_wire(),
        Selection::Blocked | Selection::Idle => return Ok(()),
    };
    tracing::debug!("> {}", wire.trim_end());
    write_with_retry(&shared.config, link, wire.as_bytes()).await
}

/// Write, retrying transient failures with exponential backoff
async fn write_with_retry(
    config: &TransportConfig,
    link: &mut dyn LinkWriter,
    bytes: &[u8],
) -> std::result::Result<(), ConnectionError> {
    let mut attempts = 0;
    loop {
        let error = match link.write(bytes) {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };
        if is_fatal_io(&error) {
            return Err(ConnectionError::Closed {
                reason: error.to_string(),
            });
        }

        attempts += 1;
        if attempts > config.max_io_retries {
            return Err(ConnectionError::RetriesExhausted {
                operation: "write".to_string(),
                attempts,
                reason: error.to_string(),
            });
        }

        let backoff = config
            .retry_backoff
            .saturating_mul(1u32 << (attempts - 1).min(10));
        tracing::warn!(
            "{} (attempt {}/{}, retrying in {:?})",
            ConnectionError::Transient {
                operation: "write".to_string(),
                reason: error.to_string(),
            },
            attempts,
            config.max_io_retries,
            backoff
        );
        tokio::time::sleep(backoff).await;
    }
}

/// Settle the state machine after a stream and publish its report
fn finish(shared: &Shared, outcome: StreamOutcome, started_at: DateTime<Utc>) {
    let report = {
        let mut state = shared.state.lock();
        let aborting = !matches!(outcome, StreamOutcome::Completed | StreamOutcome::ChannelLost);
        if aborting {
            settle(&mut state, SessionState::Aborting);
        }

        let report = StreamReport {
            outcome,
            frames_sent: state.frames_sent,
            frames_replayed: state.frames_replayed,
            started_at,
            finished_at: Utc::now(),
        };
        state.end_stream();

        if outcome != StreamOutcome::ChannelLost {
            settle(&mut state, SessionState::Idle);
        }
        report
    };

    tracing::info!("{}", report);
    shared.sinks.status.show(&report.to_string());
    *shared.last_report.lock() = Some(report);
}

fn settle(state: &mut TransportState, next: SessionState) {
    if let Err(error) = state.transition(next) {
        tracing::warn!("{}", error);
    }
}
