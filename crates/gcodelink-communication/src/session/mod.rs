//! Connected session
//!
//! A [`Session`] owns everything scoped to one printer connection: the shared
//! transport state, the reader task, and the writer supervisor. The reader and
//! writer meet only at [`TransportState`], behind one lock, and wake each other
//! through a [`Notify`].
//!
//! Shutdown order is fixed: stop the reader, then the writer, then release the
//! channel.

mod reader;
mod writer;

use crate::communication::{ConnectionParams, Connector};
use crate::transport::{command_lines, CommandSource, FlowState, StreamProgress, TransportConfig, TransportState};
use gcodelink_core::{ConnectionError, Error, Result, SessionError, SessionState, Sinks, StreamReport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;
use writer::WriterCommand;

/// Command that cuts power to the steppers
pub const MOTORS_OFF_COMMAND: &str = "M81";

/// State shared by the session handle and its tasks
pub(crate) struct Shared {
    pub(crate) state: Mutex<TransportState>,
    pub(crate) notify: Notify,
    pub(crate) config: TransportConfig,
    pub(crate) sinks: Sinks,
    pub(crate) last_report: Mutex<Option<StreamReport>>,
    connection: Mutex<Option<Connection>>,
    /// Serializes connect and teardown
    lifecycle: tokio::sync::Mutex<()>,
}

/// Tasks and handles of one open connection
struct Connection {
    id: Uuid,
    reader_stop: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    control: mpsc::UnboundedSender<WriterCommand>,
    writer: JoinHandle<Box<dyn crate::communication::LinkWriter>>,
}

/// A printer session
///
/// # Example
/// ```rust,ignore
/// let session = Session::new(Arc::new(SerialConnector), params, config, sinks);
/// session.connect().await?;
/// session.send_command("G28")?;
/// session.start_stream(Box::new(FileSource::open("part.gcode")?)).await?;
/// ```
pub struct Session {
    connector: Arc<dyn Connector>,
    params: ConnectionParams,
    shared: Arc<Shared>,
}

impl Session {
    /// Create a disconnected session
    pub fn new(
        connector: Arc<dyn Connector>,
        params: ConnectionParams,
        config: TransportConfig,
        sinks: Sinks,
    ) -> Self {
        Self {
            connector,
            params,
            shared: Arc::new(Shared {
                state: Mutex::new(TransportState::new(&config)),
                notify: Notify::new(),
                config,
                sinks,
                last_report: Mutex::new(None),
                connection: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Connection parameters
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Open the channel and start the reader and interactive writer
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        if self.shared.connection.lock().is_some() {
            return Err(SessionError::AlreadyConnected.into());
        }

        let connector = self.connector.clone();
        let params = self.params.clone();
        let link = tokio::task::spawn_blocking(move || {
            let mut link = connector.open(&params)?;
            if params.reset_on_connect {
                link.writer.assert_reset()?;
            }
            Ok::<_, Error>(link)
        })
        .await
        .map_err(|e| Error::other(format!("Connect task failed: {}", e)))??;

        {
            let mut state = self.shared.state.lock();
            state.reset_connection();
            state.transition(SessionState::Idle)?;
        }

        let id = Uuid::new_v4();
        let span = tracing::info_span!("session", id = %id, port = %self.params.port);
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<ConnectionError>();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let reader_stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let shared = self.shared.clone();
            let stop = reader_stop.clone();
            let failures = failure_tx.clone();
            let span = span.clone();
            let read_timeout = self.params.read_timeout();
            tokio::task::spawn_blocking(move || {
                let _entered = span.enter();
                reader::run(shared, link.reader, read_timeout, stop, failures)
            })
        };

        let writer = tokio::spawn(
            writer::supervise(self.shared.clone(), link.writer, control_rx, failure_tx)
                .instrument(span.clone()),
        );

        *self.shared.connection.lock() = Some(Connection {
            id,
            reader_stop,
            reader,
            control: control_tx,
            writer,
        });

        // closes once both tasks have dropped their senders
        let shared = self.shared.clone();
        tokio::spawn(
            async move {
                if let Some(error) = failure_rx.recv().await {
                    tracing::error!("Channel failure: {}", error);
                    teardown(&shared, Some(id), Some(error.to_string())).await;
                }
            }
            .instrument(span),
        );

        tracing::info!(
            "Connected to {} at {} baud (session {})",
            self.params.port,
            self.params.baud_rate,
            id
        );
        self.shared.sinks.status.show(&format!(
            "Connected to {} at {} baud",
            self.params.port, self.params.baud_rate
        ));
        Ok(())
    }

    /// Stop all tasks and release the channel
    pub async fn disconnect(&self) -> Result<()> {
        if teardown(&self.shared, None, None).await {
            Ok(())
        } else {
            Err(SessionError::NotConnected.into())
        }
    }

    /// Stream a command source
    ///
    /// Returns once the interactive writer has stopped and the stream has
    /// begun; completion is reported on the status sink and via
    /// [`Session::last_report`].
    pub async fn start_stream(&self, source: Box<dyn CommandSource>) -> Result<()> {
        match self.state() {
            SessionState::Idle => {}
            SessionState::Disconnected => return Err(SessionError::NotConnected.into()),
            _ => return Err(SessionError::StreamActive.into()),
        }

        let (reply, response) = oneshot::channel();
        self.send_control(WriterCommand::StartStream { source, reply })?;
        response
            .await
            .map_err(|_| Error::from(SessionError::NotConnected))?
    }

    /// Stop the running stream without waiting for outstanding acknowledgements
    pub async fn abort_stream(&self) -> Result<()> {
        let state = self.state();
        if !state.is_connected() {
            return Err(SessionError::NotConnected.into());
        }
        if !state.is_streaming() {
            return Err(SessionError::NoActiveStream.into());
        }

        let (reply, response) = oneshot::channel();
        self.send_control(WriterCommand::AbortStream { reply })?;
        response
            .await
            .map_err(|_| Error::from(SessionError::NotConnected))?
    }

    /// Queue a command ahead of any bulk stream
    ///
    /// Text spanning several lines is queued as one command per line.
    pub fn send_command(&self, command: &str) -> Result<()> {
        let config = &self.shared.config;
        {
            let mut state = self.shared.state.lock();
            if !state.session.is_connected() {
                return Err(SessionError::NotConnected.into());
            }
            state
                .priority
                .extend(command_lines(command).map(|line| config.prepare(line)));
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Queue the motors-off command
    pub fn motors_off(&self) -> Result<()> {
        self.send_command(MOTORS_OFF_COMMAND)
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.shared.state.lock().state()
    }

    /// Progress of the current or last stream
    pub fn progress(&self) -> StreamProgress {
        self.shared.state.lock().progress
    }

    /// Current flow counters
    pub fn flow_state(&self) -> FlowState {
        self.shared.state.lock().flow.state()
    }

    /// Report of the last finished stream
    pub fn last_report(&self) -> Option<StreamReport> {
        self.shared.last_report.lock().clone()
    }

    /// Whether the firmware has announced readiness on this connection
    pub fn is_ready(&self) -> bool {
        self.shared.state.lock().ready
    }

    /// Identifier of the open connection
    pub fn session_id(&self) -> Option<Uuid> {
        self.shared.connection.lock().as_ref().map(|c| c.id)
    }

    fn send_control(&self, command: WriterCommand) -> Result<()> {
        let control = self
            .shared
            .connection
            .lock()
            .as_ref()
            .map(|c| c.control.clone())
            .ok_or(SessionError::NotConnected)?;
        control
            .send(command)
            .map_err(|_| SessionError::NotConnected)?;
        self.shared.notify.notify_one();
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(connection) = self.shared.connection.lock().take() {
            connection.reader_stop.store(true, Ordering::SeqCst);
            let _ = connection.control.send(WriterCommand::Shutdown);
            self.shared.notify.notify_one();
        }
    }
}

/// Tear down the open connection, if any
///
/// With `only` set, a connection other than the one named is left alone.
/// Returns whether a connection was torn down.
async fn teardown(shared: &Shared, only: Option<Uuid>, reason: Option<String>) -> bool {
    let _lifecycle = shared.lifecycle.lock().await;
    let connection = {
        let mut slot = shared.connection.lock();
        match slot.as_ref() {
            Some(open) if only.map_or(true, |id| id == open.id) => slot.take(),
            _ => None,
        }
    };
    let Some(connection) = connection else {
        return false;
    };

    connection.reader_stop.store(true, Ordering::SeqCst);
    if let Err(error) = connection.reader.await {
        tracing::warn!("Reader task ended abnormally: {}", error);
    }

    let _ = connection.control.send(WriterCommand::Shutdown);
    shared.notify.notify_one();
    match connection.writer.await {
        Ok(mut link) => {
            if let Err(error) = link.close() {
                tracing::warn!("Failed to close channel: {}", error);
            }
        }
        Err(error) => tracing::warn!("Writer task ended abnormally: {}", error),
    }

    {
        let mut state = shared.state.lock();
        state.reset_connection();
        state.session = SessionState::Disconnected;
    }
    tracing::info!("Session state: {}", SessionState::Disconnected);

    match reason {
        Some(reason) => shared
            .sinks
            .status
            .show(&format!("Connection lost: {}", reason)),
        None => shared.sinks.status.show("Disconnected"),
    }
    true
}
