//! In-memory channel and scripted firmware for session tests
#![allow(dead_code)]

use gcodelink_communication::{
    ConnectionParams, Connector, Frame, LinkReader, LinkWriter, ReadOutcome, SerialLink, Session,
    TransportConfig,
};
use gcodelink_core::{ConnectionError, Error, MessageSink, Result, Sinks};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How the fake firmware acknowledges frames on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Never; the test drives every reply
    Off,
    /// `ok`
    Bare,
    /// `ok N<last line> P15 B3`
    Extended,
}

struct FirmwareState {
    mode: Mutex<AckMode>,
    /// Writes left to acknowledge, unlimited when `None`
    ack_budget: Mutex<Option<usize>>,
    written: Mutex<Vec<String>>,
    inbound: Mutex<VecDeque<String>>,
    /// (sequence, occurrence) -> replies sent instead of the automatic ack
    scripts: Mutex<HashMap<(u64, usize), Vec<String>>>,
    occurrences: Mutex<HashMap<u64, usize>>,
    last_line: Mutex<u64>,
    fail_writes: AtomicU32,
    dead: AtomicBool,
    resets: AtomicU32,
    opens: AtomicU32,
}

/// Scripted stand-in for a Marlin board
#[derive(Clone)]
pub struct FakeFirmware {
    state: Arc<FirmwareState>,
}

impl FakeFirmware {
    pub fn new(mode: AckMode) -> Self {
        Self {
            state: Arc::new(FirmwareState {
                mode: Mutex::new(mode),
                ack_budget: Mutex::new(None),
                written: Mutex::new(Vec::new()),
                inbound: Mutex::new(VecDeque::new()),
                scripts: Mutex::new(HashMap::new()),
                occurrences: Mutex::new(HashMap::new()),
                last_line: Mutex::new(0),
                fail_writes: AtomicU32::new(0),
                dead: AtomicBool::new(false),
                resets: AtomicU32::new(0),
                opens: AtomicU32::new(0),
            }),
        }
    }

    /// Change how frames are acknowledged from now on
    pub fn set_mode(&self, mode: AckMode) {
        *self.state.mode.lock() = mode;
    }

    /// Queue a line for the host to read
    pub fn push_line(&self, line: &str) {
        self.state.inbound.lock().push_back(line.to_string());
    }

    /// Only acknowledge the next `writes` writes
    pub fn limit_acks(&self, writes: usize) {
        *self.state.ack_budget.lock() = Some(writes);
    }

    /// Reply with `lines` instead of an ack the `occurrence`th time `sequence` arrives
    pub fn on_frame(&self, sequence: u64, occurrence: usize, lines: &[&str]) {
        self.state.scripts.lock().insert(
            (sequence, occurrence),
            lines.iter().map(|l| l.to_string()).collect(),
        );
    }

    /// Fail the next `count` writes with a transient error
    pub fn fail_next_writes(&self, count: u32) {
        self.state.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Make the device disappear
    pub fn unplug(&self) {
        self.state.dead.store(true, Ordering::SeqCst);
    }

    /// Lines written by the host, without terminators
    pub fn written(&self) -> Vec<String> {
        self.state
            .written
            .lock()
            .iter()
            .map(|l| l.trim_end().to_string())
            .collect()
    }

    /// Raw bytes written by the host, one entry per write
    pub fn raw_writes(&self) -> Vec<String> {
        self.state.written.lock().clone()
    }

    pub fn resets(&self) -> u32 {
        self.state.resets.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            firmware: self.clone(),
        })
    }

    fn receive(&self, wire: &str) {
        self.state.written.lock().push(wire.to_string());

        let frame = Frame::from_wire(wire);
        let sequence = frame.as_ref().and_then(|f| f.sequence);
        if let Some(sequence) = sequence {
            *self.state.last_line.lock() = sequence;
            let occurrence = {
                let mut seen = self.state.occurrences.lock();
                let count = seen.entry(sequence).or_insert(0);
                *count += 1;
                *count
            };
            if let Some(lines) = self.state.scripts.lock().remove(&(sequence, occurrence)) {
                let mut inbound = self.state.inbound.lock();
                inbound.extend(lines);
                return;
            }
        }

        {
            let mut budget = self.state.ack_budget.lock();
            match budget.as_mut() {
                Some(0) => return,
                Some(left) => *left -= 1,
                None => {}
            }
        }

        let ack = match *self.state.mode.lock() {
            AckMode::Off => return,
            AckMode::Bare => "ok".to_string(),
            AckMode::Extended => format!("ok N{} P15 B3", *self.state.last_line.lock()),
        };
        self.push_line(&ack);
    }
}

struct FakeConnector {
    firmware: FakeFirmware,
}

impl Connector for FakeConnector {
    fn open(&self, params: &ConnectionParams) -> Result<SerialLink> {
        if self.firmware.state.dead.load(Ordering::SeqCst) {
            return Err(Error::from(ConnectionError::OpenFailed {
                port: params.port.clone(),
                baud_rate: params.baud_rate,
                reason: "no such device".to_string(),
            }));
        }
        self.firmware.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(SerialLink {
            reader: Box::new(FakeReader {
                firmware: self.firmware.clone(),
            }),
            writer: Box::new(FakeWriter {
                firmware: self.firmware.clone(),
            }),
        })
    }
}

struct FakeReader {
    firmware: FakeFirmware,
}

impl LinkReader for FakeReader {
    fn read_line(&mut self, timeout: Duration) -> io::Result<ReadOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.firmware.state.dead.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }
            if let Some(line) = self.firmware.state.inbound.lock().pop_front() {
                return Ok(ReadOutcome::Line(line));
            }
            if Instant::now() >= deadline {
                return Ok(ReadOutcome::Timeout);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn is_data_available(&mut self) -> io::Result<bool> {
        Ok(!self.firmware.state.inbound.lock().is_empty())
    }
}

struct FakeWriter {
    firmware: FakeFirmware,
}

impl LinkWriter for FakeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let state = &self.firmware.state;
        if state.dead.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        let failing = state
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }
        self.firmware.receive(&String::from_utf8_lossy(data));
        Ok(())
    }

    fn assert_reset(&mut self) -> io::Result<()> {
        self.firmware.state.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that remembers what it was shown
#[derive(Clone, Default)]
pub struct Recorder {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|l| l.contains(needle))
    }
}

impl MessageSink for Recorder {
    fn show(&self, text: &str) {
        self.lines.lock().push(text.to_string());
    }
}

/// Timing tightened so tests run fast
pub fn test_config() -> TransportConfig {
    TransportConfig {
        poll_interval: Duration::from_millis(1),
        retry_backoff: Duration::from_millis(1),
        ack_stall_warning: Duration::from_secs(2),
        ..TransportConfig::default()
    }
}

pub struct Harness {
    pub firmware: FakeFirmware,
    pub session: Session,
    pub info: Recorder,
    pub status: Recorder,
}

pub fn harness(mode: AckMode) -> Harness {
    harness_with(mode, test_config())
}

pub fn harness_with(mode: AckMode, config: TransportConfig) -> Harness {
    let firmware = FakeFirmware::new(mode);
    let info = Recorder::default();
    let status = Recorder::default();
    let session = Session::new(
        firmware.connector(),
        ConnectionParams::new("/dev/fake0", 250_000),
        config,
        Sinks::new(Arc::new(info.clone()), Arc::new(status.clone())),
    );
    Harness {
        firmware,
        session,
        info,
        status,
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
