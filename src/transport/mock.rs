//! In-memory channel for driving sessions in tests
//!
//! Input is fed through a [`MockChannelHandle`]; every write and close is
//! recorded so callers can inspect exactly what a session produced.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Channel;

/// Scripted input item
#[derive(Debug, Clone)]
pub enum MockInput {
    Data(Vec<u8>),
    Error(io::ErrorKind),
}

/// Recorded output item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockWrite {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

#[derive(Debug, Default)]
struct MockLog {
    writes: Vec<MockWrite>,
    close_count: usize,
}

/// Mock channel handed to a session
pub struct MockChannel {
    input_rx: mpsc::UnboundedReceiver<MockInput>,
    leftover: Vec<u8>,
    log: Arc<Mutex<MockLog>>,
}

/// Test-side handle for feeding input and inspecting output
#[derive(Clone)]
pub struct MockChannelHandle {
    input_tx: Option<mpsc::UnboundedSender<MockInput>>,
    log: Arc<Mutex<MockLog>>,
}

impl MockChannel {
    /// Create an open channel; reads block until input is sent or the
    /// handle finishes the stream.
    pub fn new() -> (Self, MockChannelHandle) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let log = Arc::new(Mutex::new(MockLog::default()));

        let channel = Self {
            input_rx,
            leftover: Vec::new(),
            log: log.clone(),
        };
        let handle = MockChannelHandle {
            input_tx: Some(input_tx),
            log,
        };

        (channel, handle)
    }

    /// Create a channel preloaded with CRLF-terminated lines followed by
    /// end of stream.
    pub fn scripted<S: AsRef<str>>(lines: &[S]) -> (Self, MockChannelHandle) {
        let (channel, mut handle) = Self::new();
        for line in lines {
            handle.send_line(line.as_ref());
        }
        handle.finish();
        (channel, handle)
    }

    fn record(&self, write: MockWrite) -> io::Result<()> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if log.close_count > 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write on closed mock channel",
            ));
        }
        log.writes.push(write);
        Ok(())
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.input_rx.recv().await {
                Some(MockInput::Data(data)) => self.leftover = data,
                Some(MockInput::Error(kind)) => {
                    return Err(io::Error::new(kind, "mock read failure"));
                }
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.record(MockWrite::Stdout(data.to_vec()))
    }

    async fn write_stderr(&mut self, data: &[u8]) -> io::Result<()> {
        self.record(MockWrite::Stderr(data.to_vec()))
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.close_count += 1;
        Ok(())
    }
}

impl MockChannelHandle {
    /// Send a line terminated with CRLF
    pub fn send_line(&self, line: &str) {
        self.send_bytes(format!("{}\r\n", line).into_bytes());
    }

    /// Send raw bytes
    pub fn send_bytes(&self, data: impl Into<Vec<u8>>) {
        self.send(MockInput::Data(data.into()));
    }

    /// Make the next read fail with the given error kind
    pub fn send_error(&self, kind: io::ErrorKind) {
        self.send(MockInput::Error(kind));
    }

    /// End the input stream once pending input is consumed
    pub fn finish(&mut self) {
        self.input_tx.take();
    }

    fn send(&self, input: MockInput) {
        if let Some(input_tx) = &self.input_tx {
            // A dropped receiver means the session already ended.
            let _ = input_tx.send(input);
        }
    }

    /// All recorded writes, in order
    pub fn writes(&self) -> Vec<MockWrite> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .writes
            .clone()
    }

    /// Concatenated primary-stream output
    pub fn stdout_text(&self) -> String {
        self.collect_text(|write| match write {
            MockWrite::Stdout(data) => Some(data),
            MockWrite::Stderr(_) => None,
        })
    }

    /// Concatenated error-stream output
    pub fn stderr_text(&self) -> String {
        self.collect_text(|write| match write {
            MockWrite::Stderr(data) => Some(data),
            MockWrite::Stdout(_) => None,
        })
    }

    /// Number of times the channel was closed
    pub fn close_count(&self) -> usize {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close_count
    }

    fn collect_text<F>(&self, select: F) -> String
    where
        F: Fn(&MockWrite) -> Option<&Vec<u8>>,
    {
        let bytes: Vec<u8> = self
            .writes()
            .iter()
            .filter_map(|write| select(write).cloned())
            .flatten()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
