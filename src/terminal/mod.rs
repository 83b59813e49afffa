//! Line-oriented terminal bound to a session channel
//!
//! Provides prompt handling, line splitting and the ANSI escapes used to
//! highlight command errors. Line editing and history are left to the
//! client.

use std::io;

use crossterm::style::{Color, ResetColor, SetForegroundColor};
use tracing::debug;

use crate::transport::Channel;

/// Line terminator written after command output
pub const LINE_TERMINATOR: &str = "\r\n";

/// End-of-transmission (Ctrl-D)
const CTRL_D: u8 = 0x04;

const READ_CHUNK: usize = 1024;

/// Longest accepted input line in bytes, terminator excluded
pub const MAX_LINE_LENGTH: usize = 4096;

/// Error types for terminal reads
#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("end of stream")]
    EndOfStream,
    #[error("input is not valid UTF-8")]
    InvalidUtf8,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Terminal display geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// Line reader and writer state for one session
#[derive(Debug)]
pub struct Terminal {
    prompt: String,
    size: TerminalSize,
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no terminator
    scanned: usize,
    skip_lf: bool,
    /// Dropping the rest of an overlong line up to its terminator
    discarding: bool,
}

impl Terminal {
    /// Create a new Terminal with the given prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            size: TerminalSize::default(),
            pending: Vec::new(),
            scanned: 0,
            skip_lf: false,
            discarding: false,
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn size(&self) -> TerminalSize {
        self.size
    }

    /// Set the display geometry
    pub fn set_size(&mut self, width: u16, height: u16) {
        debug!("Terminal size set to {}x{}", width, height);
        self.size = TerminalSize { width, height };
    }

    /// Write the prompt and read one line from the channel.
    ///
    /// `\r`, `\n` and `\r\n` all end a line. Ctrl-D on an empty line and a
    /// closed stream with no buffered input both yield
    /// [`TerminalError::EndOfStream`]. A trailing partial line is returned
    /// before end of stream is reported.
    ///
    /// A line longer than [`MAX_LINE_LENGTH`] yields
    /// [`TerminalError::LineTooLong`] once; its remaining bytes are dropped
    /// up to the next terminator and reading resumes with the line after.
    pub async fn read_line<C>(&mut self, channel: &mut C) -> Result<String, TerminalError>
    where
        C: Channel + ?Sized,
    {
        if !self.prompt.is_empty() {
            channel.write(self.prompt.as_bytes()).await?;
        }

        let mut buf = [0u8; READ_CHUNK];
        loop {
            if let Some(line) = self.take_line()? {
                return Ok(line);
            }

            let n = match channel.read(&mut buf).await {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => 0,
                Err(e) => return Err(e.into()),
            };

            if n == 0 {
                if self.pending.is_empty() {
                    return Err(TerminalError::EndOfStream);
                }
                self.scanned = 0;
                let rest = std::mem::take(&mut self.pending);
                return String::from_utf8(rest).map_err(|_| TerminalError::InvalidUtf8);
            }

            self.pending.extend_from_slice(&buf[..n]);
        }
    }

    /// Write the line terminator to the primary stream
    pub async fn write_terminator<C>(&self, channel: &mut C) -> io::Result<()>
    where
        C: Channel + ?Sized,
    {
        channel.write(LINE_TERMINATOR.as_bytes()).await
    }

    /// Split the next complete line off the pending buffer
    fn take_line(&mut self) -> Result<Option<String>, TerminalError> {
        loop {
            if self.skip_lf {
                match self.pending.first() {
                    Some(b'\n') => {
                        self.pending.remove(0);
                        self.skip_lf = false;
                    }
                    Some(_) => self.skip_lf = false,
                    None => {}
                }
            }

            if self.discarding {
                match self.pending.iter().position(|b| matches!(*b, b'\r' | b'\n')) {
                    Some(pos) => {
                        self.skip_lf = self.pending[pos] == b'\r';
                        self.pending.drain(..=pos);
                        self.scanned = 0;
                        self.discarding = false;
                        continue;
                    }
                    None => {
                        self.pending.clear();
                        self.scanned = 0;
                        return Ok(None);
                    }
                }
            }

            let found = self.pending[self.scanned..]
                .iter()
                .position(|b| matches!(*b, b'\r' | b'\n' | CTRL_D))
                .map(|offset| self.scanned + offset);

            let Some(pos) = found else {
                if self.pending.len() > MAX_LINE_LENGTH {
                    debug!("Dropping input line over {} bytes", MAX_LINE_LENGTH);
                    self.pending.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Err(TerminalError::LineTooLong(MAX_LINE_LENGTH));
                }
                self.scanned = self.pending.len();
                return Ok(None);
            };

            let terminator = self.pending[pos];
            if terminator == CTRL_D {
                self.pending.remove(pos);
                self.scanned = pos;
                if pos == 0 {
                    return Err(TerminalError::EndOfStream);
                }
                // Ctrl-D inside a line is ignored
                continue;
            }

            let line: Vec<u8> = self.pending.drain(..=pos).take(pos).collect();
            self.scanned = 0;
            self.skip_lf = terminator == b'\r';

            if line.len() > MAX_LINE_LENGTH {
                return Err(TerminalError::LineTooLong(MAX_LINE_LENGTH));
            }

            return String::from_utf8(line)
                .map(Some)
                .map_err(|_| TerminalError::InvalidUtf8);
        }
    }
}

/// Format a command error for the error stream, highlighted in red
pub fn format_command_error(message: &str) -> String {
    format!(
        "{}Error executing command:{}\t{}{}",
        SetForegroundColor(Color::Red),
        LINE_TERMINATOR,
        message,
        ResetColor
    )
}
