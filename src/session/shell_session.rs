//! Interactive shell session bound to one channel
//!
//! A session reads lines from its channel, hands every non-empty line to
//! the [`CommandRouter`] and writes the result back. It ends on `exit`,
//! end of stream, cancellation or an unrecovered fault, and closes its
//! channel exactly once on the way out.
//!
//! Cancellation is checked at the top of each iteration, before the
//! blocking read. A read that is already waiting is not interrupted, so a
//! cancelled session only stops once its current read returns. The
//! separate abort token set with [`ShellSession::with_abort`] does interrupt
//! a waiting read; the server uses it to force sessions down once its
//! shutdown grace period has passed.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::terminal::{Terminal, TerminalError, format_command_error};
use crate::transport::Channel;

use super::command_router::{CommandContext, CommandRouter, DispatchError};

/// Input line that ends the session
pub const EXIT_COMMAND: &str = "exit";

/// Session state tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Started,
    Reading,
    Dispatching,
    Terminated,
}

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub prompt: String,
    pub width: u16,
    pub height: u16,
    /// Consecutive failed reads tolerated before the stream is treated as
    /// broken. Zero disables the limit.
    pub max_consecutive_read_errors: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prompt: "> ".to_string(),
            width: 80,
            height: 24,
            max_consecutive_read_errors: 16,
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            prompt: config.prompt.clone(),
            width: config.terminal.width,
            height: config.terminal.height,
            max_consecutive_read_errors: config.max_consecutive_read_errors,
        }
    }
}

/// Session statistics for monitoring
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub started_at: DateTime<Utc>,
    pub lines_read: u64,
    pub commands_dispatched: u64,
    pub command_errors: u64,
    pub read_errors: u64,
}

impl Default for SessionStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            lines_read: 0,
            commands_dispatched: 0,
            command_errors: 0,
            read_errors: 0,
        }
    }
}

/// Normal reasons for a session to end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The user typed `exit`
    Exit,
    /// The channel reached end of stream
    EndOfStream,
    /// The cancellation token fired
    Cancelled,
    /// The abort token fired, interrupting a pending read
    Aborted,
}

/// Summary returned when a session ends normally
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub stats: SessionStats,
}

/// Error types for session execution
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session fault: {0}")]
    Fault(String),
}

/// Interactive session owning one channel
pub struct ShellSession<C: Channel> {
    id: u64,
    channel: C,
    router: Arc<CommandRouter>,
    terminal: Terminal,
    config: SessionConfig,
    context: CommandContext,
    abort: CancellationToken,
    state: SessionState,
    stats: SessionStats,
    closed: bool,
}

impl<C: Channel> ShellSession<C> {
    /// Create a new ShellSession
    pub fn new(
        id: u64,
        channel: C,
        router: Arc<CommandRouter>,
        config: SessionConfig,
        cancel: CancellationToken,
    ) -> Self {
        let terminal = Terminal::new(config.prompt.clone());

        Self {
            id,
            channel,
            router,
            terminal,
            config,
            context: CommandContext::new(id, cancel),
            abort: CancellationToken::new(),
            state: SessionState::Idle,
            stats: SessionStats::default(),
            closed: false,
        }
    }

    /// Set a token that stops the session even while it waits for input
    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get session statistics
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Run the session to completion.
    ///
    /// Panics raised inside the loop, including inside handlers, are caught
    /// here and reported as [`SessionError::Fault`]. The channel is closed
    /// on every path.
    pub async fn run(mut self) -> Result<SessionReport, SessionError> {
        self.start();

        let caught = AssertUnwindSafe(self.run_loop()).catch_unwind().await;
        let result = match caught {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(session = self.id, "Error in user shell: {}", message);
                Err(SessionError::Fault(message))
            }
        };

        if let Err(SessionError::Fault(message)) = &result {
            error!(session = self.id, "Session terminated by fault: {}", message);
        }

        self.close().await;
        self.state = SessionState::Terminated;

        info!(
            session = self.id,
            lines = self.stats.lines_read,
            commands = self.stats.commands_dispatched,
            errors = self.stats.command_errors,
            "User shell finished"
        );

        result.map(|outcome| SessionReport {
            outcome,
            stats: self.stats.clone(),
        })
    }

    fn start(&mut self) {
        self.terminal.set_size(self.config.width, self.config.height);
        self.context.terminal_size = self.terminal.size();
        self.state = SessionState::Started;
        debug!(
            session = self.id,
            width = self.context.terminal_size.width,
            height = self.context.terminal_size.height,
            "User shell started"
        );
    }

    async fn run_loop(&mut self) -> Result<SessionOutcome, SessionError> {
        let mut consecutive_read_errors = 0u32;

        loop {
            if self.context.is_cancelled() {
                debug!(session = self.id, "Session cancelled");
                return Ok(SessionOutcome::Cancelled);
            }

            self.state = SessionState::Reading;
            let read = tokio::select! {
                biased;
                _ = self.abort.cancelled() => {
                    debug!(session = self.id, "Session aborted");
                    return Ok(SessionOutcome::Aborted);
                }
                read = self.terminal.read_line(&mut self.channel) => read,
            };
            let line = match read {
                Ok(line) => {
                    consecutive_read_errors = 0;
                    line
                }
                Err(TerminalError::EndOfStream) => {
                    debug!(session = self.id, "Terminal reached end of stream");
                    return Ok(SessionOutcome::EndOfStream);
                }
                Err(e) => {
                    self.stats.read_errors += 1;
                    consecutive_read_errors += 1;
                    warn!(session = self.id, "Error reading from terminal: {}", e);

                    let limit = self.config.max_consecutive_read_errors;
                    if limit > 0 && consecutive_read_errors >= limit {
                        return Err(SessionError::Fault(format!(
                            "{} consecutive read errors, last: {}",
                            consecutive_read_errors, e
                        )));
                    }
                    continue;
                }
            };

            self.stats.lines_read += 1;

            if line == EXIT_COMMAND {
                debug!(session = self.id, "Exit requested");
                return Ok(SessionOutcome::Exit);
            }
            if line.is_empty() {
                continue;
            }

            self.state = SessionState::Dispatching;
            debug!(session = self.id, "Terminal input: {}", line);
            self.stats.commands_dispatched += 1;

            match self.router.execute(&self.context, &line).await {
                Ok(payload) if payload.is_empty() => {}
                Ok(payload) => self.send_result(&payload).await,
                Err(e) => {
                    self.stats.command_errors += 1;
                    self.send_error(&e).await;
                }
            }
        }
    }

    /// Write a command payload followed by the line terminator
    async fn send_result(&mut self, payload: &[u8]) {
        if let Err(e) = self.channel.write(payload).await {
            error!(session = self.id, "Error writing to channel: {}", e);
        }
        if let Err(e) = self.terminal.write_terminator(&mut self.channel).await {
            error!(session = self.id, "Error writing to terminal: {}", e);
        }
    }

    /// Write a highlighted error to the error stream and end the line on
    /// the primary stream
    async fn send_error(&mut self, err: &DispatchError) {
        let message = format_command_error(&err.to_string());
        if let Err(e) = self.channel.write_stderr(message.as_bytes()).await {
            error!(session = self.id, "Error writing to stderr: {}", e);
        }
        if let Err(e) = self.terminal.write_terminator(&mut self.channel).await {
            error!(session = self.id, "Error writing to channel: {}", e);
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = self.channel.close().await {
            error!(session = self.id, "Error closing channel: {}", e);
        }
    }
}

impl<C: Channel> Drop for ShellSession<C> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(session = self.id, "ShellSession dropped without closing its channel");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
