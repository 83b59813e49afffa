//! Interactive session module
//!
//! This module provides the core components for serving interactive shell
//! sessions: the command registry and router, and the per-channel session
//! loop that drives them.

pub mod command_router;
pub mod shell_session;

pub use command_router::{
    CommandContext, CommandHandler, CommandRegistry, CommandRegistryBuilder, CommandRouter,
    DispatchError, FnHandler, RegistryError,
};
pub use shell_session::{
    SessionConfig, SessionError, SessionOutcome, SessionReport, SessionState, SessionStats,
    ShellSession,
};
