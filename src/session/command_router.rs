//! Command Router for interactive command processing
//!
//! The registry maps command names to handlers and is frozen once built,
//! so a single router can be shared between any number of sessions
//! without locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::terminal::{LINE_TERMINATOR, TerminalSize};

/// Execution context passed to every handler
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Identifier of the session issuing the command
    pub session_id: u64,
    /// Cancellation signal of the owning session. Long-running handlers
    /// should observe it; the session loop cannot preempt them.
    pub cancel: CancellationToken,
    /// Display geometry of the session terminal, for handlers that lay out
    /// their output
    pub terminal_size: TerminalSize,
}

impl CommandContext {
    /// Create a new CommandContext
    pub fn new(session_id: u64, cancel: CancellationToken) -> Self {
        Self {
            session_id,
            cancel,
            terminal_size: TerminalSize::default(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Behaviour of a single command
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command. The returned payload is written to the caller as is.
    async fn call(&self, ctx: &CommandContext, args: &[String]) -> Result<Vec<u8>>;
}

/// Adapter turning a synchronous closure into a [`CommandHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> CommandHandler for FnHandler<F>
where
    F: Fn(&CommandContext, &[String]) -> Result<Vec<u8>> + Send + Sync,
{
    async fn call(&self, ctx: &CommandContext, args: &[String]) -> Result<Vec<u8>> {
        (self.0)(ctx, args)
    }
}

/// Error types for command dispatch
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// Error types for registry construction
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command already registered: {0}")]
    DuplicateCommand(String),
    #[error("invalid command name: {0:?}")]
    InvalidName(String),
}

/// Immutable mapping from command name to handler
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    /// Start building a registry
    pub fn builder() -> CommandRegistryBuilder {
        CommandRegistryBuilder::default()
    }

    /// Look up a handler by exact name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.commands.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder collecting commands before the registry is frozen
#[derive(Default)]
pub struct CommandRegistryBuilder {
    commands: BTreeMap<String, Arc<dyn CommandHandler>>,
    with_help: bool,
}

impl CommandRegistryBuilder {
    /// Builder preloaded with `echo`; `help` is added on build
    pub fn with_builtins() -> Self {
        let builder = Self {
            commands: BTreeMap::new(),
            with_help: true,
        };
        builder.insert("echo", Arc::new(FnHandler(echo)))
    }

    /// Register a handler under `name`
    pub fn register<H>(self, name: impl Into<String>, handler: H) -> Result<Self, RegistryError>
    where
        H: CommandHandler + 'static,
    {
        let name = name.into();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(RegistryError::InvalidName(name));
        }
        if self.commands.contains_key(&name) {
            return Err(RegistryError::DuplicateCommand(name));
        }
        Ok(self.insert(name, Arc::new(handler)))
    }

    /// Register a synchronous closure under `name`
    pub fn register_fn<F>(self, name: impl Into<String>, f: F) -> Result<Self, RegistryError>
    where
        F: Fn(&CommandContext, &[String]) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.register(name, FnHandler(f))
    }

    /// Freeze the registry
    pub fn build(mut self) -> CommandRegistry {
        if self.with_help && !self.commands.contains_key("help") {
            let mut names: Vec<String> = self.commands.keys().cloned().collect();
            names.push("help".to_string());
            names.sort();
            self.commands
                .insert("help".to_string(), Arc::new(HelpCommand { names }));
        }

        CommandRegistry {
            commands: self.commands,
        }
    }

    fn insert(mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) -> Self {
        self.commands.insert(name.into(), handler);
        self
    }
}

/// Command router resolving input lines against a registry
#[derive(Debug, Clone)]
pub struct CommandRouter {
    registry: CommandRegistry,
}

impl CommandRouter {
    /// Create a new CommandRouter
    pub fn new(registry: CommandRegistry) -> Self {
        Self { registry }
    }

    /// Router with the built-in commands only
    pub fn with_builtins() -> Self {
        Self::new(CommandRegistryBuilder::with_builtins().build())
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Resolve the first token of `line` and run the matching handler.
    ///
    /// The handler's result is returned unchanged; an unknown name never
    /// reaches any handler.
    pub async fn execute(
        &self,
        ctx: &CommandContext,
        line: &str,
    ) -> Result<Vec<u8>, DispatchError> {
        debug!(session = ctx.session_id, "Executing command: {}", line);

        let (name, args) = split_command_line(line);
        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| DispatchError::CommandNotFound(name.to_string()))?;

        Ok(handler.call(ctx, &args).await?)
    }
}

/// Split a line into command name and arguments.
///
/// Every whitespace character separates tokens, so runs of whitespace
/// produce empty arguments. Quoting is not supported.
pub fn split_command_line(line: &str) -> (&str, Vec<String>) {
    let mut parts = line.split(char::is_whitespace);
    let name = parts.next().unwrap_or_default();
    let args = parts.map(str::to_string).collect();
    (name, args)
}

fn echo(_ctx: &CommandContext, args: &[String]) -> Result<Vec<u8>> {
    Ok(format!("echo: {}", args.join(" ")).into_bytes())
}

struct HelpCommand {
    names: Vec<String>,
}

#[async_trait]
impl CommandHandler for HelpCommand {
    async fn call(&self, _ctx: &CommandContext, _args: &[String]) -> Result<Vec<u8>> {
        Ok(self.names.join(LINE_TERMINATOR).into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ctx() -> CommandContext {
        CommandContext::new(1, CancellationToken::new())
    }

    /// Handler recording every argument list it receives
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl CommandHandler for Recorder {
        async fn call(&self, _ctx: &CommandContext, args: &[String]) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(args.to_vec());
            Ok(b"recorded".to_vec())
        }
    }

    #[tokio::test]
    async fn test_echo_joins_arguments() {
        let router = CommandRouter::with_builtins();
        let payload = router.execute(&ctx(), "echo a b c").await.unwrap();
        assert_eq!(payload, b"echo: a b c");
    }

    #[tokio::test]
    async fn test_echo_without_arguments() {
        let router = CommandRouter::with_builtins();
        let payload = router.execute(&ctx(), "echo").await.unwrap();
        assert_eq!(payload, b"echo: ");
    }

    #[tokio::test]
    async fn test_unknown_command_is_not_found() {
        let recorder = Recorder::default();
        let registry = CommandRegistry::builder()
            .register("record", recorder.clone())
            .unwrap()
            .build();
        let router = CommandRouter::new(registry);

        let err = router.execute(&ctx(), "bogus record").await.unwrap_err();
        assert!(matches!(err, DispatchError::CommandNotFound(ref name) if name == "bogus"));
        assert!(err.to_string().contains("command not found"));
        assert!(recorder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_invokes_only_matching_handler() {
        let first = Recorder::default();
        let second = Recorder::default();
        let registry = CommandRegistry::builder()
            .register("first", first.clone())
            .unwrap()
            .register("second", second.clone())
            .unwrap()
            .build();
        let router = CommandRouter::new(registry);

        let payload = router.execute(&ctx(), "second x y").await.unwrap();
        assert_eq!(payload, b"recorded");
        assert!(first.calls.lock().unwrap().is_empty());
        assert_eq!(
            *second.calls.lock().unwrap(),
            vec![vec!["x".to_string(), "y".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_name_match_is_exact() {
        let router = CommandRouter::with_builtins();
        assert!(matches!(
            router.execute(&ctx(), "ECHO hi").await,
            Err(DispatchError::CommandNotFound(_))
        ));
        assert!(matches!(
            router.execute(&ctx(), "echoo hi").await,
            Err(DispatchError::CommandNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_error_is_propagated_verbatim() {
        let registry = CommandRegistry::builder()
            .register_fn("fail", |_, _| Err(anyhow::anyhow!("disk on fire")))
            .unwrap()
            .build();
        let router = CommandRouter::new(registry);

        let err = router.execute(&ctx(), "fail").await.unwrap_err();
        assert!(matches!(err, DispatchError::Handler(_)));
        assert_eq!(err.to_string(), "disk on fire");
    }

    #[tokio::test]
    async fn test_help_lists_registered_commands() {
        let registry = CommandRegistryBuilder::with_builtins()
            .register_fn("status", |_, _| Ok(Vec::new()))
            .unwrap()
            .build();
        let router = CommandRouter::new(registry);

        let payload = router.execute(&ctx(), "help").await.unwrap();
        assert_eq!(payload, b"echo\r\nhelp\r\nstatus");
    }

    #[tokio::test]
    async fn test_handler_sees_session_context() {
        let registry = CommandRegistry::builder()
            .register_fn("whoami", |ctx, _| {
                Ok(format!("{}:{}", ctx.session_id, ctx.is_cancelled()).into_bytes())
            })
            .unwrap()
            .build();
        let router = CommandRouter::new(registry);

        let token = CancellationToken::new();
        token.cancel();
        let ctx = CommandContext::new(7, token);
        assert_eq!(router.execute(&ctx, "whoami").await.unwrap(), b"7:true");
    }

    #[test]
    fn test_split_keeps_empty_tokens() {
        let (name, args) = split_command_line("echo  a   b");
        assert_eq!(name, "echo");
        assert_eq!(args, vec!["", "a", "", "", "b"]);

        let (name, args) = split_command_line("echo\ta");
        assert_eq!(name, "echo");
        assert_eq!(args, vec!["a"]);

        let (name, args) = split_command_line(" echo");
        assert_eq!(name, "");
        assert_eq!(args, vec!["echo"]);
    }

    #[test]
    fn test_split_has_no_quoting() {
        let (_, args) = split_command_line("echo \"a b\"");
        assert_eq!(args, vec!["\"a", "b\""]);
    }

    #[test]
    fn test_registry_rejects_duplicates_and_bad_names() {
        let err = CommandRegistryBuilder::with_builtins()
            .register_fn("echo", |_, _| Ok(Vec::new()))
            .err();
        assert_eq!(err, Some(RegistryError::DuplicateCommand("echo".to_string())));

        let err = CommandRegistry::builder()
            .register_fn("two words", |_, _| Ok(Vec::new()))
            .err();
        assert_eq!(err, Some(RegistryError::InvalidName("two words".to_string())));

        let err = CommandRegistry::builder()
            .register_fn("", |_, _| Ok(Vec::new()))
            .err();
        assert_eq!(err, Some(RegistryError::InvalidName(String::new())));
    }

    #[test]
    fn test_builtin_registry_contents() {
        let router = CommandRouter::with_builtins();
        assert_eq!(router.registry().names(), vec!["echo", "help"]);
        assert!(router.registry().contains("echo"));
        assert!(!CommandRegistry::builder().build().contains("help"));
    }
}
