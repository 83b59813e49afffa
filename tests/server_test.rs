//! TCP server tests over a loopback socket

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use shellgate::server::{ServerConfig, ShellServer};
use shellgate::session::{CommandRegistryBuilder, CommandRouter, SessionConfig};

fn test_config() -> ServerConfig {
    ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        max_sessions: 4,
        shutdown_grace: Duration::from_millis(100),
        session: SessionConfig::default(),
    }
}

#[tokio::test]
async fn test_tcp_session_round_trip() -> Result<()> {
    let server = ShellServer::bind(test_config(), Arc::new(CommandRouter::with_builtins())).await?;
    let addr = server.local_addr()?;
    let shutdown = server.shutdown_token();
    let server_task = tokio::spawn(server.run());

    let mut client = TcpStream::connect(addr).await?;
    client.write_all(b"echo hi there\r\nbogus\r\n\r\nexit\r\n").await?;

    let mut output = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut output)).await??;
    let output = String::from_utf8_lossy(&output);

    assert!(output.starts_with("> "));
    assert!(output.contains("echo: hi there\r\n"));
    assert!(output.contains("Error executing command:\r\n\tcommand not found: bogus"));

    shutdown.cancel();
    timeout(Duration::from_secs(5), server_task).await???;

    Ok(())
}

#[tokio::test]
async fn test_concurrent_connections() -> Result<()> {
    let server = ShellServer::bind(test_config(), Arc::new(CommandRouter::with_builtins())).await?;
    let addr = server.local_addr()?;
    let shutdown = server.shutdown_token();
    let server_task = tokio::spawn(server.run());

    let mut clients = Vec::new();
    for i in 0..3 {
        clients.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await?;
            client
                .write_all(format!("echo client {}\r\nexit\r\n", i).as_bytes())
                .await?;
            let mut output = String::new();
            client.read_to_string(&mut output).await?;
            anyhow::Ok((i, output))
        }));
    }

    for client in clients {
        let (i, output) = timeout(Duration::from_secs(5), client).await???;
        assert!(output.contains(&format!("echo: client {}", i)));
    }

    shutdown.cancel();
    timeout(Duration::from_secs(5), server_task).await???;

    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_idle_sessions_after_grace() -> Result<()> {
    let server = ShellServer::bind(test_config(), Arc::new(CommandRouter::with_builtins())).await?;
    let addr = server.local_addr()?;
    let shutdown = server.shutdown_token();
    let server_task = tokio::spawn(server.run());

    // An idle client keeps its session blocked on a read
    let mut client = TcpStream::connect(addr).await?;
    let mut prompt = [0u8; 2];
    timeout(Duration::from_secs(5), client.read_exact(&mut prompt)).await??;
    assert_eq!(&prompt, b"> ");

    shutdown.cancel();
    timeout(Duration::from_secs(5), server_task).await???;

    // The aborted session closed its socket
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await??;
    assert!(rest.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_shutdown_drops_sessions_stuck_in_a_handler() -> Result<()> {
    let registry = CommandRegistryBuilder::with_builtins()
        .register("hang", HangForever)?
        .build();
    let server = ShellServer::bind(test_config(), Arc::new(CommandRouter::new(registry))).await?;
    let addr = server.local_addr()?;
    let shutdown = server.shutdown_token();
    let server_task = tokio::spawn(server.run());

    let mut client = TcpStream::connect(addr).await?;
    client.write_all(b"hang\r\n").await?;
    let mut prompt = [0u8; 2];
    timeout(Duration::from_secs(5), client.read_exact(&mut prompt)).await??;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Neither cancellation nor abort reaches the handler; the server still stops
    shutdown.cancel();
    timeout(Duration::from_secs(5), server_task).await???;

    Ok(())
}

struct HangForever;

#[async_trait::async_trait]
impl shellgate::session::CommandHandler for HangForever {
    async fn call(
        &self,
        _ctx: &shellgate::session::CommandContext,
        _args: &[String],
    ) -> Result<Vec<u8>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_bind_failure_is_reported() -> Result<()> {
    let first = ShellServer::bind(test_config(), Arc::new(CommandRouter::with_builtins())).await?;
    let taken = first.local_addr()?;

    let mut config = test_config();
    config.listen_addr = taken.to_string();
    let err = ShellServer::bind(config, Arc::new(CommandRouter::with_builtins()))
        .await
        .err()
        .expect("second bind should fail");
    assert!(err.to_string().contains(&taken.to_string()));

    Ok(())
}
