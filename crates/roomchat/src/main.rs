//! # roomchat
//!
//! Relay binary: loads settings, starts the HTTP/WebSocket server, and mints
//! development tokens.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use roomchat_core::auth::TokenVerifier;
use roomchat_core::ids::RoomScope;
use roomchat_core::protocol::TokenGrant;
use roomchat_server::config::ServerConfig;
use roomchat_server::server::RoomchatServer;
use roomchat_settings::RoomchatSettings;
use secrecy::SecretString;

/// Per-room authenticated WebSocket relay.
#[derive(Parser, Debug)]
#[command(name = "roomchat", about = "Per-room authenticated WebSocket relay")]
struct Cli {
    /// Settings file (defaults to `ROOMCHAT_CONFIG` or `~/.roomchat/settings.json`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay server.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (overrides settings, 0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print a token grant for a room member (local development).
    Sign {
        /// Decision identifier.
        #[arg(long)]
        decision: String,

        /// Vertical key.
        #[arg(long)]
        vertical: String,

        /// Identity to bind the token to.
        #[arg(long)]
        identity: String,

        /// Initial display name (defaults to the identity).
        #[arg(long)]
        display_name: Option<String>,
    },
}

fn load(config: Option<PathBuf>) -> Result<RoomchatSettings> {
    let path = config.unwrap_or_else(roomchat_settings::settings_path);
    roomchat_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))
}

fn secret(settings: &RoomchatSettings) -> SecretString {
    SecretString::from(settings.auth.token_secret.clone())
}

/// WebSocket URL handed to clients.
fn endpoint_url(settings: &RoomchatSettings) -> String {
    settings.auth.public_url.clone().unwrap_or_else(|| {
        format!("ws://{}:{}/ws", settings.server.host, settings.server.port)
    })
}

fn grant(
    settings: &RoomchatSettings,
    decision: &str,
    vertical: &str,
    identity: &str,
    display_name: Option<String>,
) -> Result<TokenGrant> {
    settings.validate().context("Invalid settings")?;
    let _ = RoomScope::new(decision, vertical).context("Invalid room")?;
    anyhow::ensure!(
        !identity.trim().is_empty() && !identity.contains(':'),
        "identity must be non-empty and must not contain ':'"
    );

    let token = TokenVerifier::new(secret(settings))
        .issue(decision, vertical, identity)
        .context("Failed to sign token")?;
    Ok(TokenGrant {
        subprotocol: token.encode(),
        token: token.signature,
        identity: identity.to_owned(),
        display_name: display_name.unwrap_or_else(|| identity.to_owned()),
        connection_endpoint_url: endpoint_url(settings),
    })
}

async fn serve(
    mut settings: RoomchatSettings,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    if let Some(host) = host {
        settings.server.host = host;
    }
    if let Some(port) = port {
        settings.server.port = port;
    }
    settings.validate().context("Invalid settings")?;

    roomchat_core::logging::init_subscriber(&settings.logging.level, settings.logging.format);
    let metrics = roomchat_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let config = ServerConfig::from(&settings.server);
    let server = RoomchatServer::new(config, secret(&settings)).with_metrics(metrics);
    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind server")?;

    tracing::info!("roomchat listening on ws://{addr}/ws");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let aborted = server.shutdown().graceful_shutdown(vec![handle], None).await;
    tracing::info!(aborted, "Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(cli.config)?;

    match cli.command {
        Command::Serve { host, port } => serve(settings, host, port).await,
        Command::Sign {
            decision,
            vertical,
            identity,
            display_name,
        } => {
            let grant = grant(&settings, &decision, &vertical, &identity, display_name)?;
            println!("{}", serde_json::to_string_pretty(&grant)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomchat_core::auth::{AuthToken, verify};

    fn settings() -> RoomchatSettings {
        let mut settings = RoomchatSettings::default();
        settings.auth.token_secret = "s3cret".into();
        settings
    }

    #[test]
    fn cli_serve_defaults() {
        let cli = Cli::parse_from(["roomchat", "serve"]);
        assert!(cli.config.is_none());
        let Command::Serve { host, port } = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(host, None);
        assert_eq!(port, None);
    }

    #[test]
    fn cli_serve_overrides() {
        let cli = Cli::parse_from([
            "roomchat", "serve", "--host", "0.0.0.0", "--port", "9000", "--config", "/tmp/rc.json",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/rc.json")));
        let Command::Serve { host, port } = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(host.as_deref(), Some("0.0.0.0"));
        assert_eq!(port, Some(9000));
    }

    #[test]
    fn cli_sign_requires_fields() {
        assert!(Cli::try_parse_from(["roomchat", "sign", "--decision", "d"]).is_err());
        let cli = Cli::parse_from([
            "roomchat", "sign", "--decision", "d", "--vertical", "v", "--identity", "alice",
            "--display-name", "Alice",
        ]);
        let Command::Sign { display_name, .. } = cli.command else {
            panic!("expected sign");
        };
        assert_eq!(display_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn grant_carries_verifiable_token() {
        let g = grant(&settings(), "d1", "v1", "alice", None).unwrap();
        assert_eq!(g.identity, "alice");
        assert_eq!(g.display_name, "alice");
        assert_eq!(g.connection_endpoint_url, "ws://127.0.0.1:8787/ws");
        assert!(verify("d1", "v1", "alice", &g.token, b"s3cret"));

        let decoded = AuthToken::decode(&g.subprotocol).unwrap();
        assert_eq!(decoded.signature, g.token);
        assert_eq!(decoded.decision_id, "d1");
    }

    #[test]
    fn grant_uses_public_url_and_display_name() {
        let mut s = settings();
        s.auth.public_url = Some("wss://chat.example.com/ws".into());
        let g = grant(&s, "d1", "v1", "alice", Some("Alice".into())).unwrap();
        assert_eq!(g.connection_endpoint_url, "wss://chat.example.com/ws");
        assert_eq!(g.display_name, "Alice");
    }

    #[test]
    fn grant_rejects_bad_input() {
        assert!(grant(&RoomchatSettings::default(), "d", "v", "alice", None).is_err());
        assert!(grant(&settings(), "a__b", "v", "alice", None).is_err());
        assert!(grant(&settings(), "d", "v", "al:ice", None).is_err());
        assert!(grant(&settings(), "d", "v", " ", None).is_err());
    }

    #[test]
    fn load_reads_explicit_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server":{"port":9999},"auth":{"tokenSecret":"abc"}}"#).unwrap();
        let loaded = load(Some(path)).unwrap();
        assert_eq!(loaded.server.port, 9999);
        assert_eq!(loaded.auth.token_secret, "abc");
    }
}
