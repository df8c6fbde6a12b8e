//! API client
//!
//! Command-line front end over the shared auth context:
//! 1. Loads configuration and the stored credential pair
//! 2. Runs one command (login, authenticated call, logout, ...)
//! 3. Refreshes the access token transparently when the server answers 401
//!
//! Results go to stdout as JSON; logs go to stderr.

mod config;
mod error;

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use auth_pipeline::{AuthContext, AuthState, RequestOptions};
use serde_json::{Value, json};
use token_store::{AuthEventKind, FileStorage, TokenStorage};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

/// A parsed command line.
#[derive(Debug, PartialEq)]
enum Command {
    Login { username: String },
    Register { payload: Value },
    Logout,
    Status,
    Get { endpoint: String },
    Post { endpoint: String, body: Value },
    Delete { endpoint: String },
    Watch,
}

/// Split `--config <path>` out of the arguments (program name excluded).
fn split_config_flag(args: &[String]) -> (Option<&str>, Vec<&str>) {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            config = iter.next().map(String::as_str);
        } else {
            rest.push(arg.as_str());
        }
    }
    (config, rest)
}

fn parse_json(raw: &str) -> error::Result<Value> {
    serde_json::from_str(raw).map_err(|e| error::Error::InvalidJson(e.to_string()))
}

fn parse_command(args: &[&str]) -> error::Result<Command> {
    let usage = |message: &str| error::Error::Usage(message.to_string());
    match args {
        ["login", username] => Ok(Command::Login {
            username: username.to_string(),
        }),
        ["register", payload] => Ok(Command::Register {
            payload: parse_json(payload)?,
        }),
        ["logout"] => Ok(Command::Logout),
        ["status"] => Ok(Command::Status),
        ["get", endpoint] => Ok(Command::Get {
            endpoint: endpoint.to_string(),
        }),
        ["post", endpoint, body] => Ok(Command::Post {
            endpoint: endpoint.to_string(),
            body: parse_json(body)?,
        }),
        ["delete", endpoint] => Ok(Command::Delete {
            endpoint: endpoint.to_string(),
        }),
        ["watch"] => Ok(Command::Watch),
        [] => Err(usage("missing command")),
        [
            cmd @ ("login" | "register" | "logout" | "status" | "get" | "post" | "delete"
            | "watch"),
            ..,
        ] => Err(usage(&format!("wrong number of arguments for {cmd}"))),
        [other, ..] => Err(usage(&format!("unknown command: {other}"))),
    }
}

/// Password from `API_PASSWORD`, else the first line of stdin.
fn read_password() -> error::Result<String> {
    if let Ok(password) = std::env::var("API_PASSWORD") {
        return Ok(password);
    }
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|_| error::Error::MissingPassword)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        return Err(error::Error::MissingPassword);
    }
    Ok(password)
}

fn state_name(state: AuthState) -> &'static str {
    match state {
        AuthState::Unauthenticated => "unauthenticated",
        AuthState::Authenticated => "authenticated",
        AuthState::Refreshing => "refreshing",
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render response")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cli_config_path, rest) = split_config_flag(&args);
    let command = parse_command(&rest)?;

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        base_url = %config.api.base_url,
        storage = %config.storage.path.display(),
        "configuration loaded"
    );

    let storage: Arc<dyn TokenStorage> = Arc::new(FileStorage::new(config.storage.path.clone()));
    let context = AuthContext::new(config.api.clone(), storage)
        .await
        .context("failed to initialize auth context")?;

    context
        .events()
        .subscribe(AuthEventKind::Unauthorized, |event| {
            warn!(reason = %event.payload["reason"], "session ended, log in again");
            Ok(())
        });

    run(command, &context, &config).await
}

async fn run(command: Command, context: &AuthContext, config: &Config) -> Result<()> {
    match command {
        Command::Login { username } => {
            let password = read_password()?;
            let user = context
                .login(&username, &password)
                .await
                .with_context(|| format!("login failed for {username}"))?;
            print_json(&user)
        }
        Command::Register { payload } => {
            let user = context
                .register(payload)
                .await
                .context("registration failed")?;
            print_json(&user)
        }
        Command::Logout => {
            context.logout().await.context("logout failed")?;
            print_json(&json!({ "state": "unauthenticated" }))
        }
        Command::Status => {
            let state = context.auth_state().await;
            let access_valid = context.store().valid_access_token().await.is_some();
            print_json(&json!({
                "state": state_name(state),
                "access_token_valid": access_valid,
                "storage": config.storage.path.display().to_string(),
            }))
        }
        Command::Get { endpoint } => {
            let value = context
                .request(&endpoint, RequestOptions::get())
                .await
                .with_context(|| format!("GET {endpoint} failed"))?;
            print_json(&value)
        }
        Command::Post { endpoint, body } => {
            let value = context
                .request(&endpoint, RequestOptions::post(body))
                .await
                .with_context(|| format!("POST {endpoint} failed"))?;
            print_json(&value)
        }
        Command::Delete { endpoint } => {
            let value = context
                .request(&endpoint, RequestOptions::delete())
                .await
                .with_context(|| format!("DELETE {endpoint} failed"))?;
            print_json(&value)
        }
        Command::Watch => watch(context, config).await,
    }
}

/// Print every auth event, including ones caused by other processes
/// sharing the token file, until Ctrl-C.
async fn watch(context: &AuthContext, config: &Config) -> Result<()> {
    for kind in [
        AuthEventKind::Login,
        AuthEventKind::Logout,
        AuthEventKind::TokenRefresh,
        AuthEventKind::Unauthorized,
    ] {
        context.events().subscribe(kind, |event| {
            let line = json!({ "event": event.kind.as_str(), "payload": event.payload });
            println!("{line}");
            Ok(())
        });
    }

    let (mode, sync) = context.spawn_sync(config.storage.poll_interval());
    info!(?mode, "watching credential storage");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    sync.abort();
    info!("watch stopped");
    Ok(())
}
