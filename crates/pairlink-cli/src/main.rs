//! pairlink - pair this device with a web session by scanning its QR code.
//!
//! A thin front end over `pairlink-core`: it feeds scanned payloads into the
//! pairing state machine and prints the states a mobile screen would render.

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Method;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pairlink_core::{
    AuthState, Config, CredentialStore, Gateway, PairingClient, PairingMachine, ScanOutcome,
};

#[derive(Debug, Parser)]
#[command(name = "pairlink", version, about = "Pair this device with a web session via QR code")]
struct Cli {
    /// Name shown for this device in the web application
    #[arg(long, global = true, env = "PAIRLINK_DEVICE_NAME")]
    device_name: Option<String>,

    /// Keep credentials in memory for this run instead of the OS keychain
    #[arg(long, global = true)]
    memory_store: bool,

    /// Write logs to a daily rolling file in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan a pairing code: pass the QR payload, or pipe scanner output on stdin
    Pair { payload: Option<String> },
    /// Check the stored credentials with the server
    Verify,
    /// Show whether this device is paired
    Status,
    /// Send an authenticated request
    Request {
        method: String,
        path: String,
        /// JSON request body
        #[arg(long)]
        body: Option<String>,
    },
    /// Remove stored credentials
    Logout,
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pairlink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

fn build_machine(cli: &Cli, config: &Config) -> Result<PairingMachine> {
    let store = if cli.memory_store {
        CredentialStore::in_memory()
    } else {
        CredentialStore::keyring(config.keyring_service())
    };
    let gateway = Gateway::with_timeout(Arc::new(store), config.request_timeout());
    let client = PairingClient::with_timeout(config.request_timeout())
        .context("Failed to build HTTP client")?;
    let device_name = cli
        .device_name
        .clone()
        .unwrap_or_else(|| config.device_name().to_string());

    Ok(PairingMachine::new(client, gateway, device_name))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref());
    info!("pairlink starting");

    let config = Config::load().context("Failed to load config")?.with_env();
    debug!(?config, "Config loaded");

    let mut machine = build_machine(&cli, &config)?;

    match &cli.command {
        Command::Pair { payload } => pair(&mut machine, payload.as_deref()).await,
        Command::Verify => verify(&mut machine).await,
        Command::Status => {
            print_state(&machine);
            Ok(())
        }
        Command::Request { method, path, body } => {
            request(&mut machine, method, path, body.as_deref()).await
        }
        Command::Logout => {
            machine.logout().context("Failed to clear stored credentials")?;
            println!("Logged out.");
            Ok(())
        }
    }
}

async fn pair(machine: &mut PairingMachine, payload: Option<&str>) -> Result<()> {
    if machine.is_authenticated() {
        println!("Replacing the existing pairing.");
        machine.reset();
    }
    machine.start();

    let outcome = match payload {
        Some(payload) => match machine.scanned(payload).await {
            ScanOutcome::Warning(e) => anyhow::bail!("{}", e),
            outcome => outcome,
        },
        None => scan_stdin(machine).await?,
    };

    match outcome {
        ScanOutcome::Finished(AuthState::Authenticated(_)) => {
            println!("Authentication successful! Your device has been paired.");
            print_state(machine);
            Ok(())
        }
        ScanOutcome::Finished(AuthState::Failed(reason)) => {
            anyhow::bail!("Authentication failed: {}", reason.message())
        }
        _ => {
            machine.cancel();
            anyhow::bail!("Scanning cancelled")
        }
    }
}

/// Treat each stdin line as one scanner read, looping past malformed codes
async fn scan_stdin(machine: &mut PairingMachine) -> Result<ScanOutcome> {
    eprintln!("Scan the QR code displayed in the web application (Ctrl-D to cancel)...");
    for line in io::stdin().lock().lines() {
        let line = line.context("Failed to read scanner input")?;
        if line.trim().is_empty() {
            continue;
        }
        match machine.scanned(line.trim()).await {
            ScanOutcome::Warning(e) => eprintln!("{}", e),
            ScanOutcome::Ignored => {}
            outcome => return Ok(outcome),
        }
    }
    Ok(ScanOutcome::Ignored)
}

async fn verify(machine: &mut PairingMachine) -> Result<()> {
    if !machine.is_authenticated() {
        anyhow::bail!("This device is not paired. Run `pairlink pair` first.");
    }
    let before = machine.state().clone();

    match machine.verify().await.clone() {
        AuthState::Authenticated(credential) => {
            println!("Token verification successful! Your token is valid.");
            if AuthState::Authenticated(credential) != before {
                println!("The server issued a new refresh token; it has been stored.");
            }
            Ok(())
        }
        AuthState::Failed(reason) => anyhow::bail!(reason.message()),
        other => anyhow::bail!("Unexpected state after verify: {}", other.label()),
    }
}

async fn request(
    machine: &mut PairingMachine,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;
    let body = body
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("Request body is not valid JSON")?;

    let response = machine.send(method, path, body.as_ref()).await?;
    let status = response.status();
    let text = response.text().await.context("Failed to read response body")?;

    println!("{}", status);
    println!("{}", text);
    if !status.is_success() {
        anyhow::bail!("Request failed with status {}", status);
    }
    Ok(())
}

fn print_state(machine: &PairingMachine) {
    match machine.state() {
        AuthState::Authenticated(credential) => {
            println!("Paired as device {}", credential.device_id);
            println!("API URL: {}", credential.api_url);
            for (key, value) in machine.details() {
                println!("{}: {}", key, value);
            }
        }
        AuthState::Failed(reason) => println!("Failed: {}", reason.message()),
        _ => println!("Not paired. Device name: {}", machine.device_name()),
    }
}
