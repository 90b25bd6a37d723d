//! Edictflow Agent Binary
//!
//! ## Usage
//!
//! ```bash
//! edictflow-agent login                  # device authorization
//! edictflow-agent run                    # start the daemon
//! edictflow-agent add-project ~/work/app --tag backend
//! edictflow-agent status
//! edictflow-agent config-set server_url https://edictflow.example.com
//! ```

use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use edictflow_agent::auth::{poll_until_authorized, DeviceAuthClient};
use edictflow_agent::config::AgentConfig;
use edictflow_agent::daemon::effective_config;
use edictflow_agent::ipc::{self, IpcRequest};
use edictflow_agent::{AgentPaths, AgentStore, Daemon};
use edictflow_core::model::ExceptionType;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "edictflow-agent", version, about = "Keeps managed files in line with the Edictflow controller")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon in the foreground
    Run,
    /// Authorize this device with the controller
    Login,
    /// Forget the stored credential
    Logout,
    /// Show daemon status
    Status,
    /// Force an immediate heartbeat
    Sync,
    /// Start managing a project directory
    AddProject {
        path: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Stop managing a project directory
    RemoveProject { path: String },
    /// Ask for an exception to a rejected change
    RequestException {
        change_id: String,
        #[arg(long)]
        justification: String,
        /// Hours the exception lasts; omit for a permanent request
        #[arg(long)]
        hours: Option<u32>,
    },
    /// Persist a configuration override
    ConfigSet { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edictflow_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let paths = AgentPaths::resolve()?;

    match cli.command {
        Command::Run => run(paths).await?,
        Command::Login => login(paths).await?,
        Command::Logout => {
            paths.ensure()?;
            AgentStore::open(paths.database())?.clear_auth()?;
            println!("Logged out.");
        }
        Command::Status => print_reply(&paths, IpcRequest::Status).await?,
        Command::Sync => print_reply(&paths, IpcRequest::Sync).await?,
        Command::AddProject { path, tags } => {
            print_reply(&paths, IpcRequest::AddProject { path, tags }).await?
        }
        Command::RemoveProject { path } => {
            print_reply(&paths, IpcRequest::RemoveProject { path }).await?
        }
        Command::RequestException {
            change_id,
            justification,
            hours,
        } => {
            let exception_type = if hours.is_some() {
                ExceptionType::TimeLimited
            } else {
                ExceptionType::Permanent
            };
            let request = IpcRequest::RequestException {
                change_id,
                justification,
                exception_type,
                duration_hours: hours,
            };
            print_reply(&paths, request).await?
        }
        Command::ConfigSet { key, value } => {
            paths.ensure()?;
            let store = AgentStore::open(paths.database())?;
            let mut config = effective_config(&paths.home, &store)?;
            config.apply_override(&key, &value)?;
            store.set_config(&key, &value)?;
            println!("{} = {}", key, value);
        }
    }
    Ok(())
}

async fn run(paths: AgentPaths) -> Result<(), Box<dyn std::error::Error>> {
    let daemon = Arc::new(Daemon::open(paths)?);
    let connector = daemon.default_connector();
    tracing::info!("Starting Edictflow agent v{}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            on_signal.cancel();
        }
    });

    if let Err(e) = daemon.run(connector, cancel).await {
        tracing::error!(error = %e, "agent stopped");
        return Err(e.into());
    }
    Ok(())
}

async fn login(paths: AgentPaths) -> Result<(), Box<dyn std::error::Error>> {
    paths.ensure()?;
    let store = AgentStore::open(paths.database())?;
    let config: AgentConfig = effective_config(&paths.home, &store)?;
    let client = DeviceAuthClient::new(config.http_url())?;

    let code = client.start().await?;
    println!("Open {} and enter the code {}", code.verification_uri, code.user_code);

    let grant = poll_until_authorized(&client, &code).await?;
    let record = grant.into_auth_record(Utc::now());
    store.save_auth(&record, Utc::now())?;
    println!("Logged in as {} (agent {}).", record.user_id, record.agent_id);
    Ok(())
}

async fn print_reply(paths: &AgentPaths, request: IpcRequest) -> Result<(), Box<dyn std::error::Error>> {
    let reply = ipc::request(&paths.socket(), &request).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    if let Some(error) = reply.get("error").and_then(|e| e.as_str()) {
        return Err(error.into());
    }
    Ok(())
}
