//! Edictflow Server Binary
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults (port 8420, in-memory store)
//! edictflow-server
//!
//! # Durable store, directory and tokens
//! EDICTFLOW_DB=/var/lib/edictflow/controller.db \
//! EDICTFLOW_DIRECTORY=/etc/edictflow/directory.json \
//! EDICTFLOW_TOKENS=/etc/edictflow/tokens.json \
//! edictflow-server
//! ```

use edictflow_server::{ControllerServer, ServerConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "edictflow_server=info,edictflow_core=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    tracing::info!("Starting Edictflow controller v{}", env!("CARGO_PKG_VERSION"));

    let server = match ControllerServer::from_config(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "controller failed to start");
            return Err(e.into());
        }
    };
    server.run().await?;

    Ok(())
}
