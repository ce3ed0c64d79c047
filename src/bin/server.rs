//! The `selkie-server` binary: load config, set up logging, run the
//! dialogue server until interrupted.

use anyhow::Context;
use selkie::{Server, ServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Mirror logs to a daily file when a log dir is given.
    let _guard = match std::env::var_os("SELKIE_LOG_DIR") {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "selkie.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_owned());
    let config = match std::fs::read_to_string(&config_path) {
        Ok(text) => {
            toml::from_str::<ServerConfig>(&text).context("parsing configuration file")?
        }
        Err(e) => {
            warn!("cannot read {config_path} ({e}), using built-in defaults");
            ServerConfig::default()
        }
    };

    let server = Server::new(config).context("building server")?;

    let cancel = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel.cancel();
        }
    });

    server.run().await.context("running server")?;
    Ok(())
}
