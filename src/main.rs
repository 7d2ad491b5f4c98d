use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use gonk::config;
use gonk::middleware::logging;
use gonk::Server;

#[derive(Parser)]
#[command(name = "gonk", version, about = "Edge-native API gateway")]
struct Args {
    /// Path to the configuration file (YAML or JSON)
    #[arg(short, long, default_value = "gonk.yaml")]
    config: String,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let cfg = match config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if args.validate {
        println!("configuration is valid");
        return;
    }

    logging::init_tracing(&cfg.logging);

    let hot_reload = cfg.server.hot_reload;
    let server = match Server::new(cfg) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "failed to start");
            std::process::exit(1);
        }
    };

    if hot_reload {
        let handle = Arc::clone(&server);
        let result = config::watch(&args.config, move |new_cfg| {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move {
                handle.reload(new_cfg).await;
            });
        });
        match result {
            Ok(()) => info!(path = %args.config, "watching configuration for changes"),
            Err(e) => warn!(error = %e, "hot reload unavailable"),
        }
    }

    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }

    info!("shutdown complete");
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
