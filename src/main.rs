#![forbid(unsafe_code)]

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use smb2_anchor::{config, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.iter().position(|a| a == "--config") {
        Some(i) => args.get(i + 1).cloned(),
        None => args.get(1).cloned(),
    }
    .unwrap_or_else(|| "config.toml".to_string());

    let config = config::load_config(&config_path)?;

    for share in &config.shares {
        if !share.path.exists() {
            warn!(
                "Share '{}' path does not exist: {}",
                share.name,
                share.path.display()
            );
        }
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let server_state = Arc::new(server::ServerState::new(
        config.server_name.clone(),
        Arc::new(config.clone()),
    ));
    let listener = TcpListener::bind(&addr).await?;
    info!("SMB2 server listening on {}", addr);
    info!(
        "Shares: {}",
        config
            .shares
            .iter()
            .map(|s| format!("{}={}", s.name, s.path.display()))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("Connection from {}", peer);
                        let state = server_state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server::handle_connection(stream, state).await {
                                error!("Connection from {} error: {}", peer, e);
                            }
                            info!("Connection from {} closed", peer);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {:?}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
