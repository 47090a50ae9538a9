// SPDX-License-Identifier: MIT

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use concord_transport::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

pub type RpcHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Value> + Send + Sync>;

pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port))
        .await
        .with_context(|| format!("failed to bind {}:{}", host, port))
}

/// Accept loop for one client-facing service: one JSON request document
/// per connection, one JSON reply, then close.
pub fn serve(
    name: &'static str,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    handler: RpcHandler,
) {
    tokio::spawn(async move {
        if let Ok(addr) = listener.local_addr() {
            info!("[{}] Listening on {}", name, addr);
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, handler).await {
                                debug!("[{}] Connection error: {:#}", name, e);
                            }
                        });
                    }
                    Err(e) => error!("[{}] Accept failed: {}", name, e),
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("[{}] Stopped", name);
                        return;
                    }
                }
            }
        }
    });
}

async fn handle_connection(mut stream: TcpStream, handler: RpcHandler) -> Result<()> {
    // The client writes its request and shuts down its write side.
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut buf)).await??;

    let reply = match serde_json::from_slice::<Value>(&buf) {
        Ok(request) => handler(request).await,
        Err(_) => json!({"status": "error", "message": "Invalid request"}),
    };

    stream.write_all(reply.to_string().as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
