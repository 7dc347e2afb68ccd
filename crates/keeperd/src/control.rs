//! Control server - Unix socket front end for the monitor's command queue

use crate::monitor::MonitorHandle;
use anyhow::{Context, Result};
use keeper_common::ipc::{CommandOutcome, ControlRequest, ControlResponse};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Bind the control socket, replacing a stale one left by a previous run.
pub async fn bind(socket_path: &Path) -> Result<UnixListener> {
    if let Some(dir) = socket_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create socket directory {}", dir.display()))?;
    }

    let _ = tokio::fs::remove_file(socket_path).await;

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind socket at {}", socket_path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o660))
            .context("Failed to set socket permissions")?;
    }

    info!("[CONTROL] Listening on {} (permissions: 0660)", socket_path.display());
    Ok(listener)
}

/// Accept connections until the listener fails for good.
pub async fn serve(listener: UnixListener, monitor: MonitorHandle) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let monitor = monitor.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, monitor).await {
                        error!("[CONTROL] Connection handler error: {:#}", e);
                    }
                });
            }
            Err(e) => {
                error!("[CONTROL] Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, monitor: MonitorHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .context("Failed to read from socket")?;
        if bytes_read == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ControlRequest>(&line) {
            Ok(request) => {
                debug!("[CONTROL] {:?}", request);
                handle_request(request, &monitor).await
            }
            Err(e) => {
                warn!("[CONTROL] Invalid request JSON: {}", e);
                ControlResponse::error(format!("invalid request: {}", e))
            }
        };

        let response_json = serde_json::to_string(&response)? + "\n";
        writer
            .write_all(response_json.as_bytes())
            .await
            .context("Failed to write response")?;
    }

    Ok(())
}

pub async fn handle_request(request: ControlRequest, monitor: &MonitorHandle) -> ControlResponse {
    let result = match request {
        ControlRequest::Start => monitor.start().await.map(outcome_response),
        ControlRequest::Stop => monitor.stop().await.map(outcome_response),
        ControlRequest::Monitor => monitor
            .snapshot()
            .await
            .map(|s| ControlResponse::success(&s)),
    };
    result.unwrap_or_else(|e| ControlResponse::error(e.to_string()))
}

fn outcome_response(outcome: CommandOutcome) -> ControlResponse {
    if outcome.is_failure() {
        ControlResponse::error(outcome.message())
    } else {
        ControlResponse::success(&outcome)
    }
}
