//! Control client - Unix socket client for the keeperd command queue

use anyhow::{Context, Result};
use keeper_common::ipc::{ControlRequest, ControlResponse};
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlClient {
    /// Connect with a short backoff between attempts.
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let mut delay = Duration::from_millis(50);
        let mut last_error: Option<std::io::Error> = None;

        for attempt in 0..CONNECT_ATTEMPTS {
            match timeout(CONNECT_TIMEOUT, UnixStream::connect(socket_path)).await {
                Ok(Ok(stream)) => {
                    let (reader, writer) = stream.into_split();
                    return Ok(Self {
                        reader: BufReader::new(reader),
                        writer,
                    });
                }
                // a missing socket will not appear by waiting
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(socket_error_with_hint(socket_path, e));
                }
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => {}
            }
            if attempt + 1 < CONNECT_ATTEMPTS {
                sleep(delay).await;
                delay = (delay * 2).min(Duration::from_millis(500));
            }
        }

        match last_error {
            Some(e) => Err(socket_error_with_hint(socket_path, e)),
            None => anyhow::bail!(
                "Timed out connecting to keeperd at {}. Is it running?",
                socket_path.display()
            ),
        }
    }

    /// Send one request and return the `data` of a success reply.
    pub async fn call(&mut self, request: ControlRequest) -> Result<serde_json::Value> {
        // start and stop wait for docker compose
        let limit = match request {
            ControlRequest::Start | ControlRequest::Stop => Duration::from_secs(180),
            ControlRequest::Monitor => Duration::from_secs(5),
        };

        let response = timeout(limit, self.call_inner(request))
            .await
            .map_err(|_| anyhow::anyhow!("No reply from keeperd within {}s", limit.as_secs()))??;

        match response {
            ControlResponse::Success { data } => Ok(data),
            ControlResponse::Error { message } => anyhow::bail!("{}", message),
        }
    }

    async fn call_inner(&mut self, request: ControlRequest) -> Result<ControlResponse> {
        let line = serde_json::to_string(&request)? + "\n";
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to send request")?;

        let mut reply = String::new();
        let n = self
            .reader
            .read_line(&mut reply)
            .await
            .context("Failed to read response")?;
        if n == 0 {
            anyhow::bail!("keeperd closed the connection without replying");
        }
        serde_json::from_str(&reply).context("Malformed response from keeperd")
    }
}

fn socket_error_with_hint(path: &Path, error: std::io::Error) -> anyhow::Error {
    use std::io::ErrorKind;

    let hint = match error.kind() {
        ErrorKind::NotFound => format!(
            "Socket not found at {}. Is keeperd running?\n\
             Try: sudo systemctl status keeperd",
            path.display()
        ),
        ErrorKind::PermissionDenied => format!(
            "Permission denied on {}.\n\
             The socket is mode 0660; add your user to the socket's group\n\
             or run keeperctl with sudo.",
            path.display()
        ),
        ErrorKind::ConnectionRefused | ErrorKind::TimedOut => format!(
            "keeperd not responding on {}.\n\
             Try: sudo systemctl restart keeperd",
            path.display()
        ),
        _ => format!("Failed to connect to keeperd at {}: {}", path.display(), error),
    };

    anyhow::Error::new(error).context(hint)
}
