//! Docker Compose collaborators: status probe and start/stop commands.
//!
//! The monitor only sees the [`StatusProbe`] and [`CommandIssuer`] traits, so
//! tests drive it with scripted fakes and never touch docker.

use crate::error::{KeeperError, Result};
use crate::types::Status;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::{debug, warn};

pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Service used for rcon-cli when neither config nor `ps` names one
pub const FALLBACK_SERVICE: &str = "mc";

/// ESC followed by a 7-bit C1 Fe sequence or a full CSI sequence
static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap());

/// Remove terminal escape sequences from companion-tool output.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Reports the current run-state. Never errors: anything that prevents a
/// reading comes back as [`Status::Unknown`].
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn probe(&self) -> Status;
}

/// Issues start and stop to the orchestrator.
#[async_trait]
pub trait CommandIssuer: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// One row of `docker compose ps --format json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ContainerInfo {
    #[serde(rename = "Service", default)]
    pub service: String,
    #[serde(rename = "State", default)]
    pub state: String,
    #[serde(rename = "Health", default)]
    pub health: String,
}

impl ContainerInfo {
    fn normalized(mut self) -> Self {
        self.state = self.state.to_lowercase();
        self.health = self.health.to_lowercase();
        if self.service.is_empty() {
            self.service = "unknown".to_string();
        }
        self
    }
}

/// Parse `ps` output. Compose versions differ: some print a JSON array, some
/// a single object, some one object per line. Unparseable lines are ignored.
pub fn parse_ps_output(stdout: &str) -> Vec<ContainerInfo> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if let Ok(list) = serde_json::from_str::<Vec<ContainerInfo>>(trimmed) {
        return list.into_iter().map(ContainerInfo::normalized).collect();
    }
    if let Ok(one) = serde_json::from_str::<ContainerInfo>(trimmed) {
        return vec![one.normalized()];
    }

    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<ContainerInfo>(line) {
            Ok(info) => Some(info.normalized()),
            Err(e) => {
                debug!("Ignoring unparseable ps line: {}", e);
                None
            }
        })
        .collect()
}

/// Fold every container of the project into one status.
///
/// Precedence: unhealthy, then starting, then running, then stopped.
pub fn consolidate(containers: &[ContainerInfo]) -> Status {
    let running = |c: &&ContainerInfo| c.state.contains("running");

    if containers
        .iter()
        .filter(running)
        .any(|c| c.health.contains("unhealthy"))
    {
        return Status::RunningUnhealthy;
    }
    if containers.iter().any(|c| {
        c.health.contains("starting")
            || c.state.contains("starting")
            || c.state.contains("restarting")
    }) {
        return Status::Starting;
    }
    if containers.iter().any(|c| running(&c)) {
        return Status::RunningHealthy;
    }
    Status::Stopped
}

/// Check that the compose directory and file are where the config says.
pub fn validate_setup(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(KeeperError::Config(format!(
            "compose directory does not exist: {}",
            dir.display()
        )));
    }
    let file = dir.join(COMPOSE_FILE);
    if !file.is_file() {
        return Err(KeeperError::Config(format!(
            "{} not found in {}",
            COMPOSE_FILE,
            dir.display()
        )));
    }
    Ok(())
}

async fn compose(dir: &Path, args: &[&str]) -> Result<String> {
    debug!("docker compose {}", args.join(" "));
    let output = Command::new("docker")
        .arg("compose")
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| KeeperError::Command(format!("failed to run docker compose: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(KeeperError::Command(format!(
            "docker compose {} exited with {}: {}",
            args.first().copied().unwrap_or_default(),
            output.status,
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Status probe backed by `docker compose ps`.
#[derive(Debug, Clone)]
pub struct ComposeProbe {
    dir: PathBuf,
    service: Option<String>,
}

impl ComposeProbe {
    pub fn new(dir: impl Into<PathBuf>, service: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            service,
        }
    }

    pub async fn containers(&self) -> Result<Vec<ContainerInfo>> {
        let stdout = compose(&self.dir, &["ps", "--format", "json"])
            .await
            .map_err(|e| KeeperError::Probe(e.to_string()))?;
        Ok(parse_ps_output(&stdout))
    }

    /// Online player list from rcon-cli, if the companion tool answers.
    pub async fn players(&self) -> Option<String> {
        let service = match &self.service {
            Some(s) => s.clone(),
            None => self
                .containers()
                .await
                .ok()
                .and_then(|c| c.into_iter().next())
                .map(|c| c.service)
                .unwrap_or_else(|| FALLBACK_SERVICE.to_string()),
        };

        match compose(&self.dir, &["exec", "-T", &service, "rcon-cli", "list"]).await {
            Ok(out) => {
                let clean = strip_ansi(&out);
                let clean = clean.trim();
                (!clean.is_empty()).then(|| clean.to_string())
            }
            Err(e) => {
                debug!("Player list unavailable: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl StatusProbe for ComposeProbe {
    async fn probe(&self) -> Status {
        match self.containers().await {
            Ok(containers) => consolidate(&containers),
            Err(e) => {
                warn!("{}", e);
                Status::Unknown
            }
        }
    }
}

/// `docker compose up -d` / `docker compose down`.
#[derive(Debug, Clone)]
pub struct ComposeCommander {
    dir: PathBuf,
}

impl ComposeCommander {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CommandIssuer for ComposeCommander {
    async fn start(&self) -> Result<()> {
        compose(&self.dir, &["up", "-d"]).await.map(|_| ())
    }

    async fn stop(&self) -> Result<()> {
        compose(&self.dir, &["down"]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn info(state: &str, health: &str) -> ContainerInfo {
        ContainerInfo {
            service: "mc".into(),
            state: state.into(),
            health: health.into(),
        }
    }

    #[test]
    fn test_parse_array() {
        let out = r#"[{"Service":"mc","State":"Running","Health":"Healthy"},{"Service":"backup","State":"exited"}]"#;
        let parsed = parse_ps_output(out);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], info("running", "healthy"));
        assert_eq!(parsed[1].health, "");
    }

    #[test]
    fn test_parse_single_object_and_ndjson() {
        let one = r#"{"Service":"mc","State":"running","Health":"starting"}"#;
        assert_eq!(parse_ps_output(one), vec![info("running", "starting")]);

        let lines = "{\"Service\":\"mc\",\"State\":\"running\"}\n\ngarbage\n{\"State\":\"exited\"}\n";
        let parsed = parse_ps_output(lines);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].service, "unknown");
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_ps_output("  \n").is_empty());
    }

    #[test]
    fn test_consolidate_precedence() {
        assert_eq!(consolidate(&[]), Status::Stopped);
        assert_eq!(consolidate(&[info("exited", "")]), Status::Stopped);
        assert_eq!(consolidate(&[info("running", "")]), Status::RunningHealthy);
        assert_eq!(consolidate(&[info("running", "healthy")]), Status::RunningHealthy);
        assert_eq!(consolidate(&[info("running", "starting")]), Status::Starting);
        assert_eq!(consolidate(&[info("restarting", "")]), Status::Starting);
        assert_eq!(
            consolidate(&[info("running", "starting"), info("running", "unhealthy")]),
            Status::RunningUnhealthy
        );
        // an exited container's stale health does not count
        assert_eq!(consolidate(&[info("exited", "unhealthy")]), Status::Stopped);
    }

    #[test]
    fn test_strip_ansi() {
        let raw = "\x1b[0;33mThere are 2 of a max of 20 players online:\x1b[0m alex, sam";
        assert_eq!(
            strip_ansi(raw),
            "There are 2 of a max of 20 players online: alex, sam"
        );
    }

    #[test]
    fn test_validate_setup() {
        let dir = TempDir::new().unwrap();
        assert!(validate_setup(&dir.path().join("missing")).is_err());
        assert!(validate_setup(dir.path()).is_err());
        std::fs::write(dir.path().join(COMPOSE_FILE), "services: {}\n").unwrap();
        assert!(validate_setup(dir.path()).is_ok());
    }
}
