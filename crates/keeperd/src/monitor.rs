//! Monitor task - owns the state machine, the ledger and the on-disk history
//!
//! One task does all the work: it polls the status probe on a fixed interval
//! and serves start/stop/status requests from a single-slot queue between
//! polls. Everything else talks to it through [`MonitorHandle`].
//!
//! Per transition, in order:
//! 1. append the events to the log (one batch write)
//! 2. apply them to the in-memory ledger
//! 3. rewrite the sessions/stats snapshot
//! 4. deliver notices
//!
//! If step 1 fails after all retries the transition is dropped uncommitted
//! and the next poll produces it again. A write that outlives its timeout is
//! never started a second time: retries keep waiting on the same job, and if
//! it is still running the transition is parked with it. No new transition is
//! computed until a parked append has finished; if it landed, the parked
//! transition is committed then. A failed snapshot rewrite is retried on later
//! cycles; the log stays the source of truth.

use crate::machine::{Machine, StartDecision, Timing, Transition};
use crate::notifier::NotificationSink;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keeper_common::compose::{CommandIssuer, StatusProbe};
use keeper_common::ipc::{CommandOutcome, MonitorSnapshot};
use keeper_common::{Config, EventLog, KeeperError, Ledger, SnapshotStore, Status};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Source of "now" for the monitor.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub write_timeout: Duration,
    pub write_retries: u32,
    pub timing: Timing,
    pub backup_generations: usize,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        let m = &config.monitor;
        Self {
            poll_interval: m.poll_interval(),
            probe_timeout: m.probe_timeout(),
            write_timeout: m.write_timeout(),
            write_retries: m.write_retries.max(1),
            timing: Timing {
                grace: m.grace(),
                start_timeout: m.start_timeout(),
            },
            backup_generations: config.storage.backup_generations,
        }
    }
}

/// User commands accepted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

pub enum Request {
    Command(Command, oneshot::Sender<CommandOutcome>),
    Snapshot(oneshot::Sender<MonitorSnapshot>),
    Shutdown,
}

/// External collaborators of the monitor.
#[derive(Clone)]
pub struct Collaborators {
    pub probe: Arc<dyn StatusProbe>,
    pub issuer: Arc<dyn CommandIssuer>,
    pub sink: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

type WriteJob = JoinHandle<keeper_common::Result<()>>;

enum WriteFailure {
    /// The write finished with an error; nothing is left running.
    Failed(KeeperError),
    /// The write is still running on the blocking pool and may yet land.
    Stalled(WriteJob, KeeperError),
}

/// Event append that outlived every wait, with the transition it carries.
struct ParkedAppend {
    job: WriteJob,
    transition: Transition,
}

pub struct Monitor {
    machine: Machine,
    ledger: Ledger,
    log: EventLog,
    store: SnapshotStore,
    parts: Collaborators,
    settings: MonitorSettings,
    last_observation: Option<(Status, DateTime<Utc>)>,
    snapshot_stale: bool,
    parked: Option<ParkedAppend>,
    snapshot_job: Option<WriteJob>,
}

impl Monitor {
    /// Recover the log, replay it and derive the starting phase.
    pub fn new(
        settings: MonitorSettings,
        log: EventLog,
        store: SnapshotStore,
        parts: Collaborators,
    ) -> Result<Self> {
        if let Some(bytes) = log
            .recover(settings.backup_generations)
            .context("Failed to recover event log")?
        {
            warn!("[BOOT] Dropped {} bytes of torn record from event log", bytes);
        }

        let scan = log.scan().context("Failed to read event log")?;
        for err in &scan.errors {
            warn!("[BOOT] Skipping malformed event log record at {}", err);
        }
        let mut ledger = Ledger::rebuild_from_scratch(&scan.events);
        ledger.anomalies.parse_error += scan.errors.len() as u64;
        if !ledger.anomalies.is_clean() {
            warn!("[BOOT] Event log anomalies: {}", ledger.anomalies);
        }

        let machine = Machine::resume(settings.timing, &ledger);
        info!(
            "[BOOT] Replayed {} events: {} sessions, phase {}",
            scan.events.len(),
            ledger.sessions.len(),
            machine.phase().name()
        );

        Ok(Self {
            machine,
            ledger,
            log,
            store,
            parts,
            settings,
            last_observation: None,
            snapshot_stale: true,
            parked: None,
            snapshot_job: None,
        })
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let phase = self.machine.phase();
        let stats = &self.ledger.stats;
        MonitorSnapshot {
            phase: phase.name().to_string(),
            phase_since: phase.since(),
            pending_start: self.machine.state().pending_start,
            open_session: self.ledger.open_session().cloned(),
            poll_interval_secs: self.settings.poll_interval.as_secs(),
            grace_secs: self.settings.timing.grace.num_seconds().max(0) as u64,
            last_status: self.last_observation.map(|(s, _)| s),
            last_observed_at: self.last_observation.map(|(_, at)| at),
            sessions_recorded: self.ledger.sessions.len(),
            start_count: stats.start_count,
            auto_detected_events: stats.auto_starts + stats.auto_stops,
            anomalies: self.ledger.anomalies,
            snapshot_stale: self.snapshot_stale,
        }
    }

    /// One probe plus at most one state-machine step. Returns `Unknown`
    /// without probing while a parked append is still running.
    pub async fn poll_once(&mut self) -> Status {
        if !self.settle_parked().await {
            warn!("[MONITOR] Earlier event append still running; cycle skipped");
            return Status::Unknown;
        }

        let status = match timeout(self.settings.probe_timeout, self.parts.probe.probe()).await {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    "[MONITOR] Probe timed out after {}s",
                    self.settings.probe_timeout.as_secs()
                );
                Status::Unknown
            }
        };
        let now = self.parts.clock.now();
        debug!("[MONITOR] Observed {}", status);

        if status != Status::Unknown {
            self.last_observation = Some((status, now));
        }

        let transition = self.machine.observe(status, now);
        if let Err(e) = self.commit(transition).await {
            error!("[MONITOR] Cycle skipped: {}", e);
        }
        status
    }

    pub async fn handle(&mut self, command: Command) -> CommandOutcome {
        if !self.settle_parked().await {
            return CommandOutcome::Failed {
                reason: "an earlier event write is still in progress; try again shortly".into(),
            };
        }
        match command {
            Command::Start => self.handle_start().await,
            Command::Stop => self.handle_stop().await,
        }
    }

    async fn handle_start(&mut self) -> CommandOutcome {
        let now = self.parts.clock.now();
        match self.machine.request_start(now) {
            StartDecision::AlreadyRunning => {
                info!("[MONITOR] Start requested while already running; ignored");
                CommandOutcome::AlreadyRunning
            }
            StartDecision::Pending { since } => {
                info!("[MONITOR] Start requested while one is pending since {}", since);
                CommandOutcome::Pending { since }
            }
            StartDecision::Issue => {
                if let Err(e) = self.parts.issuer.start().await {
                    error!("[MONITOR] Start command failed: {}", e);
                    return CommandOutcome::Failed {
                        reason: e.to_string(),
                    };
                }
                let transition = self.machine.start_issued(self.parts.clock.now());
                match self.commit(transition).await {
                    Ok(()) => CommandOutcome::Starting,
                    Err(e) => CommandOutcome::Failed {
                        reason: e.to_string(),
                    },
                }
            }
        }
    }

    async fn handle_stop(&mut self) -> CommandOutcome {
        if let Err(e) = self.parts.issuer.stop().await {
            error!("[MONITOR] Stop command failed: {}", e);
            return CommandOutcome::Failed {
                reason: e.to_string(),
            };
        }

        let transition = self.machine.stop_issued(self.parts.clock.now());
        let session_closed = !transition.events.is_empty();
        match self.commit(transition).await {
            Ok(()) => CommandOutcome::Stopped { session_closed },
            Err(e) => {
                // the next observation sees the server down and closes the
                // session as an automatic stop
                error!("[MONITOR] Server stopped but the stop was not recorded: {}", e);
                CommandOutcome::Failed {
                    reason: format!("server stopped, but recording failed: {}", e),
                }
            }
        }
    }

    async fn commit(&mut self, transition: Transition) -> std::result::Result<(), KeeperError> {
        if !transition.events.is_empty() {
            let log = self.log.clone();
            let events = transition.events.clone();
            match self.persist("event append", move || log.append_batch(&events)).await {
                Ok(()) => {}
                Err(WriteFailure::Failed(e)) => return Err(e),
                Err(WriteFailure::Stalled(job, e)) => {
                    self.parked = Some(ParkedAppend { job, transition });
                    return Err(e);
                }
            }
        }
        self.apply(transition).await;
        Ok(())
    }

    /// Steps 2 to 4 for a transition whose events are already in the log.
    async fn apply(&mut self, transition: Transition) {
        for event in &transition.events {
            let applied = self.ledger.apply(event);
            if !applied.anomalies.is_clean() {
                warn!("[MONITOR] Anomaly while recording {}: {}", event.kind, applied.anomalies);
            }
            info!("[MONITOR] Recorded {} at {}", event.kind, event.timestamp);
        }
        if !transition.events.is_empty() {
            self.snapshot_stale = true;
        }

        let before = self.machine.phase();
        self.machine.commit(&transition);
        if before != self.machine.phase() {
            info!(
                "[MONITOR] Phase {} -> {}",
                before.name(),
                self.machine.phase().name()
            );
        }

        self.flush_snapshot().await;

        for notice in &transition.notices {
            if let Err(e) = self.parts.sink.notify(notice).await {
                warn!("[MONITOR] Notice not delivered: {:#}", e);
            }
        }
    }

    /// Resolve an append parked by an earlier cycle. `false` while it is
    /// still running.
    async fn settle_parked(&mut self) -> bool {
        let Some(mut parked) = self.parked.take() else {
            return true;
        };
        match timeout(self.settings.write_timeout, &mut parked.job).await {
            Ok(Ok(Ok(()))) => {
                info!("[MONITOR] Delayed event append completed");
                self.apply(parked.transition).await;
                true
            }
            Ok(Ok(Err(e))) => {
                warn!("[MONITOR] Delayed event append failed, transition dropped: {}", e);
                true
            }
            Ok(Err(join)) => {
                error!("[MONITOR] Delayed event append aborted: {}", join);
                true
            }
            Err(_) => {
                self.parked = Some(parked);
                false
            }
        }
    }

    async fn flush_snapshot(&mut self) {
        if !self.snapshot_stale {
            return;
        }
        if let Some(job) = &self.snapshot_job {
            if !job.is_finished() {
                debug!("[MONITOR] Earlier snapshot write still running");
                return;
            }
            self.snapshot_job = None;
        }

        let store = self.store.clone();
        let ledger = self.ledger.clone();
        match self
            .persist("snapshot write", move || store.save(&ledger))
            .await
        {
            Ok(()) => self.snapshot_stale = false,
            Err(WriteFailure::Failed(e)) => warn!("[MONITOR] Snapshot left stale, will retry: {}", e),
            Err(WriteFailure::Stalled(job, e)) => {
                warn!("[MONITOR] Snapshot left stale, will retry: {}", e);
                self.snapshot_job = Some(job);
            }
        }
    }

    /// Run a blocking write off the runtime, waiting at most `write_timeout`
    /// per attempt for up to `write_retries` attempts.
    ///
    /// Only a write that finished with an error is started again. After a
    /// timeout the next attempt waits on the same job, so one write never
    /// has two copies in flight.
    async fn persist<F>(&self, operation: &str, write: F) -> std::result::Result<(), WriteFailure>
    where
        F: Fn() -> keeper_common::Result<()> + Clone + Send + 'static,
    {
        let attempts = self.settings.write_retries.max(1);
        let timed_out = || KeeperError::Timeout {
            operation: operation.to_string(),
            secs: self.settings.write_timeout.as_secs(),
        };
        let mut job = tokio::task::spawn_blocking(write.clone());

        for attempt in 1..=attempts {
            let error = match timeout(self.settings.write_timeout, &mut job).await {
                Ok(Ok(Ok(()))) => return Ok(()),
                Ok(Ok(Err(e))) => e,
                Ok(Err(join)) => KeeperError::Io(std::io::Error::other(join.to_string())),
                Err(_) => {
                    warn!(
                        "[MONITOR] {} still running (wait {}/{})",
                        operation, attempt, attempts
                    );
                    continue;
                }
            };
            warn!(
                "[MONITOR] {} failed (attempt {}/{}): {}",
                operation, attempt, attempts, error
            );
            if attempt == attempts {
                return Err(WriteFailure::Failed(error));
            }
            job = tokio::task::spawn_blocking(write.clone());
        }
        Err(WriteFailure::Stalled(job, timed_out()))
    }

    /// Poll on the interval and serve requests until shutdown.
    pub async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "[MONITOR] Running (poll every {}s, grace {}s)",
            self.settings.poll_interval.as_secs(),
            self.settings.timing.grace.num_seconds()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                request = requests.recv() => match request {
                    Some(Request::Command(command, reply)) => {
                        let outcome = self.handle(command).await;
                        if reply.send(outcome).is_err() {
                            debug!("[MONITOR] Requester went away before the reply");
                        }
                    }
                    Some(Request::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                    Some(Request::Shutdown) | None => break,
                },
            }
        }

        if !self.settle_parked().await {
            warn!("[MONITOR] Event append still running at shutdown");
        }
        self.flush_snapshot().await;
        info!("[MONITOR] Stopped");
    }

    /// Move the monitor onto its own task.
    pub fn spawn(self) -> (MonitorHandle, JoinHandle<()>) {
        let (handle, rx) = MonitorHandle::channel();
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }
}

/// Cloneable front door to the monitor task.
#[derive(Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<Request>,
}

impl MonitorHandle {
    /// Handle plus the receiving end a monitor loop drains.
    pub(crate) fn channel() -> (Self, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    async fn command(&self, command: Command) -> Result<CommandOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Command(command, reply))
            .await
            .map_err(|_| anyhow::anyhow!("monitor is not running"))?;
        rx.await.context("monitor dropped the request")
    }

    pub async fn start(&self) -> Result<CommandOutcome> {
        self.command(Command::Start).await
    }

    pub async fn stop(&self) -> Result<CommandOutcome> {
        self.command(Command::Stop).await
    }

    pub async fn snapshot(&self) -> Result<MonitorSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Snapshot(reply))
            .await
            .map_err(|_| anyhow::anyhow!("monitor is not running"))?;
        rx.await.context("monitor dropped the request")
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Request::Shutdown).await;
    }
}
