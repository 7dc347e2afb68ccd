//! Lifecycle state machine.
//!
//! Pure and clock-free: every method takes `now` and returns a [`Transition`]
//! describing the next state, the events to record and the notices to send.
//! Nothing changes until the caller has persisted the events and calls
//! [`Machine::commit`], so a failed write leaves the machine where it was and
//! the next poll simply tries again.
//!
//! Phases:
//! - `Stopped`: no session open
//! - `Starting`: session open, not yet healthy
//! - `Healthy`: session open, last reading healthy
//! - `Unhealthy`: session open, inside the grace window
//! - `Faulted`: session closed while the container is still present (grace
//!   expired or start failed); a later healthy reading opens a new session

use crate::notifier::{Notice, NoticeKind};
use chrono::{DateTime, Duration, Utc};
use keeper_common::{Event, EventKind, EventSource, Ledger, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Stopped,
    Starting { since: DateTime<Utc> },
    Healthy,
    Unhealthy { since: DateTime<Utc> },
    Faulted { since: DateTime<Utc> },
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Stopped => "stopped",
            Phase::Starting { .. } => "starting",
            Phase::Healthy => "healthy",
            Phase::Unhealthy { .. } => "unhealthy",
            Phase::Faulted { .. } => "faulted",
        }
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self {
            Phase::Starting { since } | Phase::Unhealthy { since } | Phase::Faulted { since } => {
                Some(*since)
            }
            Phase::Stopped | Phase::Healthy => None,
        }
    }

    /// A session is open in this phase.
    pub fn has_session(&self) -> bool {
        matches!(
            self,
            Phase::Starting { .. } | Phase::Healthy | Phase::Unhealthy { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// How long an unhealthy reading is tolerated
    pub grace: Duration,
    /// How long a start may take to become healthy; also the window in which
    /// an observed start is attributed to our own start command
    pub start_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineState {
    pub phase: Phase,
    /// When we last issued a start command that has not been seen to take effect
    pub pending_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: MachineState,
    pub events: Vec<Event>,
    pub notices: Vec<Notice>,
}

impl Transition {
    fn stay(state: MachineState) -> Self {
        Self {
            next: state,
            events: Vec::new(),
            notices: Vec::new(),
        }
    }

    fn to(phase: Phase, pending_start: Option<DateTime<Utc>>) -> Self {
        Self::stay(MachineState {
            phase,
            pending_start,
        })
    }

    fn event(mut self, at: DateTime<Utc>, kind: EventKind) -> Self {
        self.events.push(Event::at(at, kind));
        self
    }

    fn notice(
        mut self,
        kind: NoticeKind,
        at: DateTime<Utc>,
        observed: Status,
        message: impl Into<String>,
    ) -> Self {
        let event = self.events.last().map(|e| e.kind);
        self.notices.push(Notice::new(kind, at, event, observed, message));
        self
    }
}

/// Answer to a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// Issue the start command
    Issue,
    AlreadyRunning,
    Pending { since: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct Machine {
    state: MachineState,
    timing: Timing,
}

impl Machine {
    pub fn new(timing: Timing) -> Self {
        Self {
            state: MachineState {
                phase: Phase::Stopped,
                pending_start: None,
            },
            timing,
        }
    }

    /// Pick up where a replayed ledger left off.
    pub fn resume(timing: Timing, ledger: &Ledger) -> Self {
        let phase = match ledger.open_session() {
            Some(_) if ledger.is_healthy() => Phase::Healthy,
            Some(session) if session.confirmed => Phase::Unhealthy {
                since: ledger.stats.last_health_lost.unwrap_or(session.start),
            },
            Some(session) => Phase::Starting {
                since: session.start,
            },
            // the monitor gave up on the server last time; a container that
            // is still up must not reopen a session on the first poll
            None => match ledger.last_event() {
                Some(event)
                    if event.source == EventSource::Monitor
                        && matches!(event.kind, EventKind::AutoStop | EventKind::StartFailed) =>
                {
                    Phase::Faulted {
                        since: event.timestamp,
                    }
                }
                _ => Phase::Stopped,
            },
        };
        Self {
            state: MachineState {
                phase,
                pending_start: None,
            },
            timing,
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn commit(&mut self, transition: &Transition) {
        self.state = transition.next;
    }

    /// Pending start still inside its window at `now`.
    fn live_pending(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.state
            .pending_start
            .filter(|issued| now - *issued < self.timing.start_timeout)
    }

    /// Pending start whose window has run out by `now`.
    fn expired_pending(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.state
            .pending_start
            .filter(|issued| now - *issued >= self.timing.start_timeout)
    }

    fn timeout_secs(&self) -> i64 {
        self.timing.start_timeout.num_seconds()
    }

    /// One observation. `Unknown` never changes anything.
    pub fn observe(&self, status: Status, now: DateTime<Utc>) -> Transition {
        if status == Status::Unknown {
            return Transition::stay(self.state);
        }

        match self.state.phase {
            Phase::Stopped => self.observe_down(status, now, false),
            Phase::Faulted { .. } => self.observe_down(status, now, true),
            Phase::Starting { since } => self.observe_starting(status, now, since),
            Phase::Healthy => self.observe_healthy(status, now),
            Phase::Unhealthy { since } => self.observe_unhealthy(status, now, since),
        }
    }

    fn observe_down(&self, status: Status, now: DateTime<Utc>, faulted: bool) -> Transition {
        let manual = self.live_pending(now).is_some();
        let start_kind = if manual {
            EventKind::ManualStart
        } else {
            EventKind::AutoStart
        };

        match status {
            Status::RunningHealthy => Transition::to(Phase::Healthy, None)
                .event(now, start_kind)
                .event(now, EventKind::HealthOk)
                .notice(NoticeKind::Started, now, status, "Server started successfully!"),

            // a still-unhealthy container does not restart a faulted session
            Status::Starting | Status::RunningUnhealthy
                if !(faulted && status == Status::RunningUnhealthy) =>
            {
                let t = Transition::to(Phase::Starting { since: now }, None).event(now, start_kind);
                if manual {
                    t
                } else {
                    t.notice(
                        NoticeKind::Starting,
                        now,
                        status,
                        "Server is starting (auto-detected).",
                    )
                }
            }

            _ => {
                let phase = if status == Status::Stopped {
                    Phase::Stopped
                } else {
                    self.state.phase
                };
                match self.expired_pending(now) {
                    Some(_) => Transition::to(phase, None)
                        .event(now, EventKind::StartFailed)
                        .notice(
                            NoticeKind::StartFailed,
                            now,
                            status,
                            format!(
                                "Server did not become healthy within {} seconds.",
                                self.timeout_secs()
                            ),
                        ),
                    None => Transition::to(phase, self.state.pending_start),
                }
            }
        }
    }

    fn observe_starting(
        &self,
        status: Status,
        now: DateTime<Utc>,
        since: DateTime<Utc>,
    ) -> Transition {
        match status {
            Status::RunningHealthy => Transition::to(Phase::Healthy, None)
                .event(now, EventKind::HealthOk)
                .notice(NoticeKind::Started, now, status, "Server started successfully!"),

            Status::Stopped => Transition::to(Phase::Stopped, None)
                .event(now, EventKind::StartFailed)
                .notice(
                    NoticeKind::StartFailed,
                    now,
                    status,
                    "Server failed to start (container exited).",
                ),

            _ if now - since >= self.timing.start_timeout => {
                Transition::to(Phase::Faulted { since: now }, None)
                    .event(now, EventKind::StartFailed)
                    .notice(
                        NoticeKind::StartFailed,
                        now,
                        status,
                        format!(
                            "Server did not become healthy within {} seconds.",
                            self.timeout_secs()
                        ),
                    )
            }

            _ => Transition::stay(self.state),
        }
    }

    fn observe_healthy(&self, status: Status, now: DateTime<Utc>) -> Transition {
        match status {
            Status::RunningHealthy => Transition::stay(self.state),
            Status::Stopped => self.declare_down(
                Phase::Stopped,
                status,
                now,
                "Server has stopped (auto-detected).",
            ),
            _ => Transition::to(Phase::Unhealthy { since: now }, self.state.pending_start),
        }
    }

    fn observe_unhealthy(
        &self,
        status: Status,
        now: DateTime<Utc>,
        since: DateTime<Utc>,
    ) -> Transition {
        let expired = now - since >= self.timing.grace;
        match status {
            Status::Stopped => self.declare_down(
                Phase::Stopped,
                status,
                now,
                "Server has stopped (auto-detected).",
            ),
            _ if expired => {
                let message = format!(
                    "Server unhealthy for {} seconds; session closed.",
                    (now - since).num_seconds()
                );
                self.declare_down(Phase::Faulted { since: now }, status, now, message)
            }
            Status::RunningHealthy => Transition::to(Phase::Healthy, self.state.pending_start),
            _ => Transition::stay(self.state),
        }
    }

    fn declare_down(
        &self,
        phase: Phase,
        observed: Status,
        now: DateTime<Utc>,
        message: impl Into<String>,
    ) -> Transition {
        let kind = if phase == Phase::Stopped {
            NoticeKind::Stopped
        } else {
            NoticeKind::HealthLost
        };
        Transition::to(phase, None)
            .event(now, EventKind::HealthLost)
            .event(now, EventKind::AutoStop)
            .notice(kind, now, observed, message)
    }

    pub fn request_start(&self, now: DateTime<Utc>) -> StartDecision {
        if self.state.phase.has_session() {
            return StartDecision::AlreadyRunning;
        }
        match self.live_pending(now) {
            Some(since) => StartDecision::Pending { since },
            None => StartDecision::Issue,
        }
    }

    /// Start command went out. The start itself is recorded by the observation
    /// that sees the container come up.
    pub fn start_issued(&self, now: DateTime<Utc>) -> Transition {
        Transition::to(self.state.phase, Some(now)).notice(
            NoticeKind::StartRequested,
            now,
            Status::Unknown,
            "Server is starting (manual request).",
        )
    }

    /// Stop command succeeded. Closes any open session at once.
    pub fn stop_issued(&self, now: DateTime<Utc>) -> Transition {
        let t = Transition::to(Phase::Stopped, None);
        let t = if self.state.phase.has_session() {
            t.event(now, EventKind::ManualStop)
        } else {
            t
        };
        t.notice(
            NoticeKind::Stopped,
            now,
            Status::Stopped,
            "Server stopped (manual request).",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 4, 20, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn timing(grace: i64, start_timeout: i64) -> Timing {
        Timing {
            grace: Duration::seconds(grace),
            start_timeout: Duration::seconds(start_timeout),
        }
    }

    /// Feed observations, committing each transition; returns all events.
    fn run(machine: &mut Machine, steps: &[(i64, Status)]) -> Vec<Event> {
        let mut events = Vec::new();
        for (secs, status) in steps {
            let tr = machine.observe(*status, t(*secs));
            events.extend(tr.events.iter().copied());
            machine.commit(&tr);
        }
        events
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn test_blip_inside_grace_is_silent() {
        let mut m = Machine::new(timing(10, 360));
        let events = run(
            &mut m,
            &[
                (0, Status::Starting),
                (5, Status::RunningHealthy),
                (100, Status::RunningUnhealthy),
                (105, Status::RunningHealthy),
            ],
        );
        assert_eq!(kinds(&events), vec![EventKind::AutoStart, EventKind::HealthOk]);
        assert_eq!(m.phase(), Phase::Healthy);
    }

    #[test]
    fn test_sustained_unhealthy_stops_at_grace_expiry() {
        let mut m = Machine::new(timing(10, 360));
        let events = run(
            &mut m,
            &[
                (0, Status::Starting),
                (5, Status::RunningHealthy),
                (100, Status::RunningUnhealthy),
                (104, Status::RunningUnhealthy),
                (110, Status::RunningUnhealthy),
            ],
        );
        assert_eq!(
            kinds(&events),
            vec![
                EventKind::AutoStart,
                EventKind::HealthOk,
                EventKind::HealthLost,
                EventKind::AutoStop
            ]
        );
        assert_eq!(events[3].timestamp, t(110));
        assert_eq!(m.phase(), Phase::Faulted { since: t(110) });

        let ledger = Ledger::rebuild_from_scratch(&events);
        assert_eq!(ledger.sessions[0].end, Some(t(110)));
        assert_eq!(ledger.sessions[0].duration(), Some(Duration::seconds(110)));
    }

    #[test]
    fn test_grace_boundary() {
        for (g, expect_stop) in [(9, false), (10, true), (11, true)] {
            let mut m = Machine::new(timing(10, 360));
            run(&mut m, &[(0, Status::RunningHealthy), (100, Status::RunningUnhealthy)]);
            let tr = m.observe(Status::RunningHealthy, t(100 + g));
            let stopped = tr.events.iter().filter(|e| e.kind == EventKind::AutoStop).count();
            let lost = tr.events.iter().filter(|e| e.kind == EventKind::HealthLost).count();
            assert_eq!(stopped, expect_stop as usize, "g={}", g);
            assert_eq!(lost, expect_stop as usize, "g={}", g);
        }
    }

    #[test]
    fn test_unknown_does_not_reset_grace_clock() {
        let mut m = Machine::new(timing(10, 360));
        run(
            &mut m,
            &[
                (0, Status::RunningHealthy),
                (100, Status::RunningUnhealthy),
                (103, Status::Unknown),
                (106, Status::Unknown),
            ],
        );
        assert_eq!(m.phase(), Phase::Unhealthy { since: t(100) });
        let tr = m.observe(Status::RunningUnhealthy, t(110));
        assert_eq!(kinds(&tr.events), vec![EventKind::HealthLost, EventKind::AutoStop]);
    }

    #[test]
    fn test_unknown_is_noop_in_every_phase() {
        let phases = [
            Phase::Stopped,
            Phase::Starting { since: t(0) },
            Phase::Healthy,
            Phase::Unhealthy { since: t(0) },
            Phase::Faulted { since: t(0) },
        ];
        for phase in phases {
            let m = Machine {
                state: MachineState {
                    phase,
                    pending_start: Some(t(0)),
                },
                timing: timing(10, 60),
            };
            let tr = m.observe(Status::Unknown, t(10_000));
            assert_eq!(tr.next, m.state());
            assert!(tr.events.is_empty() && tr.notices.is_empty());
        }
    }

    #[test]
    fn test_started_notice_only_on_first_healthy() {
        let mut m = Machine::new(timing(10, 360));
        let mut started = 0;
        for (secs, status) in [
            (0, Status::Starting),
            (30, Status::Starting),
            (60, Status::RunningUnhealthy),
            (90, Status::RunningHealthy),
            (120, Status::RunningHealthy),
            (150, Status::RunningUnhealthy),
            (155, Status::RunningHealthy),
        ] {
            let tr = m.observe(status, t(secs));
            started += tr
                .notices
                .iter()
                .filter(|n| n.kind == NoticeKind::Started)
                .count();
            if secs < 90 {
                assert_eq!(started, 0, "no confirmation while only starting");
            }
            m.commit(&tr);
        }
        assert_eq!(started, 1);
    }

    #[test]
    fn test_manual_start_classified_by_pending_window() {
        let mut m = Machine::new(timing(10, 360));
        assert_eq!(m.request_start(t(0)), StartDecision::Issue);
        let tr = m.start_issued(t(0));
        assert!(tr.events.is_empty());
        assert_eq!(tr.notices[0].kind, NoticeKind::StartRequested);
        m.commit(&tr);

        assert_eq!(m.request_start(t(10)), StartDecision::Pending { since: t(0) });

        let events = run(&mut m, &[(60, Status::Starting), (120, Status::RunningHealthy)]);
        assert_eq!(kinds(&events), vec![EventKind::ManualStart, EventKind::HealthOk]);
        assert_eq!(m.state().pending_start, None);
        assert_eq!(m.request_start(t(130)), StartDecision::AlreadyRunning);
    }

    #[test]
    fn test_start_seen_after_window_is_auto() {
        let mut m = Machine::new(timing(10, 60));
        let tr = m.start_issued(t(0));
        m.commit(&tr);
        let events = run(
            &mut m,
            &[(30, Status::Stopped), (61, Status::Stopped), (200, Status::Starting)],
        );
        assert_eq!(kinds(&events), vec![EventKind::StartFailed, EventKind::AutoStart]);
    }

    #[test]
    fn test_start_timeout_fails_once_and_faults() {
        let mut m = Machine::new(timing(10, 60));
        let events = run(
            &mut m,
            &[
                (0, Status::Starting),
                (30, Status::RunningUnhealthy),
                (60, Status::RunningUnhealthy),
                (90, Status::RunningUnhealthy),
                (120, Status::RunningUnhealthy),
            ],
        );
        assert_eq!(kinds(&events), vec![EventKind::AutoStart, EventKind::StartFailed]);
        assert_eq!(m.phase(), Phase::Faulted { since: t(60) });

        let ledger = Ledger::rebuild_from_scratch(&events);
        assert!(ledger.open_session().is_none());
        assert_eq!(ledger.stats.start_failures, 1);

        // recovers into a fresh session once healthy
        let tr = m.observe(Status::RunningHealthy, t(150));
        assert_eq!(kinds(&tr.events), vec![EventKind::AutoStart, EventKind::HealthOk]);
    }

    #[test]
    fn test_container_exit_during_start() {
        let mut m = Machine::new(timing(10, 360));
        let events = run(&mut m, &[(0, Status::Starting), (20, Status::Stopped)]);
        assert_eq!(kinds(&events), vec![EventKind::AutoStart, EventKind::StartFailed]);
        assert_eq!(m.phase(), Phase::Stopped);
    }

    #[test]
    fn test_healthy_to_stopped_emits_lost_and_stop() {
        let mut m = Machine::new(timing(10, 360));
        run(&mut m, &[(0, Status::RunningHealthy)]);
        let tr = m.observe(Status::Stopped, t(500));
        assert_eq!(kinds(&tr.events), vec![EventKind::HealthLost, EventKind::AutoStop]);
        assert_eq!(tr.notices[0].kind, NoticeKind::Stopped);
        assert_eq!(tr.notices[0].event, Some(EventKind::AutoStop));
        assert_eq!(tr.next.phase, Phase::Stopped);
    }

    #[test]
    fn test_manual_stop_skips_grace() {
        let mut m = Machine::new(timing(600, 360));
        run(&mut m, &[(0, Status::RunningHealthy), (10, Status::RunningUnhealthy)]);
        let tr = m.stop_issued(t(11));
        assert_eq!(kinds(&tr.events), vec![EventKind::ManualStop]);
        assert_eq!(tr.next.phase, Phase::Stopped);
    }

    #[test]
    fn test_manual_stop_without_session_records_nothing() {
        let m = Machine::new(timing(10, 360));
        let tr = m.stop_issued(t(0));
        assert!(tr.events.is_empty());
        assert_eq!(tr.notices.len(), 1);
    }

    #[test]
    fn test_faulted_stays_quiet_while_unhealthy() {
        let mut m = Machine::new(timing(10, 360));
        run(
            &mut m,
            &[
                (0, Status::RunningHealthy),
                (10, Status::RunningUnhealthy),
                (20, Status::RunningUnhealthy),
            ],
        );
        assert!(matches!(m.phase(), Phase::Faulted { .. }));
        let events = run(&mut m, &[(30, Status::RunningUnhealthy), (40, Status::RunningUnhealthy)]);
        assert!(events.is_empty());
        let events = run(&mut m, &[(50, Status::Stopped)]);
        assert!(events.is_empty());
        assert_eq!(m.phase(), Phase::Stopped);
    }

    #[test]
    fn test_resume_from_ledger() {
        let tm = timing(10, 360);
        let healthy = Ledger::rebuild_from_scratch(&[
            Event::at(t(0), EventKind::AutoStart),
            Event::at(t(5), EventKind::HealthOk),
        ]);
        assert_eq!(Machine::resume(tm, &healthy).phase(), Phase::Healthy);

        let starting = Ledger::rebuild_from_scratch(&[Event::at(t(0), EventKind::ManualStart)]);
        assert_eq!(
            Machine::resume(tm, &starting).phase(),
            Phase::Starting { since: t(0) }
        );

        let lost = Ledger::rebuild_from_scratch(&[
            Event::at(t(0), EventKind::AutoStart),
            Event::at(t(5), EventKind::HealthOk),
            Event::at(t(50), EventKind::HealthLost),
        ]);
        assert_eq!(
            Machine::resume(tm, &lost).phase(),
            Phase::Unhealthy { since: t(50) }
        );

        assert_eq!(Machine::resume(tm, &Ledger::default()).phase(), Phase::Stopped);
    }

    #[test]
    fn test_resume_after_auto_stop_is_faulted() {
        let tm = timing(10, 360);
        let closed = Ledger::rebuild_from_scratch(&[
            Event::at(t(0), EventKind::AutoStart),
            Event::at(t(5), EventKind::HealthOk),
            Event::at(t(110), EventKind::HealthLost),
            Event::at(t(110), EventKind::AutoStop),
        ]);
        let m = Machine::resume(tm, &closed);
        assert_eq!(m.phase(), Phase::Faulted { since: t(110) });

        // container still unhealthy: nothing new is recorded
        let tr = m.observe(Status::RunningUnhealthy, t(130));
        assert!(tr.events.is_empty());
        assert!(tr.notices.is_empty());

        // container gone: quietly stopped
        let tr = m.observe(Status::Stopped, t(190));
        assert!(tr.events.is_empty());
        assert_eq!(tr.next.phase, Phase::Stopped);

        let failed = Ledger::rebuild_from_scratch(&[
            Event::at(t(0), EventKind::AutoStart),
            Event::at(t(360), EventKind::StartFailed),
        ]);
        assert_eq!(
            Machine::resume(tm, &failed).phase(),
            Phase::Faulted { since: t(360) }
        );

        let manual = Ledger::rebuild_from_scratch(&[
            Event::at(t(0), EventKind::AutoStart),
            Event::at(t(60), EventKind::ManualStop),
        ]);
        assert_eq!(Machine::resume(tm, &manual).phase(), Phase::Stopped);
    }
}
