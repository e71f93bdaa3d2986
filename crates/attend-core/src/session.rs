//! Per-camera presence lock.
//!
//! A session commits at most one attendance event per continuous presence
//! of an identity. The committed identity stays locked while it keeps
//! being the best match; once it has been absent for `unlock_after` the
//! lock is released and a later appearance can commit again.
//!
//! ```text
//!             commit(id)                    absent >= unlock_after
//!  UNLOCKED ─────────────▶ LOCKED(id) ───────────────────────────▶ UNLOCKED
//!                           │    ▲
//!                           └────┘ matched id again: refresh last_seen
//! ```

use crate::event::{AttendanceEvent, AttendanceSink, CommitPolicy, EventError, LogId, SinkError};
use crate::types::MatchResult;
use chrono::Utc;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Timing gates of a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Minimum time between two commits of any identity.
    pub min_commit_interval: Duration,
    /// Absence after which a lock is released; also the window in which
    /// the last committed identity may not commit again.
    pub unlock_after: Duration,
    /// Maximum age of an observation that may still commit.
    pub freshness: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_commit_interval: Duration::from_secs(1),
            unlock_after: Duration::from_secs(5),
            freshness: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockState {
    Unlocked,
    Locked {
        identity_id: String,
        last_seen: Instant,
        /// First tick on which the locked identity was not the best match.
        absent_since: Option<Instant>,
    },
}

/// A match result together with the capture time of the frame it came from.
#[derive(Debug, Clone)]
pub struct Observation {
    pub result: MatchResult,
    pub observed_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// The observation is older than the freshness window.
    Stale,
    /// Another commit happened less than `min_commit_interval` ago.
    Spam,
    /// The same identity was the last commit, less than `unlock_after` ago.
    Repeat,
    /// The event could not be built.
    Invalid,
}

#[derive(Debug)]
pub enum Decision {
    NoMatch,
    Refreshed {
        identity_id: String,
    },
    Suppressed {
        identity_id: String,
        reason: SuppressReason,
    },
    /// The lock was taken. `log` carries the sink outcome; a failed append
    /// does not undo the lock.
    Committed {
        event: AttendanceEvent,
        log: Result<LogId, SinkError>,
    },
}

#[derive(Debug)]
pub struct TickReport {
    pub decision: Decision,
    /// Identity whose lock was released on this tick.
    pub released: Option<String>,
}

impl TickReport {
    pub fn committed(&self) -> Option<&AttendanceEvent> {
        match &self.decision {
            Decision::Committed { event, .. } => Some(event),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastMatch {
    pub matched: bool,
    pub identity_id: Option<String>,
    pub display_name: Option<String>,
    pub score: f32,
}

/// Owned copy of the session state for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub camera_id: String,
    pub policy: CommitPolicy,
    pub locked_identity: Option<String>,
    pub commit_count: u64,
    pub last_match: Option<LastMatch>,
    pub last_event: Option<AttendanceEvent>,
    pub last_log_error: Option<String>,
}

/// Recognition session for one camera.
pub struct RecognitionSession {
    camera_id: String,
    config: SessionConfig,
    policy: CommitPolicy,
    lock: LockState,
    last_commit: Option<(String, Instant)>,
    commit_count: u64,
    last_match: Option<LastMatch>,
    last_event: Option<AttendanceEvent>,
    last_log_error: Option<String>,
}

impl RecognitionSession {
    pub fn new(
        camera_id: impl Into<String>,
        config: SessionConfig,
        policy: CommitPolicy,
    ) -> Result<Self, EventError> {
        let camera_id = camera_id.into();
        if camera_id.trim().is_empty() {
            return Err(EventError::EmptyCamera);
        }
        Ok(Self {
            camera_id,
            config,
            policy,
            lock: LockState::Unlocked,
            last_commit: None,
            commit_count: 0,
            last_match: None,
            last_event: None,
            last_log_error: None,
        })
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn lock_state(&self) -> &LockState {
        &self.lock
    }

    pub fn locked_identity(&self) -> Option<&str> {
        match &self.lock {
            LockState::Locked { identity_id, .. } => Some(identity_id),
            LockState::Unlocked => None,
        }
    }

    pub fn policy(&self) -> CommitPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: CommitPolicy) {
        self.policy = policy;
    }

    pub fn commit_count(&self) -> u64 {
        self.commit_count
    }

    /// Operator reset of the commit counter used by [`CommitPolicy::Alternating`].
    pub fn reset_counter(&mut self) {
        self.commit_count = 0;
    }

    /// Drop the lock if `identity_id` holds it, for an identity that was
    /// deleted or deactivated. Returns whether a lock was dropped.
    ///
    /// The repeat gate still applies to the identity's last commit.
    pub fn release_identity(&mut self, identity_id: &str) -> bool {
        if self.locked_identity() != Some(identity_id) {
            return false;
        }
        tracing::info!(identity = %identity_id, camera = %self.camera_id, "lock dropped for withdrawn identity");
        self.lock = LockState::Unlocked;
        true
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            camera_id: self.camera_id.clone(),
            policy: self.policy,
            locked_identity: self.locked_identity().map(str::to_owned),
            commit_count: self.commit_count,
            last_match: self.last_match.clone(),
            last_event: self.last_event.clone(),
            last_log_error: self.last_log_error.clone(),
        }
    }

    /// Advance the session by one recognition tick.
    ///
    /// `observation` is `None` when the tick produced nothing (no new frame,
    /// no face, extraction error); that is handled like an unmatched result.
    pub fn tick(
        &mut self,
        observation: Option<&Observation>,
        now: Instant,
        sink: &dyn AttendanceSink,
    ) -> TickReport {
        self.last_match = observation.map(|o| LastMatch {
            matched: o.result.matched,
            identity_id: o.result.identity_id.clone(),
            display_name: o.result.display_name.clone(),
            score: o.result.score,
        });

        let candidate = observation
            .filter(|o| o.result.matched)
            .and_then(|o| o.result.identity_id.as_deref().map(|id| (id.to_owned(), o)));

        let decision = match candidate {
            None => Decision::NoMatch,
            Some((identity_id, _)) if self.locked_identity() == Some(identity_id.as_str()) => {
                self.refresh(now);
                Decision::Refreshed { identity_id }
            }
            Some((identity_id, obs)) => match self.gate(&identity_id, obs, now) {
                Err(reason) => {
                    tracing::debug!(identity = %identity_id, ?reason, "commit suppressed");
                    Decision::Suppressed {
                        identity_id,
                        reason,
                    }
                }
                Ok(()) => self.commit(identity_id, obs, now, sink),
            },
        };

        let released = match decision {
            Decision::Committed { .. } | Decision::Refreshed { .. } => None,
            _ => self.check_release(now),
        };

        TickReport { decision, released }
    }

    fn refresh(&mut self, now: Instant) {
        if let LockState::Locked {
            last_seen,
            absent_since,
            ..
        } = &mut self.lock
        {
            *last_seen = now;
            *absent_since = None;
        }
    }

    fn gate(&self, identity_id: &str, obs: &Observation, now: Instant) -> Result<(), SuppressReason> {
        if now.saturating_duration_since(obs.observed_at) > self.config.freshness {
            return Err(SuppressReason::Stale);
        }
        if let Some((last_id, at)) = &self.last_commit {
            let since = now.saturating_duration_since(*at);
            if since < self.config.min_commit_interval {
                return Err(SuppressReason::Spam);
            }
            if last_id == identity_id && since < self.config.unlock_after {
                return Err(SuppressReason::Repeat);
            }
        }
        Ok(())
    }

    fn commit(
        &mut self,
        identity_id: String,
        obs: &Observation,
        now: Instant,
        sink: &dyn AttendanceSink,
    ) -> Decision {
        let ordinal = self.commit_count + 1;
        let event = match AttendanceEvent::new(
            identity_id.clone(),
            obs.result.display_name.clone(),
            self.policy.kind_for(ordinal),
            self.camera_id.clone(),
            Utc::now(),
            obs.result.confidence(),
        ) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(identity = %identity_id, error = %e, "could not build attendance event");
                return Decision::Suppressed {
                    identity_id,
                    reason: SuppressReason::Invalid,
                };
            }
        };

        let log = sink.append(&event);
        match &log {
            Ok(log_id) => {
                tracing::info!(
                    identity = %identity_id,
                    kind = %event.kind(),
                    camera = %self.camera_id,
                    confidence = event.confidence(),
                    log_id,
                    "attendance committed"
                );
                self.last_log_error = None;
            }
            Err(e) => {
                tracing::warn!(identity = %identity_id, error = %e, "attendance append failed; lock kept");
                self.last_log_error = Some(e.to_string());
            }
        }

        self.commit_count = ordinal;
        self.last_commit = Some((identity_id.clone(), now));
        self.lock = LockState::Locked {
            identity_id,
            last_seen: now,
            absent_since: None,
        };
        self.last_event = Some(event.clone());

        Decision::Committed { event, log }
    }

    fn check_release(&mut self, now: Instant) -> Option<String> {
        let LockState::Locked {
            identity_id,
            absent_since,
            ..
        } = &mut self.lock
        else {
            return None;
        };
        let since = *absent_since.get_or_insert(now);
        if now.saturating_duration_since(since) < self.config.unlock_after {
            return None;
        }
        let released = identity_id.clone();
        tracing::info!(identity = %released, camera = %self.camera_id, "lock released");
        self.lock = LockState::Unlocked;
        Some(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::types::Metric;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSink {
        events: RefCell<Vec<AttendanceEvent>>,
        fail: bool,
    }

    impl AttendanceSink for RecordingSink {
        fn append(&self, event: &AttendanceEvent) -> Result<LogId, SinkError> {
            if self.fail {
                return Err(SinkError::Unavailable("db down".into()));
            }
            let mut events = self.events.borrow_mut();
            events.push(event.clone());
            Ok(events.len() as LogId)
        }
    }

    struct Clock(Instant);

    impl Clock {
        fn at(&self, secs: f64) -> Instant {
            self.0 + Duration::from_secs_f64(secs)
        }
    }

    fn seen(id: &str, at: Instant) -> Observation {
        Observation {
            result: MatchResult {
                matched: true,
                identity_id: Some(id.into()),
                display_name: Some(id.into()),
                score: 0.3,
                metric: Metric::L2,
                skipped: 0,
            },
            observed_at: at,
        }
    }

    fn unmatched(at: Instant) -> Observation {
        Observation {
            result: MatchResult::no_match(Metric::L2, 1.2, 0),
            observed_at: at,
        }
    }

    fn session() -> RecognitionSession {
        RecognitionSession::new("CAM_01", SessionConfig::default(), CommitPolicy::default()).unwrap()
    }

    #[test]
    fn test_rejects_empty_camera() {
        assert!(RecognitionSession::new("", SessionConfig::default(), CommitPolicy::default()).is_err());
    }

    #[test]
    fn test_lock_lifecycle_scenario() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let mut s = session();

        let r = s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(0.0), &sink);
        let event = r.committed().expect("first sighting commits");
        assert_eq!(event.identity_id(), "alice");
        assert_eq!(event.kind(), EventKind::CheckIn);
        assert!((event.confidence() - 0.7).abs() < 1e-6);
        assert_eq!(s.locked_identity(), Some("alice"));

        let r = s.tick(Some(&seen("alice", clock.at(0.5))), clock.at(0.5), &sink);
        assert!(matches!(r.decision, Decision::Refreshed { .. }));

        for t in [1.0, 2.0, 3.0, 4.0, 5.0, 5.9] {
            let r = s.tick(None, clock.at(t), &sink);
            assert!(matches!(r.decision, Decision::NoMatch));
            assert_eq!(r.released, None, "still locked at t={t}");
            assert_eq!(s.locked_identity(), Some("alice"));
        }

        let r = s.tick(None, clock.at(6.0), &sink);
        assert_eq!(r.released.as_deref(), Some("alice"));
        assert_eq!(*s.lock_state(), LockState::Unlocked);
        assert_eq!(sink.events.borrow().len(), 1);
    }

    #[test]
    fn test_continuous_presence_commits_once() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let mut s = session();

        for i in 0..40 {
            let t = clock.at(i as f64 * 0.5);
            s.tick(Some(&seen("alice", t)), t, &sink);
        }
        assert_eq!(sink.events.borrow().len(), 1);
        assert_eq!(s.commit_count(), 1);
    }

    #[test]
    fn test_unmatched_result_does_not_refresh_lock() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let mut s = session();

        s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(0.0), &sink);
        s.tick(Some(&unmatched(clock.at(1.0))), clock.at(1.0), &sink);
        let r = s.tick(Some(&unmatched(clock.at(6.0))), clock.at(6.0), &sink);
        assert_eq!(r.released.as_deref(), Some("alice"));
    }

    #[test]
    fn test_release_while_others_matched() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let config = SessionConfig {
            min_commit_interval: Duration::from_secs(100),
            ..SessionConfig::default()
        };
        let mut s = RecognitionSession::new("CAM_01", config, CommitPolicy::default()).unwrap();

        s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(0.0), &sink);
        // bob keeps appearing but the spam gate blocks him, so alice is absent
        let r = s.tick(Some(&seen("bob", clock.at(1.0))), clock.at(1.0), &sink);
        assert!(matches!(
            r.decision,
            Decision::Suppressed { reason: SuppressReason::Spam, .. }
        ));
        assert_eq!(r.released, None);
        let r = s.tick(Some(&seen("bob", clock.at(6.0))), clock.at(6.0), &sink);
        assert_eq!(r.released.as_deref(), Some("alice"));
        assert_eq!(s.locked_identity(), None);
    }

    #[test]
    fn test_spam_gate_suppresses_different_identity() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let mut s = session();

        s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(0.0), &sink);
        let r = s.tick(Some(&seen("bob", clock.at(0.4))), clock.at(0.4), &sink);
        assert!(matches!(
            r.decision,
            Decision::Suppressed { reason: SuppressReason::Spam, .. }
        ));

        let r = s.tick(Some(&seen("bob", clock.at(1.0))), clock.at(1.0), &sink);
        assert_eq!(r.committed().map(|e| e.identity_id()), Some("bob"));
        assert_eq!(s.locked_identity(), Some("bob"));
        assert_eq!(sink.events.borrow().len(), 2);
    }

    #[test]
    fn test_repeat_gate_after_lock_moved() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let mut s = session();

        s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(0.0), &sink);
        s.tick(Some(&seen("bob", clock.at(1.5))), clock.at(1.5), &sink);
        // alice was committed 3s ago but the last commit is bob's, so no repeat
        let r = s.tick(Some(&seen("alice", clock.at(3.0))), clock.at(3.0), &sink);
        assert!(r.committed().is_some());

        s.tick(Some(&seen("bob", clock.at(4.0))), clock.at(4.0), &sink);
        // bob holds the lock now

        let r = s.tick(Some(&seen("bob", clock.at(4.5))), clock.at(4.5), &sink);
        assert!(matches!(r.decision, Decision::Refreshed { .. }));
        assert_eq!(sink.events.borrow().len(), 4);
    }

    #[test]
    fn test_repeat_gate_blocks_recommit_after_early_release() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let config = SessionConfig {
            unlock_after: Duration::from_secs(5),
            ..SessionConfig::default()
        };
        let mut s = RecognitionSession::new("CAM_01", config, CommitPolicy::default()).unwrap();

        s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(0.0), &sink);
        // lock forcibly dropped (e.g. transferred and released) while alice was last commit
        s.lock = LockState::Unlocked;
        let r = s.tick(Some(&seen("alice", clock.at(2.0))), clock.at(2.0), &sink);
        assert!(matches!(
            r.decision,
            Decision::Suppressed { reason: SuppressReason::Repeat, .. }
        ));
        let r = s.tick(Some(&seen("alice", clock.at(5.0))), clock.at(5.0), &sink);
        assert!(r.committed().is_some());
    }

    #[test]
    fn test_release_identity_only_drops_matching_lock() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let mut s = session();

        assert!(!s.release_identity("alice"));
        s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(0.0), &sink);
        assert!(!s.release_identity("bob"));
        assert_eq!(s.locked_identity(), Some("alice"));

        assert!(s.release_identity("alice"));
        assert_eq!(*s.lock_state(), LockState::Unlocked);
        assert_eq!(s.snapshot().locked_identity, None);

        let r = s.tick(Some(&seen("alice", clock.at(1.5))), clock.at(1.5), &sink);
        assert!(matches!(
            r.decision,
            Decision::Suppressed { reason: SuppressReason::Repeat, .. }
        ));
    }

    #[test]
    fn test_stale_observation_not_committed() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let mut s = session();

        let r = s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(2.5), &sink);
        assert!(matches!(
            r.decision,
            Decision::Suppressed { reason: SuppressReason::Stale, .. }
        ));
        assert!(sink.events.borrow().is_empty());
        assert_eq!(s.locked_identity(), None);
    }

    #[test]
    fn test_sink_failure_keeps_lock() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let mut s = session();

        let r = s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(0.0), &sink);
        match r.decision {
            Decision::Committed { log, .. } => assert!(log.is_err()),
            other => panic!("expected commit, got {other:?}"),
        }
        assert_eq!(s.locked_identity(), Some("alice"));
        assert!(s.snapshot().last_log_error.is_some());

        let r = s.tick(Some(&seen("alice", clock.at(0.5))), clock.at(0.5), &sink);
        assert!(matches!(r.decision, Decision::Refreshed { .. }));
    }

    #[test]
    fn test_alternating_policy_and_reset() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let mut s = RecognitionSession::new("CAM_01", SessionConfig::default(), CommitPolicy::Alternating)
            .unwrap();

        let kinds: Vec<EventKind> = [("alice", 0.0), ("bob", 1.0), ("carol", 2.0)]
            .iter()
            .filter_map(|(id, t)| {
                s.tick(Some(&seen(id, clock.at(*t))), clock.at(*t), &sink)
                    .committed()
                    .map(|e| e.kind())
            })
            .collect();
        assert_eq!(kinds, vec![EventKind::CheckIn, EventKind::CheckOut, EventKind::CheckIn]);

        s.reset_counter();
        assert_eq!(s.commit_count(), 0);
        let r = s.tick(Some(&seen("dave", clock.at(3.0))), clock.at(3.0), &sink);
        assert_eq!(r.committed().map(|e| e.kind()), Some(EventKind::CheckIn));
    }

    #[test]
    fn test_fixed_check_out_policy() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let mut s = session();
        s.set_policy(CommitPolicy::Fixed(EventKind::CheckOut));

        let r = s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(0.0), &sink);
        assert_eq!(r.committed().map(|e| e.kind()), Some(EventKind::CheckOut));
    }

    #[test]
    fn test_snapshot_is_owned_copy() {
        let clock = Clock(Instant::now());
        let sink = RecordingSink::default();
        let mut s = session();

        let before = s.snapshot();
        s.tick(Some(&seen("alice", clock.at(0.0))), clock.at(0.0), &sink);
        let after = s.snapshot();

        assert_eq!(before.locked_identity, None);
        assert_eq!(after.locked_identity.as_deref(), Some("alice"));
        assert_eq!(after.commit_count, 1);
        assert_ne!(before, after);
        assert!(serde_json::to_string(&after).unwrap().contains("\"CHECK_IN\""));
    }
}
