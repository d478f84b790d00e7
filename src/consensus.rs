//! Per-session decision state.
//!
//! [`AuthSession`] only counts. It never touches the camera, the encoder or
//! the store: the session loop turns each decision cycle into an
//! [`Observation`] and feeds it to [`AuthSession::decide`], which answers
//! whether to keep going.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "identity", rename_all = "snake_case")]
pub enum AuthMode {
    /// 1:1 against the named identity's template.
    Verify(String),
    /// 1:N against every enrolled template.
    Identify,
    /// Enrol a new template for the named identity.
    Register(String),
}

impl AuthMode {
    pub fn is_register(&self) -> bool {
        matches!(self, Self::Register(_))
    }
}

/// What one decision cycle saw.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    NoFace,
    MultipleFaces,
    EncodingFailed,
    /// A face was encoded but nothing was close enough.
    Rejected { similarity: f32 },
    /// Verify/Identify hit.
    Matched { identity: String, similarity: f32 },
    /// Register: the encoding is not close to any other identity.
    Enrollable,
    /// Register: the encoding already belongs to `identity`.
    Duplicate { identity: String, similarity: f32 },
}

impl Observation {
    pub fn confidence(&self) -> f32 {
        match self {
            Self::NoFace | Self::MultipleFaces | Self::EncodingFailed => 0.0,
            Self::Enrollable => 1.0,
            Self::Rejected { similarity }
            | Self::Matched { similarity, .. }
            | Self::Duplicate { similarity, .. } => similarity.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SessionOutcome {
    Success(String),
    Timeout,
    /// Registration refused: the face is enrolled under this identity.
    Duplicate(String),
    Cancelled,
    /// The session broke for a reason unrelated to what the camera saw.
    Failed(String),
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Idle,
    Capturing,
    Deciding,
    Finished(SessionOutcome),
}

/// Feedback for one decision cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub status: String,
    pub confidence: f32,
    pub attempt: u32,
}

/// Result of one decision cycle. Both variants carry the cycle's feedback.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Retry(Progress),
    Done(Progress, SessionOutcome),
}

impl Step {
    pub fn progress(&self) -> &Progress {
        match self {
            Self::Retry(progress) | Self::Done(progress, _) => progress,
        }
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        match self {
            Self::Retry(_) => None,
            Self::Done(_, outcome) => Some(outcome),
        }
    }
}

pub const POSITION_FACE: &str = "Position your face in front of the camera";

#[derive(Debug, Clone)]
pub struct AuthSession {
    mode: AuthMode,
    state: State,
    attempts: u32,
    max_attempts: u32,
    consensus_required: u32,
    consecutive_matches: u32,
    last_matched_identity: Option<String>,
    started_at: Option<Instant>,
}

impl AuthSession {
    /// `max_attempts` and `consensus_required` are raised to at least 1.
    pub fn new(mode: AuthMode, max_attempts: u32, consensus_required: u32) -> Self {
        Self {
            mode,
            state: State::Idle,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            consensus_required: consensus_required.max(1),
            consecutive_matches: 0,
            last_matched_identity: None,
            started_at: None,
        }
    }

    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn consecutive_matches(&self) -> u32 {
        self.consecutive_matches
    }

    pub fn last_matched_identity(&self) -> Option<&str> {
        self.last_matched_identity.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished(_))
    }

    /// Idle → Capturing. No-op in any other state.
    pub fn start(&mut self) {
        if self.state == State::Idle {
            self.state = State::Capturing;
            self.started_at = Some(Instant::now());
        }
    }

    /// Any state → Idle. Returns [`SessionOutcome::Cancelled`], or the
    /// outcome already reached if the session had finished.
    pub fn cancel(&mut self) -> SessionOutcome {
        let outcome = match &self.state {
            State::Finished(outcome) => outcome.clone(),
            _ => SessionOutcome::Cancelled,
        };
        self.state = State::Idle;
        outcome
    }

    /// Account one decision cycle. Every call consumes an attempt.
    ///
    /// Calling this on a finished session returns the same outcome again
    /// without counting.
    pub fn decide(&mut self, observation: Observation) -> Step {
        match &self.state {
            State::Finished(outcome) => {
                let outcome = outcome.clone();
                let progress = Progress {
                    status: outcome_text(&outcome),
                    confidence: 0.0,
                    attempt: self.attempts,
                };
                return Step::Done(progress, outcome);
            }
            State::Idle => self.start(),
            State::Capturing | State::Deciding => {}
        }
        self.state = State::Deciding;
        self.attempts += 1;
        let confidence = observation.confidence();

        let (status, outcome) = match observation {
            Observation::Matched { identity, .. } if !self.mode.is_register() => {
                if self.last_matched_identity.as_deref() == Some(identity.as_str()) {
                    self.consecutive_matches += 1;
                } else {
                    self.consecutive_matches = 1;
                    self.last_matched_identity = Some(identity.clone());
                }
                let status = format!(
                    "Face detected ({}/{})",
                    self.consecutive_matches, self.consensus_required
                );
                let reached = self.consecutive_matches >= self.consensus_required;
                (status, reached.then(|| SessionOutcome::Success(identity)))
            }
            Observation::Enrollable => match &self.mode {
                AuthMode::Register(identity) => (
                    "Face captured".to_string(),
                    Some(SessionOutcome::Success(identity.clone())),
                ),
                _ => (self.miss("Face does not match"), None),
            },
            Observation::Duplicate { identity, .. } if self.mode.is_register() => (
                format!("This face is already registered to {identity}"),
                Some(SessionOutcome::Duplicate(identity)),
            ),
            Observation::NoFace => (self.miss("No face detected"), None),
            Observation::MultipleFaces => (self.miss("Multiple faces detected"), None),
            Observation::EncodingFailed => (self.miss("Could not extract face features"), None),
            Observation::Rejected { .. }
            | Observation::Matched { .. }
            | Observation::Duplicate { .. } => (self.miss("Face does not match"), None),
        };

        let progress = Progress {
            status,
            confidence,
            attempt: self.attempts,
        };
        // A decisive cycle wins over running out of attempts
        let outcome = outcome
            .or_else(|| (self.attempts >= self.max_attempts).then_some(SessionOutcome::Timeout));
        match outcome {
            Some(outcome) => self.finish(progress, outcome),
            None => {
                self.state = State::Capturing;
                Step::Retry(progress)
            }
        }
    }

    fn miss(&mut self, status: &str) -> String {
        self.consecutive_matches = 0;
        self.last_matched_identity = None;
        status.to_string()
    }

    fn finish(&mut self, progress: Progress, outcome: SessionOutcome) -> Step {
        log::debug!(
            "session {:?} finished after {} attempts: {:?}",
            self.mode,
            self.attempts,
            outcome
        );
        self.state = State::Finished(outcome.clone());
        Step::Done(progress, outcome)
    }
}

/// Text shown for a terminal outcome.
pub fn outcome_text(outcome: &SessionOutcome) -> String {
    match outcome {
        SessionOutcome::Success(identity) => format!("Recognized {identity}"),
        SessionOutcome::Timeout => "Face not recognized, giving up".to_string(),
        SessionOutcome::Duplicate(identity) => {
            format!("This face is already registered to {identity}")
        }
        SessionOutcome::Cancelled => "Cancelled".to_string(),
        SessionOutcome::Failed(reason) => format!("Error: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(identity: &str) -> Observation {
        Observation::Matched {
            identity: identity.to_string(),
            similarity: 0.9,
        }
    }

    fn run(session: &mut AuthSession, cycles: Vec<Observation>) -> Vec<Step> {
        session.start();
        cycles.into_iter().map(|o| session.decide(o)).collect()
    }

    #[test]
    fn interrupted_streak_succeeds_on_sixth_cycle() {
        let mut session = AuthSession::new(AuthMode::Verify("alice".into()), 40, 3);
        let steps = run(
            &mut session,
            vec![
                hit("alice"),
                hit("alice"),
                Observation::Rejected { similarity: 0.2 },
                hit("alice"),
                hit("alice"),
                hit("alice"),
            ],
        );
        assert!(steps[..5].iter().all(|s| matches!(s, Step::Retry(_))));
        assert_eq!(steps[5].outcome(), Some(&SessionOutcome::Success("alice".into())));
        assert_eq!(steps[5].progress().status, "Face detected (3/3)");
        assert_eq!(steps[5].progress().attempt, 6);
        assert_eq!(session.attempts(), 6);
    }

    #[test]
    fn switching_identity_restarts_streak_at_one() {
        let mut session = AuthSession::new(AuthMode::Identify, 40, 3);
        run(&mut session, vec![hit("alice"), hit("alice"), hit("bob")]);
        assert_eq!(session.consecutive_matches(), 1);
        assert_eq!(session.last_matched_identity(), Some("bob"));
    }

    #[test]
    fn miss_clears_streak() {
        let mut session = AuthSession::new(AuthMode::Identify, 40, 3);
        run(&mut session, vec![hit("alice"), Observation::MultipleFaces]);
        assert_eq!(session.consecutive_matches(), 0);
        assert_eq!(session.last_matched_identity(), None);
    }

    #[test]
    fn times_out_after_exactly_max_attempts() {
        let mut session = AuthSession::new(AuthMode::Verify("alice".into()), 5, 3);
        session.start();
        for n in 1..=4 {
            match session.decide(Observation::NoFace) {
                Step::Retry(p) => {
                    assert_eq!(p.attempt, n);
                    assert_eq!(p.status, "No face detected");
                    assert_eq!(p.confidence, 0.0);
                }
                other => panic!("cycle {n}: {other:?}"),
            }
        }
        assert_eq!(
            session.decide(Observation::NoFace),
            Step::Done(
                Progress {
                    status: "No face detected".into(),
                    confidence: 0.0,
                    attempt: 5,
                },
                SessionOutcome::Timeout
            )
        );
        assert_eq!(session.attempts(), 5);
        // A finished session does not count further cycles
        let again = session.decide(hit("alice"));
        assert_eq!(again.outcome(), Some(&SessionOutcome::Timeout));
        assert_eq!(again.progress().attempt, 5);
        assert_eq!(session.attempts(), 5);
    }

    #[test]
    fn success_on_last_attempt_beats_timeout() {
        let mut session = AuthSession::new(AuthMode::Verify("alice".into()), 3, 3);
        let steps = run(&mut session, vec![hit("alice"), hit("alice"), hit("alice")]);
        assert_eq!(
            steps[2],
            Step::Done(
                Progress {
                    status: "Face detected (3/3)".into(),
                    confidence: 0.9,
                    attempt: 3,
                },
                SessionOutcome::Success("alice".into())
            )
        );
    }

    #[test]
    fn register_succeeds_on_first_enrollable_cycle() {
        let mut session = AuthSession::new(AuthMode::Register("carol".into()), 40, 3);
        let steps = run(&mut session, vec![Observation::NoFace, Observation::Enrollable]);
        assert!(matches!(steps[0], Step::Retry(_)));
        assert_eq!(steps[1].outcome(), Some(&SessionOutcome::Success("carol".into())));
        assert_eq!(steps[1].progress().status, "Face captured");
        assert_eq!(steps[1].progress().confidence, 1.0);
    }

    #[test]
    fn register_duplicate_is_terminal() {
        let mut session = AuthSession::new(AuthMode::Register("bob".into()), 40, 3);
        let steps = run(
            &mut session,
            vec![Observation::Duplicate {
                identity: "alice".into(),
                similarity: 0.95,
            }],
        );
        assert_eq!(steps[0].outcome(), Some(&SessionOutcome::Duplicate("alice".into())));
        assert_eq!(
            steps[0].progress().status,
            "This face is already registered to alice"
        );
        assert!(session.is_finished());
    }

    #[test]
    fn progress_reports_streak_and_similarity() {
        let mut session = AuthSession::new(AuthMode::Verify("alice".into()), 40, 3);
        let steps = run(&mut session, vec![hit("alice")]);
        assert_eq!(
            steps[0],
            Step::Retry(Progress {
                status: "Face detected (1/3)".into(),
                confidence: 0.9,
                attempt: 1,
            })
        );
        assert_eq!(session.state(), &State::Capturing);
    }

    #[test]
    fn cancel_returns_to_idle() {
        let mut session = AuthSession::new(AuthMode::Identify, 40, 3);
        session.start();
        assert_eq!(session.cancel(), SessionOutcome::Cancelled);
        assert_eq!(session.state(), &State::Idle);

        let mut done = AuthSession::new(AuthMode::Register("x".into()), 40, 1);
        done.decide(Observation::Enrollable);
        assert_eq!(done.cancel(), SessionOutcome::Success("x".into()));
    }

    #[test]
    fn outcome_serializes_tagged() {
        let json = serde_json::to_string(&SessionOutcome::Duplicate("alice".into())).unwrap();
        assert_eq!(json, r#"{"outcome":"duplicate","detail":"alice"}"#);
        let json = serde_json::to_string(&SessionOutcome::Timeout).unwrap();
        assert_eq!(json, r#"{"outcome":"timeout"}"#);
    }
}
