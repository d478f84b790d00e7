//! Running authentication sessions.
//!
//! A session owns the camera for its whole lifetime. A supervisor thread
//! runs two scoped workers: the preview loop publishes frames into a
//! [`FrameBroadcaster`] at the preview rate, the decision loop takes the
//! latest one at the verify/register rate and drives an [`AuthSession`].
//! Both workers are joined before the camera is closed.

use std::any::Any;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use facegate_vision::{EncodeOutcome, Encoding, EncoderSettings, FaceEncoder, Frame, OnnxFaceEncoder};
use serde::Serialize;
use thiserror::Error;

use crate::broadcast::FrameBroadcaster;
use crate::camera::{CameraDevice, CameraError, CameraSource};
use crate::config::{Config, SessionConfig};
use crate::consensus::{self, AuthMode, AuthSession, Observation, SessionOutcome, Step};
use crate::identity::{CredentialStore, SystemAccounts};
use crate::matcher::{MatchResult, MatchingEngine};
use crate::storage::{FaceTemplate, FileTemplateStore, TemplateStore};

/// Failures that keep a session from starting. Nothing is left running.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error("unknown user {0}")]
    UnknownIdentity(String),

    #[error("no face enrolled for {0}")]
    NotEnrolled(String),

    #[error("no faces enrolled")]
    NoTemplates,

    #[error("failed to initialise face encoder: {0:#}")]
    Encoder(anyhow::Error),

    #[error("template store: {0:#}")]
    Store(anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Progress {
        status: String,
        confidence: f32,
        attempt: u32,
    },
    Finished {
        #[serde(flatten)]
        outcome: SessionOutcome,
    },
}

/// Builds one encoder per session. Encoders carry mutable inference state
/// and are never shared between sessions.
pub trait EncoderFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn FaceEncoder>>;
}

impl<F> EncoderFactory for F
where
    F: Fn() -> Result<Box<dyn FaceEncoder>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn FaceEncoder>> {
        self()
    }
}

/// YuNet + SFace from the configured model files.
#[derive(Debug, Clone)]
pub struct OnnxEncoders {
    detector: PathBuf,
    recognizer: PathBuf,
    settings: EncoderSettings,
}

impl OnnxEncoders {
    pub fn from_config(config: &Config) -> Self {
        Self {
            detector: config.detector_model.clone(),
            recognizer: config.recognizer_model.clone(),
            settings: config.encoder.into(),
        }
    }
}

impl EncoderFactory for OnnxEncoders {
    fn create(&self) -> Result<Box<dyn FaceEncoder>> {
        let encoder = OnnxFaceEncoder::from_models(&self.detector, &self.recognizer, self.settings)?;
        Ok(Box::new(encoder))
    }
}

/// Entry point for verify, identify and register sessions.
#[derive(Clone)]
pub struct Authenticator {
    session: SessionConfig,
    engine: MatchingEngine,
    camera: Arc<CameraDevice>,
    encoders: Arc<dyn EncoderFactory>,
    store: Arc<dyn TemplateStore>,
    credentials: Arc<dyn CredentialStore>,
}

impl Authenticator {
    pub fn new(
        config: &Config,
        camera: Arc<CameraDevice>,
        encoders: Arc<dyn EncoderFactory>,
        store: Arc<dyn TemplateStore>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            session: config.session.clone(),
            engine: MatchingEngine::new(config.matching),
            camera,
            encoders,
            store,
            credentials,
        }
    }

    /// V4L camera, ONNX models, file store under the default prefix and the
    /// system account database.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config,
            Arc::new(CameraDevice::v4l(
                config.camera.clone(),
                config.session.capture_timeout(),
            )),
            Arc::new(OnnxEncoders::from_config(config)),
            Arc::new(FileTemplateStore::default()),
            Arc::new(SystemAccounts),
        )
    }

    pub fn store(&self) -> &Arc<dyn TemplateStore> {
        &self.store
    }

    pub fn start_verify(&self, username: &str) -> Result<SessionHandle, SessionError> {
        let identity = self
            .credentials
            .resolve_identity(username)
            .ok_or_else(|| SessionError::UnknownIdentity(username.to_string()))?;
        let template = self
            .store
            .get(&identity.username)
            .map_err(SessionError::Store)?
            .ok_or_else(|| SessionError::NotEnrolled(identity.username.clone()))?;
        self.launch(AuthMode::Verify(identity.username), Some(template))
    }

    pub fn start_identify(&self) -> Result<SessionHandle, SessionError> {
        if self.store.all().map_err(SessionError::Store)?.is_empty() {
            return Err(SessionError::NoTemplates);
        }
        self.launch(AuthMode::Identify, None)
    }

    pub fn start_register(&self, identity: &str) -> Result<SessionHandle, SessionError> {
        self.launch(AuthMode::Register(identity.to_string()), None)
    }

    fn launch(&self, mode: AuthMode, target: Option<FaceTemplate>) -> Result<SessionHandle, SessionError> {
        let encoder = self.encoders.create().map_err(SessionError::Encoder)?;
        let camera = self.camera.open()?;
        log::info!("starting {mode:?} session on {}", camera.device());

        let stop = Arc::new(StopSignal::default());
        let (events, receiver) = mpsc::channel();
        let worker = Worker {
            mode,
            target,
            session: self.session.clone(),
            engine: self.engine,
            store: Arc::clone(&self.store),
            encoder,
            events,
        };
        let supervisor = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("facegate-session".into())
                .spawn(move || worker.supervise(camera, &stop))
        };
        let supervisor = match supervisor {
            Ok(handle) => handle,
            // The closure, and the camera with it, was dropped with the error
            Err(e) => {
                return Err(SessionError::Camera(CameraError::DeviceFailure {
                    device: self.camera.path().to_string(),
                    reason: format!("spawning session thread: {e}"),
                }))
            }
        };

        Ok(SessionHandle {
            stop,
            events: receiver,
            supervisor: Some(supervisor),
        })
    }
}

/// A running session. Dropping it cancels the session and waits for the
/// camera to be released.
pub struct SessionHandle {
    stop: Arc<StopSignal>,
    events: Receiver<SessionEvent>,
    supervisor: Option<JoinHandle<SessionOutcome>>,
}

impl SessionHandle {
    /// Per-cycle progress followed by exactly one [`SessionEvent::Finished`].
    pub fn events(&self) -> &Receiver<SessionEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.supervisor.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Block until the session ends on its own.
    pub fn wait(mut self) -> SessionOutcome {
        self.join()
    }

    /// Stop both loops and release the camera. Returns the outcome the
    /// session had already reached, or [`SessionOutcome::Cancelled`].
    pub fn cancel(mut self) -> SessionOutcome {
        self.stop.stop();
        self.join()
    }

    fn join(&mut self) -> SessionOutcome {
        match self.supervisor.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|panic| SessionOutcome::Failed(panic_message(&*panic))),
            None => SessionOutcome::Cancelled,
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.supervisor.is_some() {
            self.stop.stop();
            self.join();
        }
    }
}

/// Stop flag whose waits wake up as soon as it is raised.
#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `timeout` or until stopped. Returns whether stopped.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

struct Worker {
    mode: AuthMode,
    target: Option<FaceTemplate>,
    session: SessionConfig,
    engine: MatchingEngine,
    store: Arc<dyn TemplateStore>,
    encoder: Box<dyn FaceEncoder>,
    events: Sender<SessionEvent>,
}

impl Worker {
    fn supervise(self, camera: CameraSource, stop: &StopSignal) -> SessionOutcome {
        let Worker {
            mode,
            target,
            session,
            engine,
            store,
            encoder,
            events,
        } = self;
        let frames = FrameBroadcaster::new();
        let mut decider = Decider {
            session: AuthSession::new(mode, session.max_attempts, session.consensus_required),
            target,
            engine,
            store,
            encoder,
        };
        let interval = if decider.session.mode().is_register() {
            session.register_interval()
        } else {
            session.verify_interval()
        };

        let outcome = thread::scope(|s| {
            let preview = s.spawn(|| preview_loop(&camera, &frames, stop, session.preview_interval()));
            let decision = s.spawn(|| {
                decider.run(&frames, stop, session.warmup(), interval, &events)
            });
            let outcome = decision
                .join()
                .unwrap_or_else(|panic| SessionOutcome::Failed(panic_message(&*panic)));
            stop.stop();
            if let Err(panic) = preview.join() {
                log::error!("preview loop panicked: {}", panic_message(&*panic));
            }
            outcome
        });
        camera.close();

        log::info!(
            "session finished: {outcome:?} ({} frames captured, {} dropped)",
            frames.published(),
            frames.dropped()
        );
        let _ = events.send(SessionEvent::Finished {
            outcome: outcome.clone(),
        });
        outcome
    }
}

fn preview_loop(camera: &CameraSource, frames: &FrameBroadcaster, stop: &StopSignal, interval: Duration) {
    while !stop.is_stopped() {
        if let Some(frame) = camera.grab() {
            frames.publish(frame);
        }
        if stop.wait(interval) {
            break;
        }
    }
}

struct Decider {
    session: AuthSession,
    target: Option<FaceTemplate>,
    engine: MatchingEngine,
    store: Arc<dyn TemplateStore>,
    encoder: Box<dyn FaceEncoder>,
}

impl Decider {
    fn run(
        &mut self,
        frames: &FrameBroadcaster,
        stop: &StopSignal,
        warmup: Duration,
        interval: Duration,
        events: &Sender<SessionEvent>,
    ) -> SessionOutcome {
        self.session.start();
        let _ = events.send(SessionEvent::Progress {
            status: consensus::POSITION_FACE.to_string(),
            confidence: 0.0,
            attempt: 0,
        });
        if stop.wait(warmup) {
            return self.session.cancel();
        }

        loop {
            if stop.is_stopped() {
                return self.session.cancel();
            }
            // An empty slot costs nothing
            if let Some(frame) = frames.take_latest() {
                let (observation, encoding) = match self.observe(&frame) {
                    Ok(observed) => observed,
                    Err(e) => {
                        log::error!("decision cycle failed: {e:#}");
                        return SessionOutcome::Failed(format!("{e:#}"));
                    }
                };
                log::debug!("cycle {}: {observation:?}", self.session.attempts() + 1);
                let step = self.session.decide(observation);
                let progress = step.progress();
                let _ = events.send(SessionEvent::Progress {
                    status: progress.status.clone(),
                    confidence: progress.confidence,
                    attempt: progress.attempt,
                });
                if let Step::Done(_, outcome) = step {
                    return self.commit(outcome, encoding);
                }
            }
            if stop.wait(interval) {
                return self.session.cancel();
            }
        }
    }

    fn observe(&mut self, frame: &Frame) -> Result<(Observation, Option<Encoding>)> {
        let encoding = match self.encoder.detect_and_encode(frame) {
            EncodeOutcome::Found(encoding) => encoding,
            EncodeOutcome::NoFaceDetected => return Ok((Observation::NoFace, None)),
            EncodeOutcome::MultipleFacesDetected => return Ok((Observation::MultipleFaces, None)),
            EncodeOutcome::EncodingFailed => return Ok((Observation::EncodingFailed, None)),
        };

        let observation = match self.session.mode() {
            AuthMode::Verify(identity) => match &self.target {
                Some(template) => matched(self.engine.verify_result(&encoding, template)),
                None => anyhow::bail!("no template loaded for {identity}"),
            },
            AuthMode::Identify => {
                let templates = self.store.all()?;
                matched(self.engine.identify_result(&encoding, &templates))
            }
            AuthMode::Register(identity) => {
                let templates = self.store.all()?;
                let result = self.engine.registration_result(&encoding, &templates, identity);
                match result.is_duplicate_of {
                    Some(other) => Observation::Duplicate {
                        identity: other,
                        similarity: result.similarity,
                    },
                    None => Observation::Enrollable,
                }
            }
        };
        Ok((observation, Some(encoding)))
    }

    fn commit(&self, outcome: SessionOutcome, encoding: Option<Encoding>) -> SessionOutcome {
        let identity = match (&outcome, self.session.mode()) {
            (SessionOutcome::Success(identity), AuthMode::Register(_)) => identity.clone(),
            _ => return outcome,
        };
        let Some(encoding) = encoding else {
            return SessionOutcome::Failed(format!("no encoding captured for {identity}"));
        };
        // Another registration may have inserted the same face since the
        // duplicate scan above. The store offers no compare-and-insert, so
        // that window stays open.
        match self.store.insert(&identity, encoding) {
            Ok(_) => {
                log::info!("registered face for {identity}");
                outcome
            }
            Err(e) => {
                log::error!("storing template for {identity}: {e:#}");
                SessionOutcome::Failed(format!("storing template for {identity}: {e:#}"))
            }
        }
    }
}

fn matched(result: MatchResult) -> Observation {
    match result.identity {
        Some(identity) => Observation::Matched {
            identity,
            similarity: result.similarity,
        },
        None => Observation::Rejected {
            similarity: result.similarity,
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("session worker panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn stop_signal_wakes_waiter_early() {
        let stop = Arc::new(StopSignal::default());
        let waiter = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let started = Instant::now();
                (stop.wait(Duration::from_secs(30)), started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        stop.stop();
        let (stopped, waited) = waiter.join().unwrap();
        assert!(stopped);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn stop_signal_times_out_when_not_raised() {
        let stop = StopSignal::default();
        assert!(!stop.wait(Duration::from_millis(5)));
        assert!(!stop.is_stopped());
    }

    #[test]
    fn finished_event_flattens_outcome() {
        let event = SessionEvent::Finished {
            outcome: SessionOutcome::Success("alice".into()),
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"finished","outcome":"success","detail":"alice"}"#
        );
        let progress = SessionEvent::Progress {
            status: "No face detected".into(),
            confidence: 0.0,
            attempt: 2,
        };
        assert_eq!(
            serde_json::to_string(&progress).unwrap(),
            r#"{"event":"progress","status":"No face detected","confidence":0.0,"attempt":2}"#
        );
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert!(panic_message(&*payload).ends_with("boom"));
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert!(panic_message(&*payload).ends_with("bang"));
    }
}
