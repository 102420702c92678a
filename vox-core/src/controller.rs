//! Host-driven API: SessionController receives events from the host, returns actions.

use std::time::{Duration, Instant, SystemTime};

use tracing::{info, warn};

use crate::aggregator::{Aggregator, Closure, SessionState};
use crate::bridge::InferenceError;
use crate::fragment::{Fragment, FragmentError};
use crate::labels::{Command, Label};
use crate::record::{ClassificationResult, FailureReason};

/// Work handed to the inference bridge when a session assembles.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceJob {
    pub command: Command,
    pub waveform: Vec<i16>,
    /// Wall-clock receipt of the session's first fragment.
    pub received_at: SystemTime,
    pub fragments: usize,
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Run the hardware classification, then pass the outcome to `finish`.
    Dispatch(InferenceJob),
    /// Publish this record as-is.
    Publish(ClassificationResult),
}

/// Main coordinator: one aggregator slot plus the one-shot debug flag.
pub struct SessionController {
    aggregator: Aggregator,
    debug_armed: bool,
    sessions_closed: u64,
}

impl SessionController {
    pub fn new() -> Self {
        Self::with_aggregator(Aggregator::new())
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_aggregator(Aggregator::with_timeout(timeout))
    }

    fn with_aggregator(aggregator: Aggregator) -> Self {
        Self {
            aggregator,
            debug_armed: false,
            sessions_closed: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.aggregator.state()
    }

    /// Time until the running session's deadline (None when idle).
    pub fn deadline_in(&self, now: Instant) -> Option<Duration> {
        self.aggregator.remaining(now)
    }

    pub fn debug_armed(&self) -> bool {
        self.debug_armed
    }

    pub fn sessions_closed(&self) -> u64 {
        self.sessions_closed
    }

    /// Arm debug mode for the next classified session.
    pub fn on_debug_toggle(&mut self) {
        if !self.debug_armed {
            info!("debug mode armed for next session");
        }
        self.debug_armed = true;
    }

    /// Fragment received at `now`. An expired session is closed first, so the fragment
    /// starts a fresh one. Malformed payloads are rejected without touching the session.
    pub fn on_fragment(
        &mut self,
        now: Instant,
        wall: SystemTime,
        payload: &[u8],
    ) -> Result<Vec<Action>, FragmentError> {
        let fragment = Fragment::decode(payload)?;
        let mut actions = self.tick(now);
        if let Some(closure) = self.aggregator.on_fragment(now, wall, fragment) {
            actions.push(self.on_closure(closure));
        }
        Ok(actions)
    }

    /// Periodic tick: evaluate the session deadline.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        match self.aggregator.tick(now) {
            Some(closure) => vec![self.on_closure(closure)],
            None => Vec::new(),
        }
    }

    /// Turn an inference outcome into the session's record. Debug mode is consumed only by
    /// a successful classification.
    pub fn finish(
        &mut self,
        job: &InferenceJob,
        outcome: Result<Label, InferenceError>,
        sent_at: SystemTime,
    ) -> ClassificationResult {
        match outcome {
            Ok(result) if self.debug_armed => {
                self.debug_armed = false;
                info!(command = %job.command, %result, "debug session classified");
                ClassificationResult::debug(job.received_at, sent_at)
            }
            Ok(result) => ClassificationResult::Success {
                command: job.command,
                result,
            },
            Err(InferenceError::TimedOut(after)) => {
                warn!(?after, "inference timed out");
                ClassificationResult::Failed(FailureReason::InferenceTimeout)
            }
            Err(e) => {
                warn!(error = %e, "inference failed");
                ClassificationResult::Failed(FailureReason::Inference)
            }
        }
    }

    fn on_closure(&mut self, closure: Closure) -> Action {
        self.sessions_closed = self.sessions_closed.saturating_add(1);
        let fragments = closure.fragment_count();
        match closure {
            Closure::Incomplete { .. } => {
                warn!(fragments, "session expired incomplete");
                Action::Publish(ClassificationResult::Failed(FailureReason::Incomplete))
            }
            Closure::Assembled {
                command_code: None, ..
            } => {
                warn!(fragments, "session closed without a command sample");
                Action::Publish(ClassificationResult::Failed(FailureReason::MissingCommand))
            }
            Closure::Assembled {
                command_code: Some(code),
                waveform,
                received_at,
                ..
            } => match Command::from_code(code) {
                Some(command) => {
                    info!(fragments, %command, samples = waveform.len(), "session assembled");
                    Action::Dispatch(InferenceJob {
                        command,
                        waveform,
                        received_at,
                        fragments,
                    })
                }
                None => {
                    warn!(code, "unknown command code");
                    Action::Publish(ClassificationResult::Failed(
                        FailureReason::UnknownCommand(code),
                    ))
                }
            },
        }
    }
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::Fragment;
    use crate::hardware::DeviceError;
    use std::time::UNIX_EPOCH;

    fn payload(samples: &[i16]) -> Vec<u8> {
        Fragment::from_samples(samples.to_vec()).encode()
    }

    fn wall(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    fn dispatched(actions: Vec<Action>) -> InferenceJob {
        match actions.as_slice() {
            [Action::Dispatch(job)] => job.clone(),
            other => panic!("expected one Dispatch, got {:?}", other),
        }
    }

    #[test]
    fn two_fragments_dispatch_at_deadline() {
        let mut c = SessionController::new();
        let t0 = Instant::now();
        assert!(c.on_fragment(t0, wall(1000), &payload(&[0, 9, 9])).unwrap().is_empty());
        assert!(c
            .on_fragment(t0 + Duration::from_millis(400), wall(1400), &payload(&[5, 6, 7]))
            .unwrap()
            .is_empty());
        assert!(c.tick(t0 + Duration::from_millis(1900)).is_empty());
        let job = dispatched(c.tick(t0 + Duration::from_millis(2010)));
        assert_eq!(job.command, Command::Select);
        assert_eq!(job.waveform, vec![6, 7]);
        assert_eq!(job.received_at, wall(1000));
        assert_eq!(c.state(), SessionState::Idle);
    }

    #[test]
    fn third_fragment_dispatches_immediately() {
        let mut c = SessionController::new();
        let t0 = Instant::now();
        c.on_fragment(t0, wall(0), &payload(&[1, 1, 2])).unwrap();
        c.on_fragment(t0, wall(0), &payload(&[7, 7])).unwrap();
        let job = dispatched(c.on_fragment(t0, wall(0), &payload(&[3, 4, 5])).unwrap());
        assert_eq!(job.command, Command::Delete);
        assert_eq!(job.waveform, vec![1, 2, 4, 5]);
        assert_eq!(job.fragments, 3);
    }

    #[test]
    fn lone_fragment_publishes_failed() {
        let mut c = SessionController::new();
        let t0 = Instant::now();
        c.on_fragment(t0, wall(0), &payload(&[0, 1])).unwrap();
        let actions = c.tick(t0 + Duration::from_millis(2100));
        assert_eq!(
            actions,
            vec![Action::Publish(ClassificationResult::Failed(
                FailureReason::Incomplete
            ))]
        );
        assert_eq!(c.sessions_closed(), 1);
    }

    #[test]
    fn late_fragment_expires_stale_session_then_starts_new_one() {
        let mut c = SessionController::new();
        let t0 = Instant::now();
        c.on_fragment(t0, wall(0), &payload(&[0, 1])).unwrap();
        let t1 = t0 + Duration::from_millis(2500);
        let actions = c.on_fragment(t1, wall(2500), &payload(&[1, 2])).unwrap();
        assert_eq!(
            actions,
            vec![Action::Publish(ClassificationResult::Failed(
                FailureReason::Incomplete
            ))]
        );
        assert_eq!(c.state(), SessionState::Collecting { fragments: 1 });
        assert_eq!(c.deadline_in(t1), Some(Duration::from_secs(2)));
    }

    #[test]
    fn malformed_payload_is_rejected_without_state_change() {
        let mut c = SessionController::new();
        let t0 = Instant::now();
        c.on_fragment(t0, wall(0), &payload(&[0, 1])).unwrap();
        assert!(c.on_fragment(t0, wall(0), &[1, 2, 3]).is_err());
        assert_eq!(c.state(), SessionState::Collecting { fragments: 1 });
    }

    #[test]
    fn unknown_command_fails_without_dispatch() {
        let mut c = SessionController::new();
        let t0 = Instant::now();
        c.on_fragment(t0, wall(0), &payload(&[7, 1])).unwrap();
        c.on_fragment(t0, wall(0), &payload(&[0, 2])).unwrap();
        let actions = c.tick(t0 + Duration::from_secs(3));
        assert_eq!(
            actions,
            vec![Action::Publish(ClassificationResult::Failed(
                FailureReason::UnknownCommand(7)
            ))]
        );
    }

    #[test]
    fn debug_mode_is_one_shot() {
        let mut c = SessionController::new();
        let job = InferenceJob {
            command: Command::Select,
            waveform: vec![],
            received_at: wall(1_000),
            fragments: 2,
        };
        c.on_debug_toggle();
        let first = c.finish(&job, Ok(Label::Lamp), wall(1_250));
        assert_eq!(
            first,
            ClassificationResult::Debug {
                receive_time: 1_000,
                inference_time: 250,
                send_time: 1_250
            }
        );
        assert!(!c.debug_armed());
        let second = c.finish(&job, Ok(Label::Lamp), wall(1_300));
        assert_eq!(
            second,
            ClassificationResult::Success {
                command: Command::Select,
                result: Label::Lamp
            }
        );
    }

    #[test]
    fn failures_keep_debug_armed() {
        let mut c = SessionController::new();
        let job = InferenceJob {
            command: Command::Delete,
            waveform: vec![],
            received_at: wall(0),
            fragments: 3,
        };
        c.on_debug_toggle();
        let r = c.finish(
            &job,
            Err(InferenceError::Device(DeviceError::Transfer("halted".into()))),
            wall(10),
        );
        assert_eq!(r, ClassificationResult::Failed(FailureReason::Inference));
        let r = c.finish(&job, Err(InferenceError::TimedOut(Duration::from_secs(5))), wall(10));
        assert_eq!(r, ClassificationResult::Failed(FailureReason::InferenceTimeout));
        let r = c.finish(&job, Err(InferenceError::Busy), wall(10));
        assert_eq!(r, ClassificationResult::Failed(FailureReason::Inference));
        assert!(c.debug_armed());
    }
}
