//! Packet aggregator: single-slot session state machine that reassembles fragments by arrival order.
//!
//! There are no sequence numbers. A session is closed by count (3 fragments) or by deadline
//! (`now - origin > timeout` with 1 or 2 fragments buffered). The 3-fragment layout skips the
//! middle fragment entirely; duplicated or reordered delivery corrupts the waveform silently.

use std::time::{Duration, Instant, SystemTime};

use crate::fragment::Fragment;

/// Deadline measured from receipt of a session's first fragment.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(2);

/// A session never holds more than this many fragments.
pub const MAX_FRAGMENTS: usize = 3;

/// Observable aggregator state. `Closed` is transient and never observed: closure resets to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Collecting { fragments: usize },
}

struct Session {
    fragments: Vec<Fragment>,
    origin: Instant,
    origin_wall: SystemTime,
}

/// Outcome of closing a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Closure {
    /// 2 or 3 fragments: command code from fragment 0 sample 0, assembled waveform.
    Assembled {
        command_code: Option<i16>,
        waveform: Vec<i16>,
        fragments: usize,
        received_at: SystemTime,
    },
    /// Deadline passed with too few fragments; nothing to dispatch.
    Incomplete {
        fragments: usize,
        received_at: SystemTime,
    },
}

impl Closure {
    pub fn fragment_count(&self) -> usize {
        match self {
            Closure::Assembled { fragments, .. } | Closure::Incomplete { fragments, .. } => {
                *fragments
            }
        }
    }
}

/// Exactly one in-flight session; the slot is cleared on every closure.
pub struct Aggregator {
    slot: Option<Session>,
    timeout: Duration,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SESSION_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            slot: None,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> SessionState {
        match &self.slot {
            None => SessionState::Idle,
            Some(s) => SessionState::Collecting {
                fragments: s.fragments.len(),
            },
        }
    }

    /// Buffer a fragment. Returns a closure when this fragment is the third of the session.
    /// `now`/`wall` are the fragment's receive time; the first fragment sets the deadline origin.
    pub fn on_fragment(
        &mut self,
        now: Instant,
        wall: SystemTime,
        fragment: Fragment,
    ) -> Option<Closure> {
        let session = self.slot.get_or_insert_with(|| Session {
            fragments: Vec::with_capacity(MAX_FRAGMENTS),
            origin: now,
            origin_wall: wall,
        });
        session.fragments.push(fragment);
        if session.fragments.len() >= MAX_FRAGMENTS {
            return self.close();
        }
        None
    }

    /// Evaluate the deadline. Returns a closure if the running session has expired.
    pub fn tick(&mut self, now: Instant) -> Option<Closure> {
        let expired = self
            .slot
            .as_ref()
            .map(|s| now.saturating_duration_since(s.origin) > self.timeout)
            .unwrap_or(false);
        if expired {
            self.close()
        } else {
            None
        }
    }

    /// Time left before the running session expires (None when idle).
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.slot.as_ref().map(|s| {
            self.timeout
                .saturating_sub(now.saturating_duration_since(s.origin))
        })
    }

    fn close(&mut self) -> Option<Closure> {
        let session = self.slot.take()?;
        Some(assemble(session))
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn assemble(session: Session) -> Closure {
    let Session {
        fragments,
        origin_wall,
        ..
    } = session;
    let count = fragments.len();
    let command_code = fragments.first().and_then(Fragment::head);
    match fragments.as_slice() {
        [first, _, last] => {
            let mut waveform = Vec::with_capacity(first.tail().len() + last.tail().len());
            waveform.extend_from_slice(first.tail());
            waveform.extend_from_slice(last.tail());
            Closure::Assembled {
                command_code,
                waveform,
                fragments: count,
                received_at: origin_wall,
            }
        }
        [_, second] => Closure::Assembled {
            command_code,
            waveform: second.tail().to_vec(),
            fragments: count,
            received_at: origin_wall,
        },
        _ => Closure::Incomplete {
            fragments: count,
            received_at: origin_wall,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(samples: &[i16]) -> Fragment {
        Fragment::from_samples(samples.to_vec())
    }

    #[test]
    fn three_fragments_skip_the_middle() {
        let mut agg = Aggregator::new();
        let t0 = Instant::now();
        let wall = SystemTime::UNIX_EPOCH;
        assert!(agg.on_fragment(t0, wall, frag(&[0, 1, 2, 3])).is_none());
        assert!(agg
            .on_fragment(t0, wall, frag(&[90, 91, 92, 93]))
            .is_none());
        let closure = agg.on_fragment(t0, wall, frag(&[10, 11, 12, 13])).unwrap();
        assert_eq!(
            closure,
            Closure::Assembled {
                command_code: Some(0),
                waveform: vec![1, 2, 3, 11, 12, 13],
                fragments: 3,
                received_at: wall,
            }
        );
        assert_eq!(agg.state(), SessionState::Idle);
    }

    #[test]
    fn two_fragments_close_at_deadline_with_second_tail() {
        let mut agg = Aggregator::new();
        let t0 = Instant::now();
        let wall = SystemTime::UNIX_EPOCH;
        agg.on_fragment(t0, wall, frag(&[1, 5, 6]));
        agg.on_fragment(t0 + Duration::from_millis(300), wall, frag(&[7, 8, 9]));
        assert_eq!(agg.state(), SessionState::Collecting { fragments: 2 });
        assert!(agg.tick(t0 + Duration::from_millis(1900)).is_none());
        assert!(agg.tick(t0 + Duration::from_secs(2)).is_none());
        let closure = agg.tick(t0 + Duration::from_millis(2001)).unwrap();
        match closure {
            Closure::Assembled {
                command_code,
                waveform,
                fragments,
                ..
            } => {
                assert_eq!(command_code, Some(1));
                assert_eq!(waveform, vec![8, 9]);
                assert_eq!(fragments, 2);
            }
            other => panic!("expected Assembled, got {:?}", other),
        }
        assert_eq!(agg.state(), SessionState::Idle);
    }

    #[test]
    fn single_fragment_expires_incomplete() {
        let mut agg = Aggregator::new();
        let t0 = Instant::now();
        agg.on_fragment(t0, SystemTime::UNIX_EPOCH, frag(&[0, 1]));
        let closure = agg.tick(t0 + Duration::from_millis(2100)).unwrap();
        assert!(matches!(closure, Closure::Incomplete { fragments: 1, .. }));
        assert_eq!(agg.state(), SessionState::Idle);
    }

    #[test]
    fn deadline_measured_from_first_fragment() {
        let mut agg = Aggregator::new();
        let t0 = Instant::now();
        let wall = SystemTime::UNIX_EPOCH;
        agg.on_fragment(t0, wall, frag(&[0]));
        agg.on_fragment(t0 + Duration::from_millis(1500), wall, frag(&[0, 4]));
        assert_eq!(
            agg.remaining(t0 + Duration::from_millis(1500)),
            Some(Duration::from_millis(500))
        );
        assert!(agg.tick(t0 + Duration::from_millis(2050)).is_some());
    }

    #[test]
    fn tick_while_idle_is_noop() {
        let mut agg = Aggregator::new();
        assert!(agg.tick(Instant::now()).is_none());
        assert_eq!(agg.remaining(Instant::now()), None);
    }

    #[test]
    fn fresh_session_after_closure() {
        let mut agg = Aggregator::with_timeout(Duration::from_millis(100));
        let t0 = Instant::now();
        let wall = SystemTime::UNIX_EPOCH;
        agg.on_fragment(t0, wall, frag(&[0]));
        assert!(agg.tick(t0 + Duration::from_millis(150)).is_some());

        let t1 = t0 + Duration::from_millis(160);
        agg.on_fragment(t1, wall, frag(&[1, 2]));
        assert_eq!(agg.state(), SessionState::Collecting { fragments: 1 });
        // New origin: not expired relative to t1.
        assert!(agg.tick(t1 + Duration::from_millis(90)).is_none());
    }

    #[test]
    fn empty_first_fragment_has_no_command() {
        let mut agg = Aggregator::new();
        let t0 = Instant::now();
        let wall = SystemTime::UNIX_EPOCH;
        agg.on_fragment(t0, wall, frag(&[]));
        agg.on_fragment(t0, wall, frag(&[3, 4]));
        let closure = agg.tick(t0 + Duration::from_secs(3)).unwrap();
        assert!(matches!(
            closure,
            Closure::Assembled {
                command_code: None,
                ..
            }
        ));
    }
}
