//! Strict turn-taking between the step loop and a probe task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Turn {
    Controller,
    Probe,
}

#[derive(Debug)]
struct HandshakeState {
    turn: Turn,
    closed: bool,
    history: Vec<Turn>,
}

/// Two-party turn handshake on a mutex and condition variable.
///
/// A party calls [`wait_for`](Self::wait_for) with its own [`Turn`], does its
/// work, then hands over with [`pass`](Self::pass). Only `pass` changes the
/// turn, so the parties strictly alternate. The order in which turns were
/// actually taken is kept in [`history`](Self::history).
#[derive(Debug)]
pub struct TurnHandshake {
    state: Mutex<HandshakeState>,
    cv: Condvar,
}

impl TurnHandshake {
    pub fn new(first: Turn) -> Self {
        Self {
            state: Mutex::new(HandshakeState {
                turn: first,
                closed: false,
                history: Vec::new(),
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandshakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until it is `turn`'s turn.
    ///
    /// Returns `false` once the handshake is closed and the turn is not
    /// `turn`; a turn already handed over before closing is still granted.
    pub fn wait_for(&self, turn: Turn) -> bool {
        let mut state = self.lock();
        while state.turn != turn && !state.closed {
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        if state.turn != turn {
            return false;
        }
        state.history.push(turn);
        true
    }

    pub fn pass(&self, to: Turn) {
        self.lock().turn = to;
        self.cv.notify_all();
    }

    /// Release every waiter; no further turns are granted to the party not
    /// currently holding one.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cv.notify_all();
    }

    pub fn history(&self) -> Vec<Turn> {
        self.lock().history.clone()
    }
}

/// Cooperative cancellation flag, checked by the controller between steps.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parties_alternate_strictly() {
        let hs = Arc::new(TurnHandshake::new(Turn::Controller));
        let probe = {
            let hs = Arc::clone(&hs);
            std::thread::spawn(move || {
                let mut turns = 0;
                while hs.wait_for(Turn::Probe) {
                    turns += 1;
                    hs.pass(Turn::Controller);
                }
                turns
            })
        };

        for _ in 0..5 {
            assert!(hs.wait_for(Turn::Controller));
            hs.pass(Turn::Probe);
        }
        assert!(hs.wait_for(Turn::Controller));
        hs.close();
        assert_eq!(probe.join().unwrap(), 5);

        let history = hs.history();
        assert_eq!(history.len(), 11);
        for (i, t) in history.iter().enumerate() {
            let expected = if i % 2 == 0 { Turn::Controller } else { Turn::Probe };
            assert_eq!(*t, expected, "turn {i}");
        }
    }

    #[test]
    fn close_releases_waiter() {
        let hs = Arc::new(TurnHandshake::new(Turn::Controller));
        let waiter = {
            let hs = Arc::clone(&hs);
            std::thread::spawn(move || hs.wait_for(Turn::Probe))
        };
        hs.close();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn cancellation_is_shared() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        other.cancel();
        assert!(token.is_cancelled());
    }
}
