//! Debounce state machine.
//!
//! ```text
//! Idle --observe--> Open(deadline, last)
//! Open --observe--> Open(later deadline, newer last)
//! Open --fire at/after deadline--> Idle, yielding last
//! ```
//!
//! Only the most recent event is kept. There is no queue.

use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// A change seen by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub at: Instant,
}

impl WatchEvent {
    pub fn now(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Open { deadline: Instant, last: WatchEvent },
}

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    state: State,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: State::Idle,
        }
    }

    /// Record an event, opening the window or pushing its deadline out.
    pub fn observe(&mut self, event: WatchEvent) {
        let deadline = event.at + self.window;
        self.state = State::Open {
            deadline,
            last: event,
        };
    }

    /// When the open window closes, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        match &self.state {
            State::Idle => None,
            State::Open { deadline, .. } => Some(*deadline),
        }
    }

    /// Close the window if its deadline has passed and return its last event.
    pub fn fire(&mut self, now: Instant) -> Option<WatchEvent> {
        let due = matches!(&self.state, State::Open { deadline, .. } if now >= *deadline);
        if !due {
            return None;
        }
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Open { last, .. } => Some(last),
            State::Idle => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(500);

    #[test]
    fn test_idle_has_no_deadline() {
        let mut debouncer = Debouncer::new(WINDOW);
        assert_eq!(debouncer.deadline(), None);
        assert_eq!(debouncer.fire(Instant::now()), None);
    }

    #[test]
    fn test_fires_after_quiet_window() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.observe(WatchEvent {
            path: "a.js".into(),
            at: start,
        });

        assert_eq!(debouncer.deadline(), Some(start + WINDOW));
        assert_eq!(debouncer.fire(start + Duration::from_millis(499)), None);

        let fired = debouncer.fire(start + WINDOW).unwrap();
        assert_eq!(fired.path, PathBuf::from("a.js"));
        assert_eq!(debouncer.deadline(), None);
        assert_eq!(debouncer.fire(start + WINDOW * 2), None);
    }

    #[test]
    fn test_new_event_extends_window_and_replaces_last() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(WINDOW);
        debouncer.observe(WatchEvent {
            path: "style.css".into(),
            at: start,
        });
        debouncer.observe(WatchEvent {
            path: "main.js".into(),
            at: start + Duration::from_millis(400),
        });

        // The first deadline has passed but the window was extended.
        assert_eq!(debouncer.fire(start + WINDOW), None);

        let fired = debouncer
            .fire(start + Duration::from_millis(900))
            .unwrap();
        assert_eq!(fired.path, PathBuf::from("main.js"));
    }
}
