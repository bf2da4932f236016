//! # Engine activity tracker with sequence-based ordering.
//!
//! Keeps the authoritative view of which engines are serving a request, so
//! that a shutdown running out of grace can name the stuck ones.
//!
//! ## Architecture
//! ```text
//! EngineActor ──► Bus ──► subscriber_listener() ──► EngineTracker::update()
//!                                                          │
//!                                                          ▼
//!                                              HashMap<usize, EngineState>
//!                                               (engine → {seq, activity})
//! ```
//!
//! ## Rules
//! - `EngineBusy` marks an engine busy, `EngineIdle` / `EngineStarted` idle
//! - `EngineAbandoned` marks it stuck until its next `EngineStarted`
//! - Events with `seq <= last_seq` for that engine are rejected (stale)

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::events::{Event, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activity {
    Idle,
    Busy,
    Abandoned,
}

#[derive(Debug, Clone)]
struct EngineState {
    last_seq: u64,
    activity: Activity,
}

/// Thread-safe tracker of busy engines.
#[derive(Default)]
pub struct EngineTracker {
    state: RwLock<HashMap<usize, EngineState>>,
}

impl EngineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `ev` if it is newer than the last event seen for its engine.
    ///
    /// Returns whether the engine's activity changed.
    pub async fn update(&self, ev: &Event) -> bool {
        let Some(engine) = ev.engine else {
            return false;
        };

        let mut state = self.state.write().await;
        let entry = state.entry(engine).or_insert(EngineState {
            last_seq: 0,
            activity: Activity::Idle,
        });
        if ev.seq <= entry.last_seq {
            return false;
        }
        entry.last_seq = ev.seq;

        let next = match ev.kind {
            EventKind::EngineBusy => Activity::Busy,
            EventKind::EngineIdle | EventKind::EngineStarted => Activity::Idle,
            EventKind::EngineAbandoned => Activity::Abandoned,
            _ => return false,
        };
        let changed = entry.activity != next;
        entry.activity = next;
        changed
    }

    /// Sorted indices of engines that are busy or were abandoned.
    pub async fn snapshot(&self) -> Vec<usize> {
        let state = self.state.read().await;
        let mut stuck: Vec<usize> = state
            .iter()
            .filter(|(_, s)| s.activity != Activity::Idle)
            .map(|(engine, _)| *engine)
            .collect();
        stuck.sort_unstable();
        stuck
    }

    pub async fn is_busy(&self, engine: usize) -> bool {
        self.state
            .read()
            .await
            .get(&engine)
            .is_some_and(|s| s.activity == Activity::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(kind: EventKind, engine: usize, seq: u64) -> Event {
        let mut ev = Event::new(kind).with_engine(engine);
        ev.seq = seq;
        ev
    }

    #[tokio::test]
    async fn busy_until_idle() {
        let t = EngineTracker::new();
        assert!(t.update(&ev(EventKind::EngineBusy, 2, 10)).await);
        assert!(t.is_busy(2).await);
        assert_eq!(t.snapshot().await, vec![2]);

        assert!(t.update(&ev(EventKind::EngineIdle, 2, 11)).await);
        assert!(t.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn stale_events_are_rejected() {
        let t = EngineTracker::new();
        t.update(&ev(EventKind::EngineIdle, 0, 20)).await;
        assert!(!t.update(&ev(EventKind::EngineBusy, 0, 19)).await);
        assert!(!t.is_busy(0).await);
    }

    #[tokio::test]
    async fn abandoned_engines_count_as_stuck_until_restarted() {
        let t = EngineTracker::new();
        t.update(&ev(EventKind::EngineBusy, 1, 1)).await;
        t.update(&ev(EventKind::EngineBusy, 3, 2)).await;
        t.update(&ev(EventKind::EngineAbandoned, 1, 3)).await;
        assert_eq!(t.snapshot().await, vec![1, 3]);

        t.update(&ev(EventKind::EngineStarted, 1, 4)).await;
        assert_eq!(t.snapshot().await, vec![3]);
    }

    #[tokio::test]
    async fn events_without_engine_are_ignored() {
        let t = EngineTracker::new();
        assert!(!t.update(&Event::new(EventKind::ShutdownRequested)).await);
        assert!(t.snapshot().await.is_empty());
    }
}
