use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::villa::catalog::{Step, VillaOption};

/// Sessions are keyed by Telegram chat id.
pub type SessionKey = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    AwaitingBudget,
    AwaitingLocation,
    AwaitingStyle,
    AwaitingAngle,
    Ready,
}

impl SessionState {
    /// The step this state expects next, or `None` once every step is answered.
    pub fn awaiting(self) -> Option<Step> {
        match self {
            SessionState::AwaitingBudget => Some(Step::Budget),
            SessionState::AwaitingLocation => Some(Step::Location),
            SessionState::AwaitingStyle => Some(Step::Style),
            SessionState::AwaitingAngle => Some(Step::Angle),
            SessionState::Ready => None,
        }
    }

    /// State reached after `step` is answered.
    pub fn after(step: Step) -> SessionState {
        match step.next() {
            Some(Step::Location) => SessionState::AwaitingLocation,
            Some(Step::Style) => SessionState::AwaitingStyle,
            Some(Step::Angle) => SessionState::AwaitingAngle,
            Some(Step::Budget) | None => SessionState::Ready,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingBudget => "AwaitingBudget",
            SessionState::AwaitingLocation => "AwaitingLocation",
            SessionState::AwaitingStyle => "AwaitingStyle",
            SessionState::AwaitingAngle => "AwaitingAngle",
            SessionState::Ready => "Ready",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub key: SessionKey,
    pub user_id: i64,
    pub state: SessionState,
    pub budget: Option<VillaOption>,
    pub location: Option<VillaOption>,
    pub style: Option<VillaOption>,
    pub angle: Option<VillaOption>,
    /// Changes every time the session is started or reset, so late
    /// generation results can tell whether they still belong here.
    pub epoch: u64,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(key: SessionKey, user_id: i64, epoch: u64) -> Self {
        Session {
            key,
            user_id,
            state: SessionState::AwaitingBudget,
            budget: None,
            location: None,
            style: None,
            angle: None,
            epoch,
            last_activity: Instant::now(),
        }
    }

    pub fn selection(&self, step: Step) -> Option<&VillaOption> {
        match step {
            Step::Budget => self.budget.as_ref(),
            Step::Location => self.location.as_ref(),
            Step::Style => self.style.as_ref(),
            Step::Angle => self.angle.as_ref(),
        }
    }

    pub(crate) fn record(&mut self, step: Step, option: VillaOption) {
        let slot = match step {
            Step::Budget => &mut self.budget,
            Step::Location => &mut self.location,
            Step::Style => &mut self.style,
            Step::Angle => &mut self.angle,
        };
        *slot = Some(option);
        self.state = SessionState::after(step);
        self.last_activity = Instant::now();
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Ready sessions belong to an in-flight generation and never go idle.
    pub fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        !self.is_ready() && now.saturating_duration_since(self.last_activity) >= max_idle
    }
}

/// Shared chat-id → session map. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<SessionKey, Session>>>,
    epochs: Arc<AtomicU64>,
}

impl SessionStore {
    pub fn new() -> Self {
        SessionStore::default()
    }

    pub fn next_epoch(&self) -> u64 {
        self.epochs.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, key: SessionKey) -> Option<Session> {
        self.sessions.lock().get(&key).cloned()
    }

    pub fn insert(&self, session: Session) -> Option<Session> {
        self.sessions.lock().insert(session.key, session)
    }

    pub fn remove(&self, key: SessionKey) -> Option<Session> {
        self.sessions.lock().remove(&key)
    }

    /// Runs `f` with the map locked, for read-modify-write sequences.
    pub fn update<R>(&self, f: impl FnOnce(&mut HashMap<SessionKey, Session>) -> R) -> R {
        let mut sessions = self.sessions.lock();
        f(&mut sessions)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn sweep_idle(&self, now: Instant, max_idle: Duration) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_idle(now, max_idle));
        before - sessions.len()
    }
}
