use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::villa::catalog::{Catalog, Step};
use crate::villa::error::VillaError;
use crate::villa::session::{Session, SessionKey, SessionState, SessionStore};

/// Enforces the budget → location → style → angle sequence for each chat.
#[derive(Clone)]
pub struct Conversation {
    store: SessionStore,
    catalog: Arc<Catalog>,
    idle_timeout: Option<Duration>,
}

impl Conversation {
    pub fn new(store: SessionStore, catalog: Arc<Catalog>) -> Self {
        Conversation {
            store,
            catalog,
            idle_timeout: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    #[cfg(test)]
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Begins a fresh session, replacing whatever the chat had before.
    pub fn start(&self, key: SessionKey, user_id: i64) -> Session {
        let session = Session::new(key, user_id, self.store.next_epoch());
        if let Some(previous) = self.store.insert(session.clone()) {
            debug!(
                chat_id = key,
                previous_state = %previous.state,
                "Discarded previous villa session"
            );
        }
        session
    }

    pub fn select(
        &self,
        key: SessionKey,
        step: Step,
        value: &str,
    ) -> Result<SessionState, VillaError> {
        let now = Instant::now();
        self.store.update(|sessions| {
            self.drop_if_expired(sessions, key, now);
            let session = sessions
                .get_mut(&key)
                .ok_or(VillaError::NoActiveSession)?;

            if session.state.awaiting() != Some(step) {
                return Err(VillaError::OutOfOrder {
                    expected: session.state,
                    got: step,
                });
            }

            let option = self
                .catalog
                .find(step, value)
                .ok_or_else(|| VillaError::InvalidOption {
                    step,
                    value: value.to_string(),
                })?
                .clone();
            session.record(step, option);
            Ok(session.state)
        })
    }

    pub fn is_ready(&self, key: SessionKey) -> bool {
        self.session(key)
            .map(|session| session.is_ready())
            .unwrap_or(false)
    }

    /// Snapshot of the live session, treating expired ones as absent.
    pub fn session(&self, key: SessionKey) -> Option<Session> {
        let now = Instant::now();
        self.store.update(|sessions| {
            self.drop_if_expired(sessions, key, now);
            sessions.get(&key).cloned()
        })
    }

    pub fn cancel(&self, key: SessionKey) -> bool {
        self.store.remove(key).is_some()
    }

    /// Sends an existing session back to the budget step under a new epoch.
    pub fn reset(&self, key: SessionKey) -> Option<Session> {
        let epoch = self.store.next_epoch();
        self.store.update(|sessions| {
            let session = sessions.get_mut(&key)?;
            *session = Session::new(key, session.user_id, epoch);
            Some(session.clone())
        })
    }

    /// Like [`Conversation::reset`], but only when `epoch` is still current.
    pub fn reset_if_current(&self, key: SessionKey, epoch: u64) -> bool {
        let next = self.store.next_epoch();
        self.store.update(|sessions| match sessions.get_mut(&key) {
            Some(session) if session.epoch == epoch => {
                *session = Session::new(key, session.user_id, next);
                true
            }
            _ => false,
        })
    }

    /// Removes the session once its generation completed, if still current.
    pub fn finish(&self, key: SessionKey, epoch: u64) -> bool {
        self.store.update(|sessions| match sessions.get(&key) {
            Some(session) if session.epoch == epoch => {
                sessions.remove(&key);
                true
            }
            _ => false,
        })
    }

    pub fn is_current(&self, key: SessionKey, epoch: u64) -> bool {
        self.store
            .get(key)
            .map(|session| session.epoch == epoch)
            .unwrap_or(false)
    }

    pub fn sweep_idle(&self) -> usize {
        match self.idle_timeout {
            Some(max_idle) => self.store.sweep_idle(Instant::now(), max_idle),
            None => 0,
        }
    }

    fn drop_if_expired(
        &self,
        sessions: &mut HashMap<SessionKey, Session>,
        key: SessionKey,
        now: Instant,
    ) {
        let Some(max_idle) = self.idle_timeout else {
            return;
        };
        let expired = sessions
            .get(&key)
            .map(|session| session.is_idle(now, max_idle))
            .unwrap_or(false);
        if expired {
            sessions.remove(&key);
            debug!(chat_id = key, "Villa session expired after inactivity");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::villa::catalog::sample_catalog;

    fn conversation() -> Conversation {
        Conversation::new(SessionStore::new(), Arc::new(sample_catalog()))
    }

    #[test]
    fn walks_the_four_steps_in_order() {
        let conversation = conversation();
        let session = conversation.start(1, 1);
        assert_eq!(session.state, SessionState::AwaitingBudget);

        assert_eq!(
            conversation.select(1, Step::Budget, "$200K-$300K").unwrap(),
            SessionState::AwaitingLocation
        );
        assert_eq!(
            conversation.select(1, Step::Location, "Seaside").unwrap(),
            SessionState::AwaitingStyle
        );
        assert_eq!(
            conversation.select(1, Step::Style, "Mediterranean").unwrap(),
            SessionState::AwaitingAngle
        );
        assert!(!conversation.is_ready(1));
        assert_eq!(
            conversation.select(1, Step::Angle, "Orbit").unwrap(),
            SessionState::Ready
        );
        assert!(conversation.is_ready(1));
    }

    #[test]
    fn out_of_order_select_leaves_state_unchanged() {
        let conversation = conversation();
        conversation.start(1, 1);
        conversation.select(1, Step::Budget, "$200K-$300K").unwrap();

        let err = conversation.select(1, Step::Style, "Modern").unwrap_err();
        assert!(matches!(
            err,
            VillaError::OutOfOrder {
                expected: SessionState::AwaitingLocation,
                got: Step::Style
            }
        ));
        let session = conversation.session(1).unwrap();
        assert_eq!(session.state, SessionState::AwaitingLocation);
        assert!(session.style.is_none());
    }

    #[test]
    fn every_wrong_step_is_rejected_at_every_state() {
        let conversation = conversation();
        conversation.start(1, 1);
        let answers = ["$1M+", "Urban", "Minimalist", "Parallax"];
        for (index, step) in Step::ALL.iter().enumerate() {
            for wrong in Step::ALL.iter().filter(|candidate| *candidate != step) {
                let before = conversation.session(1).unwrap().state;
                assert!(matches!(
                    conversation.select(1, *wrong, answers[index]),
                    Err(VillaError::OutOfOrder { .. })
                ));
                assert_eq!(conversation.session(1).unwrap().state, before);
            }
            conversation.select(1, *step, answers[index]).unwrap();
        }
        for step in Step::ALL {
            assert!(matches!(
                conversation.select(1, step, "Orbit"),
                Err(VillaError::OutOfOrder {
                    expected: SessionState::Ready,
                    ..
                })
            ));
        }
    }

    #[test]
    fn duplicate_callback_is_out_of_order() {
        let conversation = conversation();
        conversation.start(1, 1);
        conversation.select(1, Step::Budget, "$1M+").unwrap();
        assert!(matches!(
            conversation.select(1, Step::Budget, "$1M+"),
            Err(VillaError::OutOfOrder { .. })
        ));
        assert_eq!(conversation.session(1).unwrap().budget.unwrap().label, "$1M+");
    }

    #[test]
    fn invalid_option_is_rejected() {
        let conversation = conversation();
        conversation.start(1, 1);
        let err = conversation.select(1, Step::Budget, "$9999").unwrap_err();
        assert!(matches!(err, VillaError::InvalidOption { step: Step::Budget, .. }));
        assert_eq!(
            conversation.session(1).unwrap().state,
            SessionState::AwaitingBudget
        );
    }

    #[test]
    fn select_without_session_fails() {
        let conversation = conversation();
        assert!(matches!(
            conversation.select(5, Step::Budget, "$1M+"),
            Err(VillaError::NoActiveSession)
        ));
    }

    #[test]
    fn restart_discards_previous_selections() {
        let conversation = conversation();
        let first = conversation.start(1, 1);
        conversation.select(1, Step::Budget, "$1M+").unwrap();
        conversation.select(1, Step::Location, "Jungle").unwrap();

        let second = conversation.start(1, 1);
        assert_ne!(first.epoch, second.epoch);
        let session = conversation.session(1).unwrap();
        assert_eq!(session.state, SessionState::AwaitingBudget);
        assert!(session.budget.is_none());
        assert!(session.location.is_none());
    }

    #[test]
    fn chats_are_independent() {
        let conversation = conversation();
        conversation.start(1, 1);
        conversation.start(2, 2);
        conversation.select(1, Step::Budget, "$1M+").unwrap();
        assert_eq!(
            conversation.session(2).unwrap().state,
            SessionState::AwaitingBudget
        );
        conversation.cancel(1);
        assert!(conversation.session(1).is_none());
        assert!(conversation.session(2).is_some());
    }

    #[test]
    fn finish_and_reset_respect_epochs() {
        let conversation = conversation();
        let stale = conversation.start(1, 1);
        let current = conversation.start(1, 1);

        assert!(!conversation.is_current(1, stale.epoch));
        assert!(!conversation.finish(1, stale.epoch));
        assert!(!conversation.reset_if_current(1, stale.epoch));
        assert!(conversation.session(1).is_some());

        conversation.select(1, Step::Budget, "$1M+").unwrap();
        assert!(conversation.reset_if_current(1, current.epoch));
        let reset = conversation.session(1).unwrap();
        assert_eq!(reset.state, SessionState::AwaitingBudget);
        assert!(reset.budget.is_none());
        assert!(conversation.finish(1, reset.epoch));
        assert!(conversation.session(1).is_none());
    }

    #[test]
    fn idle_sessions_expire() {
        let conversation = conversation().with_idle_timeout(Some(Duration::ZERO));
        conversation.start(1, 1);
        assert!(matches!(
            conversation.select(1, Step::Budget, "$1M+"),
            Err(VillaError::NoActiveSession)
        ));
        assert!(conversation.store().is_empty());

        conversation.start(2, 2);
        assert_eq!(conversation.sweep_idle(), 1);
    }
}
