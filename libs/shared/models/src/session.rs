use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Doctor,
    Patient,
    Admin,
}

/// The signed-in user as seen by the queue engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUser {
    /// Stable identifier; doctors are keyed by email.
    pub id: String,
    pub role: Role,
    pub display_name: Option<String>,
    pub signed_in_at: DateTime<Utc>,
}

impl SessionUser {
    pub fn doctor(id: &str) -> Self {
        Self::new(id, Role::Doctor)
    }

    pub fn patient(id: &str) -> Self {
        Self::new(id, Role::Patient)
    }

    pub fn new(id: &str, role: Role) -> Self {
        Self {
            id: id.to_string(),
            role,
            display_name: None,
            signed_in_at: Utc::now(),
        }
    }
}

/// Explicit session object handed to each component instead of an ambient
/// global. Observers get change notifications through a `watch` channel.
#[derive(Clone)]
pub struct SessionContext {
    current: Arc<RwLock<Option<SessionUser>>>,
    notifier: watch::Sender<Option<SessionUser>>,
}

impl SessionContext {
    pub fn new(user: Option<SessionUser>) -> Self {
        let (notifier, _) = watch::channel(user.clone());
        Self {
            current: Arc::new(RwLock::new(user)),
            notifier,
        }
    }

    pub fn anonymous() -> Self {
        Self::new(None)
    }

    pub fn current(&self) -> Option<SessionUser> {
        self.current
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Id of the signed-in doctor, if the session belongs to one.
    pub fn doctor_id(&self) -> Option<String> {
        self.current()
            .filter(|user| user.role == Role::Doctor)
            .map(|user| user.id)
    }

    pub fn sign_in(&self, user: SessionUser) {
        debug!("Session switched to {} ({:?})", user.id, user.role);
        self.replace(Some(user));
    }

    pub fn sign_out(&self) {
        debug!("Session signed out");
        self.replace(None);
    }

    pub fn watch(&self) -> watch::Receiver<Option<SessionUser>> {
        self.notifier.subscribe()
    }

    fn replace(&self, user: Option<SessionUser>) {
        match self.current.write() {
            Ok(mut guard) => *guard = user.clone(),
            Err(poisoned) => *poisoned.into_inner() = user.clone(),
        }
        self.notifier.send_replace(user);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_id_only_for_doctor_sessions() {
        let session = SessionContext::new(Some(SessionUser::patient("pat-1")));
        assert_eq!(session.doctor_id(), None);

        session.sign_in(SessionUser::doctor("dr@x.com"));
        assert_eq!(session.doctor_id().as_deref(), Some("dr@x.com"));
    }

    #[test]
    fn observers_see_sign_out() {
        let session = SessionContext::new(Some(SessionUser::doctor("dr@x.com")));
        let mut rx = session.watch();
        session.sign_out();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().is_none());
    }
}
