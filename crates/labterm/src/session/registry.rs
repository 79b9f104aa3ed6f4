//! In-memory session registry.
//!
//! Every transition takes the per-entry write guard of the `sessions` map,
//! so transitions on one session are serialized and sessions never contend
//! with each other. Guards are never held across an `.await`.
//!
//! Closed and failed sessions leave the registry. Only their ids are kept, in
//! `retired`, so an id is never handed out twice. Lock order is `sessions`,
//! then `retired`, then `by_container`.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::{Entry, OccupiedEntry};
use tokio_util::sync::CancellationToken;

use super::error::{LifecycleError, LifecycleResult};
use super::models::{Session, SessionState};

/// Handles of the live bridge of a session.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    /// Cancelling asks the bridge to tear down.
    pub cancel: CancellationToken,
    /// Cancelled once the bridge has finished tearing down.
    pub finished: CancellationToken,
}

/// Granted by a successful `begin_attach`.
#[derive(Debug)]
pub struct AttachTicket {
    pub session_id: String,
    pub container_name: String,
    pub cancel: CancellationToken,
    pub finished: CancellationToken,
}

/// What a late provisioning result should do.
#[derive(Debug, PartialEq, Eq)]
pub enum Reconcile {
    /// Recorded; the session is `Ready`.
    Applied,
    /// Nobody wants this sandbox any more; release it.
    Discard,
}

/// Returned by `begin_close`.
#[derive(Debug)]
pub struct Closing {
    pub session_id: String,
    pub container_name: Option<String>,
    pub previous: SessionState,
    pub bridge: Option<BridgeHandle>,
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    bridge: Option<BridgeHandle>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
    by_container: DashMap<String, String>,
    /// Final state of every session that left the registry.
    retired: DashMap<String, SessionState>,
}

fn new_session_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new `Creating` session and return its id.
    pub fn insert_creating(&self, lab_id: &str) -> String {
        loop {
            let id = new_session_id();
            if let Entry::Vacant(vacant) = self.sessions.entry(id.clone())
                && !self.retired.contains_key(&id)
            {
                vacant.insert(SessionEntry {
                    session: Session {
                        id: id.clone(),
                        lab_id: lab_id.to_string(),
                        container_name: None,
                        state: SessionState::Creating,
                        created_at: Utc::now(),
                    },
                    bridge: None,
                });
                return id;
            }
        }
    }

    /// Resolve a session id or container name to a live session id.
    pub fn resolve(&self, key: &str) -> Option<String> {
        if self.sessions.contains_key(key) {
            return Some(key.to_string());
        }
        self.by_container.get(key).map(|id| id.value().clone())
    }

    pub fn get(&self, key: &str) -> Option<Session> {
        let id = self.resolve(key)?;
        self.sessions.get(&id).map(|entry| entry.session.clone())
    }

    /// Current state of a session, including a retired one.
    pub fn state(&self, key: &str) -> Option<SessionState> {
        if let Some(session) = self.get(key) {
            return Some(session.state);
        }
        self.retired.get(key).map(|state| *state.value())
    }

    /// Live sessions, oldest first.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Ids of all sessions still in the registry.
    pub fn live_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Move a session out of the registry, leaving its id in `retired`.
    fn retire(
        &self,
        occupied: OccupiedEntry<'_, String, SessionEntry>,
        state: SessionState,
    ) -> SessionEntry {
        self.retired.insert(occupied.key().clone(), state);
        let (_, entry) = occupied.remove_entry();
        if let Some(name) = &entry.session.container_name {
            self.by_container.remove(name);
        }
        entry
    }

    /// Record a provisioned sandbox. Only a `Creating` session accepts it.
    pub fn complete_provisioning(&self, session_id: &str, container_name: &str) -> Reconcile {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return Reconcile::Discard;
        };
        if entry.session.state != SessionState::Creating {
            return Reconcile::Discard;
        }
        entry.session.state = SessionState::Ready;
        entry.session.container_name = Some(container_name.to_string());
        self.by_container
            .insert(container_name.to_string(), session_id.to_string());
        Reconcile::Applied
    }

    /// `Creating -> Failed`, retiring the session. Returns whether the
    /// transition happened.
    pub fn fail_provisioning(&self, session_id: &str) -> bool {
        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(occupied) if occupied.get().session.state == SessionState::Creating => {
                self.retire(occupied, SessionState::Failed);
                true
            }
            _ => false,
        }
    }

    /// `Ready -> Attached`, registering the bridge handles.
    pub fn begin_attach(&self, key: &str) -> LifecycleResult<AttachTicket> {
        let Some(id) = self.resolve(key) else {
            if self.retired.contains_key(key) {
                return Err(LifecycleError::SessionClosed(key.to_string()));
            }
            return Err(LifecycleError::UnknownSession(key.to_string()));
        };
        let Some(mut entry) = self.sessions.get_mut(&id) else {
            return Err(LifecycleError::SessionClosed(id));
        };

        match entry.session.state {
            SessionState::Ready => {}
            SessionState::Creating => {
                return Err(LifecycleError::NotReady {
                    session_id: id,
                    state: SessionState::Creating,
                });
            }
            SessionState::Attached => return Err(LifecycleError::AlreadyAttached(id)),
            SessionState::Closed | SessionState::Failed => {
                return Err(LifecycleError::SessionClosed(id));
            }
        }

        let Some(container_name) = entry.session.container_name.clone() else {
            return Err(LifecycleError::NotReady {
                session_id: id,
                state: entry.session.state,
            });
        };

        let handle = BridgeHandle {
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        entry.session.state = SessionState::Attached;
        entry.bridge = Some(handle.clone());

        Ok(AttachTicket {
            session_id: id,
            container_name,
            cancel: handle.cancel,
            finished: handle.finished,
        })
    }

    /// `Attached -> Ready`, or `-> Failed` (retired) when the sandbox is gone.
    /// No-op for a session closed in the meantime.
    pub fn finish_attach(&self, session_id: &str, sandbox_gone: bool) {
        let Entry::Occupied(mut occupied) = self.sessions.entry(session_id.to_string()) else {
            return;
        };
        if occupied.get().session.state != SessionState::Attached {
            return;
        }
        if sandbox_gone {
            self.retire(occupied, SessionState::Failed);
        } else {
            let entry = occupied.get_mut();
            entry.session.state = SessionState::Ready;
            entry.bridge = None;
        }
    }

    /// Retire a session as `Closed` and hand back what must be released.
    pub fn begin_close(&self, key: &str) -> Option<Closing> {
        let id = self.resolve(key)?;
        let Entry::Occupied(occupied) = self.sessions.entry(id.clone()) else {
            return None;
        };
        let previous = occupied.get().session.state;
        let entry = self.retire(occupied, SessionState::Closed);
        Some(Closing {
            session_id: id,
            container_name: entry.session.container_name,
            previous,
            bridge: entry.bridge,
        })
    }
}
