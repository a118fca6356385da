//! Token-keyed table of live sessions, one namespace per connection type.

use crate::session::connection::{ConnectionSession, Rejected};
use fxcode_core::{ConnectionType, FxError, Transport};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Outcome of [`ConnectionTable::admit`].
pub enum Admitted {
    /// A new session was created and registered.
    Created(Arc<ConnectionSession>),
    /// The transport was attached to an existing session.
    Resumed(Arc<ConnectionSession>),
}

impl Admitted {
    pub fn session(&self) -> &Arc<ConnectionSession> {
        match self {
            Admitted::Created(s) | Admitted::Resumed(s) => s,
        }
    }
}

type Sessions = HashMap<String, Arc<ConnectionSession>>;

#[derive(Default)]
struct Slots {
    live: HashMap<ConnectionType, Sessions>,
    /// Tokens whose session is being created outside the lock.
    reserved: HashSet<(ConnectionType, String)>,
}

#[derive(Default)]
pub struct ConnectionTable {
    slots: Mutex<Slots>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route a handshaken transport to its session.
    ///
    /// A reconnection must name a live session; a fresh connection must not.
    /// The token is reserved while `create` runs, so two racing connections
    /// with the same token cannot both create a session. `create` itself
    /// runs without the table lock held.
    pub fn admit<F>(
        &self,
        kind: ConnectionType,
        token: &str,
        reconnection: bool,
        transport: Transport,
        create: F,
    ) -> Result<Admitted, Rejected>
    where
        F: FnOnce(Transport) -> Result<Arc<ConnectionSession>, Rejected>,
    {
        let key = (kind, token.to_string());
        {
            let mut slots = self.lock();
            let existing = slots
                .live
                .get(&kind)
                .and_then(|sessions| sessions.get(token))
                .filter(|s| !s.is_disposed())
                .cloned();

            match (reconnection, existing) {
                (true, Some(session)) => {
                    session.reconnect(transport)?;
                    return Ok(Admitted::Resumed(session));
                }
                (true, None) => {
                    return Err(Rejected {
                        error: FxError::SessionNotFound(token.to_string()),
                        transport,
                    })
                }
                (false, Some(_)) => {
                    return Err(Rejected {
                        error: FxError::TokenInUse,
                        transport,
                    })
                }
                (false, None) => {
                    if !slots.reserved.insert(key.clone()) {
                        return Err(Rejected {
                            error: FxError::TokenInUse,
                            transport,
                        });
                    }
                }
            }
        }

        let created = create(transport);

        let mut slots = self.lock();
        slots.reserved.remove(&key);
        let session = created?;
        slots
            .live
            .entry(kind)
            .or_default()
            .insert(key.1, session.clone());
        debug!(token, kind = %kind, "session registered");
        Ok(Admitted::Created(session))
    }

    pub fn get(&self, kind: ConnectionType, token: &str) -> Option<Arc<ConnectionSession>> {
        self.lock().live.get(&kind)?.get(token).cloned()
    }

    /// Remove `session` if it is still the entry registered for its token.
    pub fn remove(&self, session: &Arc<ConnectionSession>) -> bool {
        let mut slots = self.lock();
        let Some(sessions) = slots.live.get_mut(&session.kind()) else {
            return false;
        };
        match sessions.get(session.token()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(session.token());
                true
            }
            _ => false,
        }
    }

    /// Number of registered sessions of `kind`.
    pub fn len(&self, kind: ConnectionType) -> usize {
        self.lock().live.get(&kind).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self, kind: ConnectionType) -> bool {
        self.len(kind) == 0
    }

    /// Empty the table and return every session it held.
    pub fn drain(&self) -> Vec<Arc<ConnectionSession>> {
        self.lock()
            .live
            .drain()
            .flat_map(|(_, sessions)| sessions.into_values())
            .collect()
    }

    /// Dispose offline sessions of `kind`, oldest first, until at most
    /// `keep` remain. Returns how many were disposed.
    pub fn sweep_offline(&self, kind: ConnectionType, keep: usize) -> usize {
        let evicted: Vec<Arc<ConnectionSession>> = {
            let mut slots = self.lock();
            let Some(sessions) = slots.live.get_mut(&kind) else {
                return 0;
            };
            let mut offline: Vec<_> = sessions
                .values()
                .filter_map(|s| s.offline_since().map(|since| (since, s.clone())))
                .collect();
            if offline.len() <= keep {
                return 0;
            }
            offline.sort_by_key(|(since, _)| *since);
            let excess = offline.len() - keep;
            offline
                .into_iter()
                .take(excess)
                .map(|(_, s)| {
                    sessions.remove(s.token());
                    s
                })
                .collect()
        };

        for session in &evicted {
            info!(token = session.token(), kind = %kind, "disposing offline session");
            session.dispose();
        }
        evicted.len()
    }
}
