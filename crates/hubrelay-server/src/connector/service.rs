//! Session registry and correlated request dispatch.
//!
//! The [`ConnectorService`] is created once at startup and shared by the
//! connector endpoint (which registers sessions) and the HTTP tunnel (which
//! invokes through them). Entries are only added by
//! [`ConnectorService::accept_connection`] and only removed when that call's
//! receive loop exits; there is no background cleanup.

use super::session::{Session, WaiterId};
use chrono::{DateTime, Utc};
use hubrelay_core::{AuthorizationContext, Channel, CloudMessage, RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Information returned when listing sessions.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: u64,
    pub context: AuthorizationContext,
    pub connected_at: DateTime<Utc>,
}

/// Registry of connected hubs, keyed by their [`AuthorizationContext`].
pub struct ConnectorService {
    sessions: Mutex<HashMap<AuthorizationContext, Arc<Session>>>,
    next_session_id: AtomicU64,
}

impl Default for ConnectorService {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorService {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Serve one hub connection for its whole lifetime.
    ///
    /// Registers a new session under `context`, superseding any previous
    /// session for the same identity, runs its receive loop and deregisters
    /// it afterwards. Failures are logged here and never reach the caller.
    pub async fn accept_connection(
        &self,
        channel: Channel,
        context: AuthorizationContext,
        cancel: CancellationToken,
    ) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(session_id, context.clone(), channel));

        let registration = Registration {
            service: self,
            context: context.clone(),
            session_id,
        };
        if let Some(previous) = self.register(&context, session.clone()) {
            info!(
                identity = %context,
                session_id,
                previous_session_id = previous.id(),
                "hub reconnected, superseding previous session"
            );
            previous.shutdown();
        } else {
            info!(
                identity = %context,
                session_id,
                sessions = self.session_count(),
                "hub connected"
            );
        }

        let result = session.listen(&cancel).await;
        drop(registration);

        let sessions = self.session_count();
        match result {
            Ok(()) => info!(identity = %context, session_id, sessions, "hub disconnected"),
            Err(e) => error!(
                identity = %context,
                session_id,
                sessions,
                error = %e,
                "hub session failed"
            ),
        }
        session.close().await;
    }

    /// Send `request` to the hub for `context` and wait for its reply.
    ///
    /// A fresh correlation id is assigned to `request`. Resolves with the
    /// matching reply, [`RelayError::SessionNotFound`] when no hub is
    /// connected, [`RelayError::SessionEnded`] when the hub goes away while
    /// waiting, or [`RelayError::Cancelled`] once `cancel` fires. The waiter
    /// is removed on every path.
    pub async fn invoke(
        &self,
        context: &AuthorizationContext,
        mut request: CloudMessage,
        cancel: &CancellationToken,
    ) -> RelayResult<CloudMessage> {
        let correlation_uid = Uuid::new_v4();
        request.correlation_uid = Some(correlation_uid);

        let session = self.session(context)?;
        let (waiter_id, reply) =
            session.register_waiter(move |message| message.correlates_with(&correlation_uid));
        let _waiter = WaiterGuard {
            session: &session,
            id: waiter_id,
        };

        // A channel closed under us means the hub went away between lookup and send.
        session.send_message(&request).await.map_err(|e| match e {
            RelayError::ChannelClosed => RelayError::SessionEnded,
            other => other,
        })?;
        debug!(identity = %context, %correlation_uid, "request sent to hub");

        tokio::select! {
            biased;
            reply = reply => reply.unwrap_or(Err(RelayError::SessionEnded)),
            _ = cancel.cancelled() => Err(RelayError::Cancelled),
        }
    }

    /// Number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Whether a hub is currently connected for `context`.
    #[cfg(test)]
    pub fn is_connected(&self, context: &AuthorizationContext) -> bool {
        self.lock_sessions().contains_key(context)
    }

    /// Snapshot of all registered sessions.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.lock_sessions()
            .values()
            .map(|s| SessionInfo {
                session_id: s.id(),
                context: s.context().clone(),
                connected_at: s.connected_at(),
            })
            .collect()
    }

    fn session(&self, context: &AuthorizationContext) -> RelayResult<Arc<Session>> {
        self.lock_sessions()
            .get(context)
            .cloned()
            .ok_or_else(|| RelayError::SessionNotFound(context.to_string()))
    }

    fn register(
        &self,
        context: &AuthorizationContext,
        session: Arc<Session>,
    ) -> Option<Arc<Session>> {
        self.lock_sessions().insert(context.clone(), session)
    }

    /// Remove `context` only if it still points at `session_id`; a newer
    /// session under the same identity stays registered.
    fn deregister(&self, context: &AuthorizationContext, session_id: u64) {
        let mut sessions = self.lock_sessions();
        if sessions.get(context).is_some_and(|s| s.id() == session_id) {
            sessions.remove(context);
            debug!(identity = %context, session_id, "session deregistered");
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<AuthorizationContext, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deregisters a session when dropped, so that an aborted accept still
/// cleans up the registry.
struct Registration<'a> {
    service: &'a ConnectorService,
    context: AuthorizationContext,
    session_id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.service.deregister(&self.context, self.session_id);
    }
}

struct WaiterGuard<'a> {
    session: &'a Session,
    id: WaiterId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.session.remove_waiter(self.id);
    }
}
