//! One live hub connection.
//!
//! A [`Session`] owns the two halves of a hub's [`Channel`]: the write half
//! sits behind an async mutex so that concurrent senders never interleave
//! frames, and the read half is driven by [`Session::listen`]. Inbound
//! envelopes are offered to registered waiters in registration order; the
//! first waiter whose predicate matches consumes the envelope.

use chrono::{DateTime, Utc};
use hubrelay_core::{
    AuthorizationContext, Channel, ChannelReceiver, ChannelSender, CloudMessage,
    CloudMessageType, RelayError, RelayResult,
};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Predicate = Box<dyn Fn(&CloudMessage) -> bool + Send>;

/// Receives the matched envelope, or [`RelayError::SessionEnded`].
pub type WaiterReceiver = oneshot::Receiver<RelayResult<CloudMessage>>;

/// Handle for removing a registered waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterId(u64);

struct Waiter {
    id: WaiterId,
    predicate: Predicate,
    completion: oneshot::Sender<RelayResult<CloudMessage>>,
}

#[derive(Default)]
struct WaiterList {
    next_id: u64,
    entries: Vec<Waiter>,
    /// Set once the receive loop has returned; later waiters fail immediately.
    ended: bool,
}

pub struct Session {
    id: u64,
    context: AuthorizationContext,
    connected_at: DateTime<Utc>,
    sender: tokio::sync::Mutex<ChannelSender>,
    receiver: Mutex<Option<ChannelReceiver>>,
    waiters: Mutex<WaiterList>,
    shutdown: CancellationToken,
}

impl Session {
    pub fn new(id: u64, context: AuthorizationContext, channel: Channel) -> Self {
        let (sender, receiver) = channel.split();
        Self {
            id,
            context,
            connected_at: Utc::now(),
            sender: tokio::sync::Mutex::new(sender),
            receiver: Mutex::new(Some(receiver)),
            waiters: Mutex::new(WaiterList::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &AuthorizationContext {
        &self.context
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Write one envelope while holding the exclusive send lock.
    pub async fn send_message(&self, message: &CloudMessage) -> RelayResult<()> {
        let mut sender = self.sender.lock().await;
        sender.send(message).await
    }

    /// Register a waiter for the first inbound envelope matching `predicate`.
    pub fn register_waiter<F>(&self, predicate: F) -> (WaiterId, WaiterReceiver)
    where
        F: Fn(&CloudMessage) -> bool + Send + 'static,
    {
        let (completion, rx) = oneshot::channel();
        let mut waiters = self.lock_waiters();
        let id = WaiterId(waiters.next_id);
        waiters.next_id += 1;

        if waiters.ended {
            let _ = completion.send(Err(RelayError::SessionEnded));
        } else {
            waiters.entries.push(Waiter {
                id,
                predicate: Box::new(predicate),
                completion,
            });
        }
        (id, rx)
    }

    /// Remove a waiter. Returns false if it already matched or was released.
    pub fn remove_waiter(&self, id: WaiterId) -> bool {
        let mut waiters = self.lock_waiters();
        let before = waiters.entries.len();
        waiters.entries.retain(|w| w.id != id);
        waiters.entries.len() != before
    }

    #[cfg(test)]
    pub fn waiter_count(&self) -> usize {
        self.lock_waiters().entries.len()
    }

    /// Offer an inbound envelope to the registered waiters.
    ///
    /// Returns true if a waiter consumed it.
    pub fn dispatch(&self, message: CloudMessage) -> bool {
        let mut waiters = self.lock_waiters();
        let Some(index) = waiters.entries.iter().position(|w| (w.predicate)(&message)) else {
            return false;
        };
        let waiter = waiters.entries.remove(index);
        // The caller may have stopped waiting; the envelope is consumed either way.
        let _ = waiter.completion.send(Ok(message));
        true
    }

    /// Run the receive loop until the channel ends, `cancel` fires, or the
    /// session is superseded.
    ///
    /// A clean close returns `Ok`. On every exit path, including the future
    /// being dropped, pending waiters are released with
    /// [`RelayError::SessionEnded`].
    pub async fn listen(&self, cancel: &CancellationToken) -> RelayResult<()> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| RelayError::Transport("session is already listening".into()))?;
        let _release = ReleaseWaiters(self);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(session_id = self.id, "session listen cancelled");
                    return Ok(());
                }
                _ = self.shutdown.cancelled() => {
                    debug!(session_id = self.id, "session shut down");
                    return Ok(());
                }
                received = receiver.receive() => match received {
                    Ok(message) => self.handle_inbound(message).await,
                    Err(RelayError::ChannelClosed) => return Ok(()),
                    Err(e) if e.is_fatal_to_session() => return Err(e),
                    Err(e) => {
                        warn!(session_id = self.id, error = %e, "discarding malformed message");
                    }
                }
            }
        }
    }

    /// Ask the receive loop to stop. Used when a newer connection supersedes
    /// this one.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Best-effort close of the write half. Safe to call repeatedly.
    pub async fn close(&self) {
        self.sender.lock().await.close().await;
    }

    async fn handle_inbound(&self, message: CloudMessage) {
        if message.message_type == CloudMessageType::Ping {
            let mut pong = CloudMessage::new(CloudMessageType::Pong);
            pong.correlation_uid = message.correlation_uid;
            if let Err(e) = self.send_message(&pong).await {
                warn!(session_id = self.id, error = %e, "failed to answer ping");
            }
            return;
        }

        let message_type = message.message_type;
        let correlation_uid = message.correlation_uid;
        if !self.dispatch(message) {
            debug!(
                session_id = self.id,
                ?message_type,
                ?correlation_uid,
                "dropping message with no waiter"
            );
        }
    }

    fn release_waiters(&self) {
        let drained = {
            let mut waiters = self.lock_waiters();
            waiters.ended = true;
            std::mem::take(&mut waiters.entries)
        };
        if !drained.is_empty() {
            debug!(session_id = self.id, count = drained.len(), "releasing pending waiters");
        }
        for waiter in drained {
            let _ = waiter.completion.send(Err(RelayError::SessionEnded));
        }
    }

    fn lock_waiters(&self) -> MutexGuard<'_, WaiterList> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ReleaseWaiters<'a>(&'a Session);

impl Drop for ReleaseWaiters<'_> {
    fn drop(&mut self) {
        self.0.release_waiters();
    }
}
