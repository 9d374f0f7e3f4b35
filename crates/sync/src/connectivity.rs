//! Connectivity signals.
//!
//! The engine never asks the platform directly whether it is online. It is
//! handed a [`ConnectivityPort`], which the host wires to whatever signal it
//! has (OS network events, a reachability probe, a toggle in tests). The
//! signal is a hint: being "online" does not promise that a delivery will
//! succeed, and the engine copes with both false positives and negatives.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Connectivity state of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

/// Something the engine should react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// Transition to online.
    Online,
    /// Transition to offline.
    Offline,
    /// The user asked to retry now.
    RetryRequested,
}

/// Live stream of connectivity events.
///
/// Dropping the subscription unsubscribes; the publisher forgets it on its
/// next publish.
#[derive(Debug)]
pub struct ConnectivitySubscription {
    receiver: mpsc::UnboundedReceiver<ConnectivityEvent>,
}

impl ConnectivitySubscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<ConnectivityEvent>) -> Self {
        Self { receiver }
    }

    /// Wait for the next event. `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<ConnectivityEvent> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ConnectivityEvent> {
        self.receiver.try_recv().ok()
    }

    /// Explicitly stop listening. Same as dropping.
    pub fn unsubscribe(self) {}
}

/// Source of connectivity state and events.
pub trait ConnectivityPort: Send + Sync {
    fn is_online(&self) -> bool;

    fn subscribe(&self) -> ConnectivitySubscription;
}

impl<P> ConnectivityPort for Arc<P>
where
    P: ConnectivityPort + ?Sized,
{
    fn is_online(&self) -> bool {
        (**self).is_online()
    }

    fn subscribe(&self) -> ConnectivitySubscription {
        (**self).subscribe()
    }
}

#[derive(Debug)]
struct MonitorState {
    state: ConnectivityState,
    subscribers: Vec<mpsc::UnboundedSender<ConnectivityEvent>>,
}

/// In-process connectivity source that the host (or a test) drives.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    inner: Mutex<MonitorState>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        Self {
            inner: Mutex::new(MonitorState {
                state: initial,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn online() -> Self {
        Self::new(ConnectivityState::Online)
    }

    pub fn offline() -> Self {
        Self::new(ConnectivityState::Offline)
    }

    pub fn state(&self) -> ConnectivityState {
        self.lock().state
    }

    /// Record the current state. Subscribers hear only actual transitions.
    pub fn set_online(&self, online: bool) {
        let next = if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        };

        let mut inner = self.lock();
        if inner.state == next {
            return;
        }
        inner.state = next;
        tracing::info!(state = ?next, "connectivity changed");

        let event = match next {
            ConnectivityState::Online => ConnectivityEvent::Online,
            ConnectivityState::Offline => ConnectivityEvent::Offline,
        };
        Self::publish(&mut inner, event);
    }

    /// Ask for an immediate drain, skipping any backoff in progress.
    pub fn request_retry(&self) {
        let mut inner = self.lock();
        tracing::debug!("manual retry requested");
        Self::publish(&mut inner, ConnectivityEvent::RetryRequested);
    }

    fn publish(inner: &mut MonitorState, event: ConnectivityEvent) {
        // Drop any dead subscribers while publishing.
        inner.subscribers.retain(|tx| tx.send(event).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        // The state stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::online()
    }
}

impl ConnectivityPort for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        self.state() == ConnectivityState::Online
    }

    fn subscribe(&self) -> ConnectivitySubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        ConnectivitySubscription::new(rx)
    }
}
