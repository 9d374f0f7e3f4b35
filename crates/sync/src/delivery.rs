//! The port to the network client.

use std::sync::Arc;

use async_trait::async_trait;
use fieldqueue_core::{Outcome, QueueEntry};

/// Performs one delivery attempt for an entry.
///
/// Implementations must send `entry.id` as the idempotency key, so a retry of
/// an attempt the server already applied is answered with success (or a
/// duplicate-key response, which maps to [`Outcome::Success`]). They classify
/// every failure into an [`Outcome`] instead of returning errors; HTTP clients
/// can use [`Outcome::from_http_status`].
///
/// The engine bounds each call with its delivery timeout and may drop the
/// future on shutdown.
#[async_trait]
pub trait DeliveryAdapter: Send + Sync {
    async fn deliver(&self, entry: &QueueEntry) -> Outcome;
}

#[async_trait]
impl<A> DeliveryAdapter for Arc<A>
where
    A: DeliveryAdapter + ?Sized,
{
    async fn deliver(&self, entry: &QueueEntry) -> Outcome {
        (**self).deliver(entry).await
    }
}
