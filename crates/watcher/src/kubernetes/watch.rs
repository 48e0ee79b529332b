//! The per-kind watch loop and its reconnect supervisor.
//!
//! One watch stream is opened per resource kind. Every delivered event
//! is evaluated against all subscriptions of that kind and forwarded to
//! each matching sink in server order; a slow consumer throttles the
//! stream rather than losing events. Any stream termination other than
//! cancellation is a transient failure and the supervisor reopens the
//! stream after an exponential backoff.

use std::future::Future;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::api::{Api, ListParams, WatchEvent};
use kube::error::ErrorResponse;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{update_from, EventType, ResourceKind, Subscription, Update, Watched};
use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};

/// Errors that terminate a single watch attempt.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The watch request could not be opened.
    #[error("failed to open watch stream")]
    Connect(#[source] kube::Error),
    /// The stream yielded a transport error.
    #[error("watch stream error")]
    Stream(#[source] kube::Error),
    /// The remote end closed the stream.
    #[error("watch stream closed by remote end")]
    Closed,
    /// The resource store sent an error event (e.g. expired resource
    /// version).
    #[error("error event from resource store: {} (code {})", .0.message, .0.code)]
    Event(ErrorResponse),
}

/// Runs the watch loop for one resource kind until cancelled,
/// transparently reopening the stream after failures.
pub(crate) async fn supervise<K: Watched>(
    api: Api<K>,
    subscriptions: Vec<Subscription<K::Data>>,
    token: CancellationToken,
) {
    let subscriptions = Arc::new(subscriptions);
    let attempt_token = token.clone();
    let attempt = move || {
        let api = api.clone();
        let subscriptions = Arc::clone(&subscriptions);
        let token = attempt_token.clone();
        async move { watch_kind(&api, &subscriptions, &token).await }
    };
    supervise_with(
        attempt,
        ExponentialBackoffStrategy::default(),
        token,
        K::KIND,
    )
    .await
}

/// The supervisor state machine: run an attempt, and on any return other
/// than cancellation wait out a backoff before the next one.
pub(crate) async fn supervise_with<F, Fut, B>(
    mut attempt: F,
    mut backoff: B,
    token: CancellationToken,
    kind: ResourceKind,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), WatchError>>,
    B: BackoffStrategy,
{
    loop {
        match attempt().await {
            // A clean return means cancellation was observed.
            Ok(()) => {
                debug!(kind = %kind, "watch cancelled, shutting down");
                return;
            }
            Err(error) => {
                if token.is_cancelled() {
                    return;
                }
                let delay = backoff.next_duration();
                debug!(kind = %kind, error = %error, delay = ?delay, "watch stream ended, reconnecting after backoff");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

async fn watch_kind<K: Watched>(
    api: &Api<K>,
    subscriptions: &[Subscription<K::Data>],
    token: &CancellationToken,
) -> Result<(), WatchError> {
    let params = ListParams::default();
    // Resource version "0" makes the server replay current state as
    // synthetic Added events, so every (re)connect is a full resync.
    let stream = api
        .watch(&params, "0")
        .await
        .map_err(WatchError::Connect)?;
    pump(stream, subscriptions, token).await
}

enum Delivery {
    Complete,
    Cancelled,
}

/// Reads a watch stream to completion, demultiplexing each event to all
/// matching subscriptions.
async fn pump<K, S>(
    stream: S,
    subscriptions: &[Subscription<K::Data>],
    token: &CancellationToken,
) -> Result<(), WatchError>
where
    K: Watched,
    S: Stream<Item = Result<WatchEvent<K>, kube::Error>>,
{
    futures::pin_mut!(stream);
    loop {
        let item = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            item = stream.next() => item,
        };
        let (event_type, object) = match item {
            None => return Err(WatchError::Closed),
            Some(Err(error)) => return Err(WatchError::Stream(error)),
            Some(Ok(WatchEvent::Error(response))) => return Err(WatchError::Event(response)),
            Some(Ok(WatchEvent::Bookmark(_))) => continue,
            Some(Ok(WatchEvent::Added(object))) => (EventType::Added, object),
            Some(Ok(WatchEvent::Modified(object))) => (EventType::Modified, object),
            Some(Ok(WatchEvent::Deleted(object))) => (EventType::Deleted, object),
        };
        let update = update_from(event_type, object);
        if let Delivery::Cancelled = deliver(update, subscriptions, token).await {
            return Ok(());
        }
    }
}

/// Sends one update record to every subscription whose selector matches.
///
/// Sends block until the consumer accepts the record; the only way out
/// of a blocked send is cancellation.
async fn deliver<D: Clone>(
    update: Update<D>,
    subscriptions: &[Subscription<D>],
    token: &CancellationToken,
) -> Delivery {
    debug!(resource = %update.meta(), event = %update.event_type, "observed event");
    for subscription in subscriptions {
        if !subscription.selector.matches(&update.labels) {
            continue;
        }
        let send = subscription.sink.send(update.clone());
        tokio::select! {
            _ = token.cancelled() => return Delivery::Cancelled,
            sent = send => {
                if sent.is_err() {
                    // The consumer task is gone; other subscriptions may
                    // still be live, so keep delivering.
                    error!(
                        resource = %update.meta(),
                        selector = %subscription.selector,
                        "subscription sink closed, dropping event for this subscription",
                    );
                }
            }
        }
    }
    Delivery::Complete
}
