//! Watch feed over the state store.
//!
//! A feed starts with a snapshot of every identity the store knows, then
//! follows live change events. Dropping the feed and calling [`watch`] again
//! restarts it from a fresh snapshot. If a consumer falls behind the broadcast
//! buffer the feed re-emits a snapshot instead of silently skipping, so every
//! identity with a missed change is reported at least once more.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio_stream::Stream;
use tracing::{debug, warn};

use crate::store::{ChangeKind, StateStore, WatchEvent};

/// Open a watch feed on `store`.
///
/// The feed is lazy: it subscribes and takes its snapshot on first poll.
/// It ends only when the store closes the subscription's event channel.
pub fn watch(store: Arc<dyn StateStore>) -> impl Stream<Item = WatchEvent> + Send + 'static {
    async_stream::stream! {
        // Subscribe before listing so no change between the two is lost.
        let mut events = store.subscribe();

        for event in snapshot(store.as_ref()).await {
            yield event;
        }

        loop {
            match events.recv().await {
                Ok(event) => yield event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Watch feed lagged, re-emitting snapshot");
                    for event in snapshot(store.as_ref()).await {
                        yield event;
                    }
                }
                Err(RecvError::Closed) => {
                    debug!("Store closed, watch feed ending");
                    break;
                }
            }
        }
    }
}

/// One event per known identity: `Created` for live records, `Deleted` for
/// records waiting on teardown.
async fn snapshot(store: &dyn StateStore) -> Vec<WatchEvent> {
    let revision = store.revision();
    let events: Vec<WatchEvent> = store
        .list()
        .await
        .into_iter()
        .map(|(id, live)| {
            let kind = if live {
                ChangeKind::Created
            } else {
                ChangeKind::Deleted
            };
            WatchEvent::new(id, kind, revision)
        })
        .collect();
    debug!(count = events.len(), revision, "Watch snapshot");
    events
}
