//! Fans published messages out to the sessions subscribed to them.

use std::cmp;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::collections::{FnvHashMap, FnvHashSet};
use crate::mqtt::middleware::DynHandler;
use crate::mqtt::session::SessionId;
use crate::mqtt::topic::Filter;
use crate::mqtt::trie::RoutingTree;
use crate::protocol::{Packet, Property, Publish, QoS};

/// Where a session wants its matching publishes delivered.
pub struct Subscription {
    pub session: SessionId,
    pub subscription_id: Option<u32>,
    /// The subscriber's session token; deliveries are skipped once it's cancelled.
    pub token: CancellationToken,
    /// The subscriber's egress chain.
    pub handler: DynHandler,
}

#[derive(Clone)]
struct Entry {
    subscription: Arc<Subscription>,
    qos: QoS,
}

#[derive(Default)]
struct Inner {
    tree: RoutingTree<Entry>,
    /// The filters each session is subscribed to, for cleaning up after it.
    sessions: FnvHashMap<SessionId, FnvHashSet<String>>,
}

#[derive(Default)]
pub struct Router {
    inner: RwLock<Inner>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `filter` with the granted `qos`.
    ///
    /// Replaces any subscription the same session already has on the same filter.
    pub async fn subscribe(&self, filter: &Filter, qos: QoS, subscription: Arc<Subscription>) {
        let session = subscription.session;
        let mut inner = self.inner.write().await;

        inner
            .tree
            .remove(filter.as_str(), |entry| entry.subscription.session == session);
        inner.tree.add_filter(
            filter.as_str(),
            Entry {
                subscription,
                qos,
            },
        );

        inner
            .sessions
            .entry(session)
            .or_default()
            .insert(filter.as_str().to_string());
    }

    /// Remove `session`'s subscription on `filter`, returning whether there was one.
    ///
    /// Other sessions' subscriptions on the same filter are untouched.
    pub async fn unsubscribe(&self, session: SessionId, filter: &str) -> bool {
        let mut inner = self.inner.write().await;

        let removed = inner
            .tree
            .remove(filter, |entry| entry.subscription.session == session);

        if let Some(filters) = inner.sessions.get_mut(&session) {
            filters.remove(filter);

            if filters.is_empty() {
                inner.sessions.remove(&session);
            }
        }

        !removed.is_empty()
    }

    /// Remove every subscription of `session`, returning how many there were.
    pub async fn remove_session(&self, session: SessionId) -> usize {
        let mut inner = self.inner.write().await;

        let Some(filters) = inner.sessions.remove(&session) else {
            return 0;
        };

        filters
            .iter()
            .map(|filter| {
                inner
                    .tree
                    .remove(filter, |entry| entry.subscription.session == session)
                    .len()
            })
            .sum()
    }

    /// Deliver `publish` to every matching subscription, returning the number of deliveries.
    ///
    /// Deliveries happen one after the other, in tree order then subscription order. A failed
    /// delivery is logged and doesn't stop the others.
    ///
    /// The matching subscriptions are captured under the read lock and delivered to after it is
    /// released. A session that unsubscribes in between may still receive this publish after its
    /// `UNSUBACK`; a session that has ended won't, since its token is cancelled first.
    pub async fn route(&self, publish: &Publish) -> usize {
        // Don't hold the lock while sending, a slow subscriber would stall every (un)subscribe.
        let entries: Vec<Entry> = {
            let inner = self.inner.read().await;

            inner
                .tree
                .matches(&publish.topic)
                .into_iter()
                .flat_map(|node_id| inner.tree.values(node_id).iter().cloned())
                .collect()
        };

        let mut delivered = 0;

        for entry in entries {
            let subscription = &entry.subscription;

            if subscription.token.is_cancelled() {
                continue;
            }

            let packet = Packet::Publish(outgoing(publish, entry.qos, subscription.subscription_id));

            match subscription.handler.handle(&subscription.token, packet).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        topic = %publish.topic,
                        session = %subscription.session,
                        "failed to deliver publish: {e}"
                    );
                }
            }
        }

        delivered
    }

    /// The filter of every leaf of the routing tree, in tree order.
    pub async fn filters(&self) -> Vec<String> {
        self.inner.read().await.tree.filters()
    }

    /// The total number of subscriptions across all sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.tree.len()
    }
}

/// The copy of `publish` sent to one subscriber.
fn outgoing(publish: &Publish, granted: QoS, subscription_id: Option<u32>) -> Publish {
    let mut properties = publish.properties.clone();
    // Topic aliases are per connection, subscription identifiers are per subscriber.
    properties.0.retain(|property| {
        !matches!(
            property,
            Property::TopicAlias(_) | Property::SubscriptionIdentifier(_)
        )
    });

    if let Some(id) = subscription_id {
        properties.push(Property::SubscriptionIdentifier(id));
    }

    Publish {
        dup: false,
        qos: cmp::min(publish.qos, granted),
        retain: false,
        topic: publish.topic.clone(),
        // Assigned by the subscriber's egress chain.
        packet_id: 0,
        payload: publish.payload.clone(),
        properties,
    }
}
