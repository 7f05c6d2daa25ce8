//! Packet identifiers for outbound QoS 1 `PUBLISH`, `SUBSCRIBE` and `UNSUBSCRIBE` packets.
//!
//! > Each time a Client sends a new SUBSCRIBE, UNSUBSCRIBE, or PUBLISH (where QoS > 0) MQTT Control
//! > Packet it MUST assign it a non-zero Packet Identifier that is currently unused [MQTT-2.2.1-3].
//!
//! The pool hands out identifiers `1..=capacity` and takes them back when the matching
//! acknowledgement arrives. When every identifier is in flight, [`IdPool::next()`] waits for one
//! to be released, up to a timeout.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::mqtt::middleware::{handler_fn, DynHandler, In, Out};
use crate::mqtt::Error;
use crate::protocol::{Packet, QoS};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct IdPool {
    /// Indexed by `id - 1`: Unix time in milliseconds at which the id was handed out, 0 if free.
    used: Box<[AtomicU64]>,
    free: Mutex<VecDeque<u16>>,
    /// One permit per entry in `free`.
    permits: Semaphore,
    timeout: Duration,
}

impl IdPool {
    pub fn new(capacity: u16, timeout: Duration) -> Self {
        Self {
            used: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            free: Mutex::new((1..=capacity).collect()),
            permits: Semaphore::new(capacity.into()),
            timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.used.len()
    }

    /// The number of identifiers not currently in flight.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Take a free identifier, waiting for one to be released if there are none.
    ///
    /// Fails with [`Error::NoPacketIds`] if none was released within the pool's timeout,
    /// or [`Error::Cancelled`] as soon as `token` is cancelled.
    pub async fn next(&self, token: &CancellationToken) -> Result<u16, Error> {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            res = tokio::time::timeout(self.timeout, self.permits.acquire()) => match res {
                Ok(Ok(permit)) => permit,
                // The semaphore is never closed, so this is only ever the timeout.
                Ok(Err(_)) | Err(_) => return Err(Error::NoPacketIds),
            },
        };

        // The permit now stands for the id we're taking out of the queue.
        permit.forget();

        let id = self
            .free()
            .pop_front()
            .expect("BUG: acquired a permit but the free queue is empty");

        self.used[usize::from(id) - 1].store(now_millis(), Ordering::Release);

        Ok(id)
    }

    /// Return `id` to the pool.
    ///
    /// Returns `id`, or 0 without doing anything if `id` is out of range or isn't in flight.
    pub fn release(&self, id: u16) -> u16 {
        let Some(slot) = usize::from(id)
            .checked_sub(1)
            .and_then(|idx| self.used.get(idx))
        else {
            return 0;
        };

        if slot.swap(0, Ordering::AcqRel) == 0 {
            return 0;
        }

        self.free().push_back(id);
        self.permits.add_permits(1);

        id
    }

    /// When `id` was handed out, `None` if it's free or out of range.
    pub fn issued_at(&self, id: u16) -> Option<SystemTime> {
        let millis = self
            .used
            .get(usize::from(id).checked_sub(1)?)?
            .load(Ordering::Acquire);

        (millis != 0).then(|| UNIX_EPOCH + Duration::from_millis(millis))
    }

    pub fn is_free(&self, id: u16) -> bool {
        self.free().contains(&id)
    }

    fn free(&self) -> MutexGuard<'_, VecDeque<u16>> {
        // The queue is always left consistent, so a panic elsewhere doesn't poison it.
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for IdPool {
    fn default() -> Self {
        Self::new(u16::MAX, DEFAULT_TIMEOUT)
    }
}

fn now_millis() -> u64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |it| it.as_millis() as u64);

    // 0 means free.
    millis.max(1)
}

/// Ingress: releases the identifier of every acknowledgement of a packet we sent.
///
/// `PUBREL` isn't one of them: it acknowledges a `PUBREC` we sent for the peer's identifier.
pub struct ReleaseIds(pub Arc<IdPool>);

impl In for ReleaseIds {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        let pool = self.0.clone();

        handler_fn(move |token, packet| {
            match &packet {
                Packet::PubAck(ack) | Packet::PubRec(ack) | Packet::PubComp(ack) => {
                    pool.release(ack.packet_id);
                }
                Packet::SubAck(suback) => {
                    pool.release(suback.packet_id);
                }
                Packet::UnsubAck(unsuback) => {
                    pool.release(unsuback.packet_id);
                }
                _ => (),
            }

            let next = next.clone();
            async move { next.handle(&token, packet).await }
        })
    }
}

/// Egress: assigns an identifier to every packet that needs one and doesn't have one yet.
pub struct AssignIds(pub Arc<IdPool>);

impl Out for AssignIds {
    fn wrap(&self, next: DynHandler) -> DynHandler {
        let pool = self.0.clone();

        handler_fn(move |token, mut packet| {
            let pool = pool.clone();
            let next = next.clone();

            async move {
                let needs_id = match &packet {
                    Packet::Publish(publish) => publish.qos > QoS::AtMostOnce,
                    Packet::Subscribe(_) | Packet::Unsubscribe(_) => true,
                    _ => false,
                };

                if !needs_id || packet.packet_id() != Some(0) {
                    return next.handle(&token, packet).await;
                }

                let id = pool.next(&token).await?;
                packet.set_packet_id(id);

                let res = next.handle(&token, packet).await;

                // Nothing will acknowledge a packet that was never sent.
                if res.is_err() {
                    pool.release(id);
                }

                res
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::mqtt::middleware::{combine_in, combine_out};
    use crate::protocol::{Ack, Publish, SubAck};

    #[tokio::test]
    async fn issue_and_release() {
        let pool = IdPool::new(3, DEFAULT_TIMEOUT);
        let token = CancellationToken::new();

        assert_eq!(pool.available(), 3);

        let id = pool.next(&token).await.unwrap();
        assert_eq!(id, 1);
        assert!(!pool.is_free(id));
        assert!(pool.issued_at(id).is_some());
        assert_eq!(pool.available(), 2);

        assert_eq!(pool.release(id), 1);
        assert!(pool.is_free(id));
        assert_eq!(pool.issued_at(id), None);

        // Releasing twice is a no-op.
        assert_eq!(pool.release(id), 0);
        assert_eq!(pool.available(), 3);

        // Reclaimed ids go to the back of the queue.
        assert_eq!(pool.next(&token).await.unwrap(), 2);
        assert_eq!(pool.next(&token).await.unwrap(), 3);
        assert_eq!(pool.next(&token).await.unwrap(), 1);
        assert_eq!(pool.available(), 0);

        for id in 1..=3 {
            pool.release(id);
        }

        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn release_out_of_range() {
        let pool = IdPool::new(2, DEFAULT_TIMEOUT);

        assert_eq!(pool.release(0), 0);
        assert_eq!(pool.release(3), 0);
        assert_eq!(pool.release(u16::MAX), 0);
        assert_eq!(pool.release(1), 0);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_times_out() {
        let pool = IdPool::new(1, Duration::from_secs(3));
        let token = CancellationToken::new();

        assert_eq!(pool.next(&token).await.unwrap(), 1);

        let start = tokio::time::Instant::now();
        assert!(matches!(pool.next(&token).await, Err(Error::NoPacketIds)));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn release_wakes_waiter() {
        let pool = Arc::new(IdPool::new(1, Duration::from_secs(3)));
        let token = CancellationToken::new();

        assert_eq!(pool.next(&token).await.unwrap(), 1);

        let waiter = tokio::spawn({
            let pool = pool.clone();
            let token = token.clone();
            async move { pool.next(&token).await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        pool.release(1);

        assert_eq!(waiter.await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancellation() {
        let pool = IdPool::new(0, Duration::from_secs(3600));
        let token = CancellationToken::new();
        token.cancel();

        assert!(matches!(pool.next(&token).await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn middlewares() {
        let pool = Arc::new(IdPool::new(8, DEFAULT_TIMEOUT));
        let token = CancellationToken::new();
        let sent = Arc::new(Mutex::new(Vec::new()));

        let egress = combine_out(
            {
                let sent = sent.clone();
                handler_fn(move |_, packet| {
                    sent.lock().unwrap().push(packet.packet_id());
                    async { Ok(()) }
                })
            },
            &[&AssignIds(pool.clone())],
        );

        let ingress = combine_in(
            handler_fn(|_, _| async { Ok(()) }),
            &[&ReleaseIds(pool.clone())],
        );

        egress
            .handle(&token, Packet::Publish(Publish::new("a", QoS::AtLeastOnce, "x")))
            .await
            .unwrap();
        egress
            .handle(&token, Packet::Publish(Publish::new("a", QoS::AtMostOnce, "x")))
            .await
            .unwrap();

        let mut preassigned = Publish::new("a", QoS::AtLeastOnce, "x");
        preassigned.packet_id = 42;
        egress
            .handle(&token, Packet::Publish(preassigned))
            .await
            .unwrap();

        assert_eq!(*sent.lock().unwrap(), [Some(1), Some(0), Some(42)]);
        assert_eq!(pool.available(), 7);

        ingress
            .handle(&token, Packet::PubAck(Ack::new(1)))
            .await
            .unwrap();
        assert_eq!(pool.available(), 8);

        // Unknown ids are ignored.
        ingress
            .handle(
                &token,
                Packet::SubAck(SubAck {
                    packet_id: 5,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();
        assert_eq!(pool.available(), 8);
    }

    #[tokio::test]
    async fn failed_send_releases_id() {
        let pool = Arc::new(IdPool::new(1, DEFAULT_TIMEOUT));
        let token = CancellationToken::new();

        let egress = combine_out(
            handler_fn(|_, _| async { Err(Error::Closed) }),
            &[&AssignIds(pool.clone())],
        );

        assert!(egress
            .handle(&token, Packet::Publish(Publish::new("a", QoS::AtLeastOnce, "x")))
            .await
            .is_err());
        assert_eq!(pool.available(), 1);
    }
}
