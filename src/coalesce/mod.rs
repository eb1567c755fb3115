//! Per-(project, fingerprint) single-flight coalescing.
//!
//! At most one upstream request is in flight for a given key; later
//! arrivals attach as followers and receive the leader's outcome verbatim.
//! The leader's upstream work runs in a detached task that owns the
//! upstream connection; every waiting client (the leader's own connection
//! included) holds a waiter registration. Client disconnects drop only
//! that registration, and the upstream call is cancelled only when the
//! last waiter is gone, so leadership transfers implicitly to any
//! surviving follower.
//!
//! Followers attach only while the leader is younger than a configurable
//! bound; past it the leader is presumed stuck and the next arrival takes
//! over the slot.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    canonical::Fingerprint,
    observability::metrics,
    providers::ProviderError,
    streaming::StreamBroadcaster,
};

type FlightKey = (String, Fingerprint, FlightForm);

/// The response form a flight produces. A streaming and a unary request
/// for the same canonical content are not identical requests; they fly
/// separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlightForm {
    Unary,
    Stream,
}

/// A completed unary upstream exchange, fanned out to every waiter.
#[derive(Debug, Clone)]
pub struct UnaryResult {
    pub body: Bytes,
    pub content_type: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

pub type SharedUnary = Result<UnaryResult, ProviderError>;

struct Flight {
    created_at: Instant,
    unary_tx: watch::Sender<Option<SharedUnary>>,
    broadcaster: Arc<StreamBroadcaster>,
    waiters: AtomicUsize,
    finished: AtomicBool,
    cancel: CancellationToken,
}

impl Flight {
    fn new() -> Arc<Self> {
        let (unary_tx, _) = watch::channel(None);
        Arc::new(Self {
            created_at: Instant::now(),
            unary_tx,
            broadcaster: StreamBroadcaster::new(),
            waiters: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }
}

/// Role this caller plays in the flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Coalescer: the in-flight map plus the follower-attach age bound.
pub struct Coalescer {
    flights: DashMap<FlightKey, Arc<Flight>>,
    leader_max_age: Duration,
}

impl Coalescer {
    pub fn new(leader_max_age: Duration) -> Arc<Self> {
        Arc::new(Self {
            flights: DashMap::new(),
            leader_max_age,
        })
    }

    /// Number of live flights, for analytics and tests.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Join the flight for a key, becoming its leader or a follower.
    pub fn join(
        self: &Arc<Self>,
        project_id: &str,
        fingerprint: Fingerprint,
        form: FlightForm,
    ) -> FlightRef {
        use dashmap::mapref::entry::Entry;

        let key: FlightKey = (project_id.to_string(), fingerprint, form);

        loop {
            match self.flights.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    let flight = Arc::clone(occupied.get());
                    let attachable = !flight.finished.load(Ordering::Acquire)
                        && !flight.cancel.is_cancelled()
                        && flight.created_at.elapsed() < self.leader_max_age;

                    if attachable {
                        flight.waiters.fetch_add(1, Ordering::AcqRel);
                        // The flight may have been cancelled between the
                        // check and the increment; retry rather than attach
                        // to a dying flight.
                        if flight.cancel.is_cancelled() {
                            flight.waiters.fetch_sub(1, Ordering::AcqRel);
                            continue;
                        }
                        metrics::record_coalesce_join("follower");
                        return FlightRef {
                            coalescer: Arc::clone(self),
                            key,
                            flight,
                            role: Role::Follower,
                            counted: true,
                        };
                    }

                    // Stale or dead leader: presume it stuck and take over
                    // the slot with a fresh flight.
                    let fresh = Flight::new();
                    fresh.waiters.fetch_add(1, Ordering::AcqRel);
                    occupied.insert(Arc::clone(&fresh));
                    metrics::record_coalesce_join("leader");
                    metrics::record_inflight(1.0);
                    return FlightRef {
                        coalescer: Arc::clone(self),
                        key,
                        flight: fresh,
                        role: Role::Leader,
                        counted: true,
                    };
                }
                Entry::Vacant(vacant) => {
                    let fresh = Flight::new();
                    fresh.waiters.fetch_add(1, Ordering::AcqRel);
                    vacant.insert(Arc::clone(&fresh));
                    metrics::record_coalesce_join("leader");
                    metrics::record_inflight(1.0);
                    return FlightRef {
                        coalescer: Arc::clone(self),
                        key,
                        flight: fresh,
                        role: Role::Leader,
                        counted: true,
                    };
                }
            }
        }
    }

    fn remove_flight(&self, key: &FlightKey, flight: &Arc<Flight>) {
        self.flights
            .remove_if(key, |_, current| Arc::ptr_eq(current, flight));
    }
}

/// A waiter's handle on a flight. Dropping it deregisters the waiter; when
/// the last waiter is gone before the flight finished, the upstream call
/// is cancelled.
pub struct FlightRef {
    coalescer: Arc<Coalescer>,
    key: FlightKey,
    flight: Arc<Flight>,
    role: Role,
    counted: bool,
}

impl FlightRef {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Publisher for the leader's detached upstream task. Carries no
    /// waiter registration: the upstream task itself must not keep its own
    /// flight alive.
    pub fn publisher(&self) -> FlightPublisher {
        FlightPublisher {
            coalescer: Arc::clone(&self.coalescer),
            key: self.key.clone(),
            flight: Arc::clone(&self.flight),
        }
    }

    /// Wait for the leader's unary outcome.
    pub async fn await_unary(&self) -> SharedUnary {
        let mut rx = self.flight.unary_tx.subscribe();
        loop {
            if let Some(result) = rx.borrow_and_update().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Publisher dropped without a result; surface as an
                // upstream failure rather than hanging the waiter.
                return Err(ProviderError::Network(
                    "request leader terminated without a result".to_string(),
                ));
            }
        }
    }

    /// Attach to the live stream fan-out: buffered prefix, then the tail.
    pub fn subscribe_stream(
        &self,
    ) -> impl futures_util::Stream<Item = Result<Bytes, ProviderError>> + Send + use<> {
        self.flight.broadcaster.subscribe()
    }
}

impl Drop for FlightRef {
    fn drop(&mut self) {
        if !self.counted {
            return;
        }
        let remaining = self.flight.waiters.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && !self.flight.finished.load(Ordering::Acquire) {
            // Last waiter gone: nobody is left to receive the result, so
            // the upstream context is cancelled and the slot freed.
            self.flight.cancel.cancel();
            self.coalescer.remove_flight(&self.key, &self.flight);
        }
    }
}

/// The leader task's handle for publishing the flight outcome.
pub struct FlightPublisher {
    coalescer: Arc<Coalescer>,
    key: FlightKey,
    flight: Arc<Flight>,
}

impl FlightPublisher {
    /// Cancelled when every waiter has disconnected.
    pub fn cancellation(&self) -> CancellationToken {
        self.flight.cancel.clone()
    }

    /// Fan-out for a streaming flight.
    pub fn broadcaster(&self) -> Arc<StreamBroadcaster> {
        Arc::clone(&self.flight.broadcaster)
    }

    /// Publish the unary outcome (success or error) to every waiter and
    /// release the slot.
    pub fn publish_unary(&self, result: SharedUnary) {
        self.finish();
        let _ = self.flight.unary_tx.send(Some(result));
    }

    /// Terminate a streaming flight cleanly and release the slot.
    pub fn finish_stream(&self) {
        self.finish();
        self.flight.broadcaster.finish();
    }

    /// Fail a streaming flight; every attached client observes the error.
    pub fn fail_stream(&self, error: ProviderError) {
        self.finish();
        self.flight.broadcaster.fail(error);
    }

    fn finish(&self) {
        if !self.flight.finished.swap(true, Ordering::AcqRel) {
            metrics::record_inflight(-1.0);
        }
        self.coalescer.remove_flight(&self.key, &self.flight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint([byte; 32])
    }

    fn coalescer() -> Arc<Coalescer> {
        Coalescer::new(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn first_join_leads_rest_follow() {
        let c = coalescer();
        let leader = c.join("p1", fp(1), FlightForm::Unary);
        let follower = c.join("p1", fp(1), FlightForm::Unary);

        assert_eq!(leader.role(), Role::Leader);
        assert_eq!(follower.role(), Role::Follower);
        assert_eq!(c.in_flight(), 1);
    }

    #[tokio::test]
    async fn different_projects_do_not_coalesce() {
        let c = coalescer();
        let a = c.join("p1", fp(1), FlightForm::Unary);
        let b = c.join("p2", fp(1), FlightForm::Unary);
        assert!(a.is_leader());
        assert!(b.is_leader());
    }

    #[tokio::test]
    async fn forms_fly_separately() {
        let c = coalescer();
        let unary = c.join("p1", fp(1), FlightForm::Unary);
        let stream = c.join("p1", fp(1), FlightForm::Stream);
        assert!(unary.is_leader());
        assert!(stream.is_leader());
    }

    #[tokio::test]
    async fn published_result_reaches_every_waiter() {
        let c = coalescer();
        let leader = c.join("p1", fp(1), FlightForm::Unary);
        let follower_a = c.join("p1", fp(1), FlightForm::Unary);
        let follower_b = c.join("p1", fp(1), FlightForm::Unary);

        let publisher = leader.publisher();
        let wait_a = tokio::spawn(async move { follower_a.await_unary().await });
        let wait_b = tokio::spawn(async move { follower_b.await_unary().await });

        publisher.publish_unary(Ok(UnaryResult {
            body: Bytes::from_static(b"{\"ok\":true}"),
            content_type: "application/json".to_string(),
            tokens_in: 9,
            tokens_out: 2,
        }));

        let a = wait_a.await.unwrap().unwrap();
        let b = wait_b.await.unwrap().unwrap();
        assert_eq!(a.body, b.body);
        assert_eq!(a.tokens_out, 2);

        // The leader's own handle also observes the published value.
        assert!(leader.await_unary().await.is_ok());
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_propagate_verbatim_to_all_waiters() {
        let c = coalescer();
        let leader = c.join("p1", fp(1), FlightForm::Unary);
        let follower = c.join("p1", fp(1), FlightForm::Unary);

        leader
            .publisher()
            .publish_unary(Err(ProviderError::ServerError {
                status: 502,
                message: "bad gateway".to_string(),
            }));

        let err = follower.await_unary().await.unwrap_err();
        assert!(matches!(err, ProviderError::ServerError { status: 502, .. }));
    }

    #[tokio::test]
    async fn slot_is_released_after_publish() {
        let c = coalescer();
        let leader = c.join("p1", fp(1), FlightForm::Unary);
        leader.publisher().publish_unary(Ok(UnaryResult {
            body: Bytes::new(),
            content_type: "application/json".to_string(),
            tokens_in: 0,
            tokens_out: 0,
        }));

        // The flight is done; a new join must lead again.
        let next = c.join("p1", fp(1), FlightForm::Unary);
        assert!(next.is_leader());
    }

    #[tokio::test]
    async fn dropping_all_waiters_cancels_the_upstream() {
        let c = coalescer();
        let leader = c.join("p1", fp(1), FlightForm::Unary);
        let follower = c.join("p1", fp(1), FlightForm::Unary);
        let publisher = leader.publisher();
        let cancel = publisher.cancellation();

        drop(leader);
        assert!(!cancel.is_cancelled(), "follower still attached");

        drop(follower);
        assert!(cancel.is_cancelled(), "last waiter gone");
        assert_eq!(c.in_flight(), 0);
    }

    #[tokio::test]
    async fn leader_disconnect_does_not_cancel_followers() {
        let c = coalescer();
        let leader = c.join("p1", fp(1), FlightForm::Unary);
        let follower = c.join("p1", fp(1), FlightForm::Unary);
        let publisher = leader.publisher();

        // Originating client disconnects; the follower keeps the flight
        // alive and still receives the result.
        drop(leader);
        assert!(!publisher.cancellation().is_cancelled());

        publisher.publish_unary(Ok(UnaryResult {
            body: Bytes::from_static(b"{}"),
            content_type: "application/json".to_string(),
            tokens_in: 1,
            tokens_out: 1,
        }));
        assert!(follower.await_unary().await.is_ok());
    }

    #[tokio::test]
    async fn cancelling_one_follower_is_invisible_to_the_rest() {
        let c = coalescer();
        let leader = c.join("p1", fp(1), FlightForm::Unary);
        let follower_a = c.join("p1", fp(1), FlightForm::Unary);
        let follower_b = c.join("p1", fp(1), FlightForm::Unary);
        let publisher = leader.publisher();

        drop(follower_a);
        assert!(!publisher.cancellation().is_cancelled());

        publisher.publish_unary(Ok(UnaryResult {
            body: Bytes::from_static(b"{}"),
            content_type: "application/json".to_string(),
            tokens_in: 1,
            tokens_out: 1,
        }));
        assert!(follower_b.await_unary().await.is_ok());
        drop(leader);
    }

    #[tokio::test]
    async fn stale_leader_is_superseded() {
        let c = Coalescer::new(Duration::from_millis(10));
        let stuck = c.join("p1", fp(1), FlightForm::Unary);
        tokio::time::sleep(Duration::from_millis(25)).await;

        // Past the age bound the next arrival presumes the leader stuck
        // and starts its own attempt.
        let takeover = c.join("p1", fp(1), FlightForm::Unary);
        assert!(takeover.is_leader());
        drop(stuck);
    }

    #[tokio::test]
    async fn stream_followers_share_the_fan_out() {
        use futures_util::StreamExt;

        let c = coalescer();
        let leader = c.join("p1", fp(1), FlightForm::Stream);
        let follower = c.join("p1", fp(1), FlightForm::Stream);
        let publisher = leader.publisher();

        let mut leader_rx = Box::pin(leader.subscribe_stream());
        let mut follower_rx = Box::pin(follower.subscribe_stream());

        let broadcaster = publisher.broadcaster();
        broadcaster.publish_chunk(Bytes::from("data: a\n\n"));
        publisher.finish_stream();

        assert_eq!(
            leader_rx.next().await.unwrap().unwrap(),
            Bytes::from("data: a\n\n")
        );
        assert_eq!(
            follower_rx.next().await.unwrap().unwrap(),
            Bytes::from("data: a\n\n")
        );
        assert!(leader_rx.next().await.is_none());
        assert!(follower_rx.next().await.is_none());
    }
}
