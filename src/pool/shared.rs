use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::PoolError;
use crate::events::{Bus, Event, EventKind};
use crate::protocol::{AnalysisKey, AnalysisRequest};

use super::stream::{self, ResultSender, ResultStream};

struct Queued {
    request: AnalysisRequest,
    sender: ResultSender,
}

struct InFlight {
    ticket: u64,
    cancel: CancellationToken,
}

/// Entry removed by supersession or cancellation. Dropped outside the lock.
enum Removed {
    Queued(Queued),
    InFlight(CancellationToken),
}

impl Removed {
    fn cancel(&self) {
        match self {
            Removed::Queued(q) => q.sender.cancel(),
            Removed::InFlight(token) => token.cancel(),
        }
    }
}

struct PoolState {
    capacity: usize,
    /// Waiting keys, oldest first.
    order: Vec<AnalysisKey>,
    queued: HashMap<AnalysisKey, Queued>,
    in_flight: HashMap<AnalysisKey, InFlight>,
    next_ticket: u64,
}

impl PoolState {
    fn len(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    fn take(&mut self, key: &AnalysisKey) -> Option<Removed> {
        if let Some(q) = self.queued.remove(key) {
            self.order.retain(|k| k != key);
            return Some(Removed::Queued(q));
        }
        self.in_flight
            .remove(key)
            .map(|f| Removed::InFlight(f.cancel))
    }
}

pub(crate) struct Shared {
    state: Mutex<PoolState>,
    ready_tx: mpsc::Sender<()>,
    ready_rx: Mutex<Option<mpsc::Receiver<()>>>,
    closed: CancellationToken,
    bus: Bus,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops the in-flight entry for `key` if it still belongs to `ticket`.
    pub(super) fn release(&self, key: &AnalysisKey, ticket: u64) {
        let mut st = self.lock();
        if st.in_flight.get(key).is_some_and(|f| f.ticket == ticket) {
            st.in_flight.remove(key);
        }
    }

    /// Moves the most recently queued live entry to in-flight.
    fn pop_newest(&self) -> Option<(AnalysisRequest, ResultSender)> {
        let mut stale = Vec::new();
        let mut st = self.lock();
        let found = loop {
            let Some(key) = st.order.pop() else { break None };
            let Some(entry) = st.queued.remove(&key) else { continue };
            if entry.sender.is_cancelled() {
                stale.push(entry);
                continue;
            }
            let ticket = entry.sender.ticket();
            let cancel = entry.sender.cancel_token();
            st.in_flight.insert(key, InFlight { ticket, cancel });
            break Some((entry.request, entry.sender));
        };
        drop(st);
        drop(stale);
        found
    }
}

/// Bounded multiplexer of `(key → request, result stream)` entries.
///
/// Cheap to clone; every clone refers to the same pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    /// Creates a pool admitting at most `capacity` keys (queued + in flight).
    pub fn new(capacity: usize, bus: Bus) -> Self {
        let (ready_tx, ready_rx) = mpsc::channel(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    capacity: capacity.max(1),
                    order: Vec::new(),
                    queued: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_ticket: 1,
                }),
                ready_tx,
                ready_rx: Mutex::new(Some(ready_rx)),
                closed: CancellationToken::new(),
                bus,
            }),
        }
    }

    /// Queues `request`, superseding any queued or in-flight entry for its key.
    ///
    /// Fails with [`PoolError::Full`] if the key is new and the pool is full.
    pub fn submit(&self, request: AnalysisRequest) -> Result<ResultStream, PoolError> {
        if self.shared.closed.is_cancelled() {
            return Err(PoolError::Closed);
        }
        let key = request.key();
        let perform = request.perform;
        let revision = request.revision;

        let (stream, removed) = {
            let mut st = self.shared.lock();
            let removed = st.take(&key);
            if let Some(old) = &removed {
                old.cancel();
            }
            if st.len() >= st.capacity {
                drop(st);
                self.shared
                    .bus
                    .publish(Event::new(EventKind::PoolFull).with_key(key));
                return Err(PoolError::Full);
            }
            let ticket = st.next_ticket;
            st.next_ticket += 1;
            let (sender, stream) =
                stream::channel(key.clone(), ticket, Arc::downgrade(&self.shared));
            st.order.push(key.clone());
            st.queued.insert(key.clone(), Queued { request, sender });
            (stream, removed)
        };

        if removed.is_some() {
            tracing::debug!(%key, "superseding pending request");
            self.shared
                .bus
                .publish(Event::new(EventKind::RequestSuperseded).with_key(key.clone()));
        }
        drop(removed);

        self.shared.bus.publish(
            Event::new(EventKind::RequestQueued)
                .with_key(key)
                .with_perform(perform)
                .with_revision(revision),
        );
        let _ = self.shared.ready_tx.try_send(());
        Ok(stream)
    }

    /// Cancels the queued or in-flight entry for `key`.
    pub fn cancel(&self, key: &AnalysisKey) -> Result<(), PoolError> {
        let removed = self.shared.lock().take(key);
        match removed {
            Some(entry) => {
                entry.cancel();
                Ok(())
            }
            None => Err(PoolError::NotFound),
        }
    }

    /// Takes the single consumer half. Returns `None` if already taken.
    pub fn dispatcher(&self) -> Option<Dispatcher> {
        let ready = self
            .shared
            .ready_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        Some(Dispatcher {
            shared: Arc::clone(&self.shared),
            ready,
        })
    }

    /// Refuses further submissions, cancels every entry and ends the dispatcher.
    pub fn close(&self) {
        self.shared.closed.cancel();
        let drained: Vec<Removed> = {
            let mut guard = self.shared.lock();
            let st = &mut *guard;
            st.order.clear();
            let queued = st.queued.drain().map(|(_, q)| Removed::Queued(q));
            let in_flight = st.in_flight.drain().map(|(_, f)| Removed::InFlight(f.cancel));
            queued.chain(in_flight).collect()
        };
        for entry in &drained {
            entry.cancel();
        }
    }

    pub fn contains(&self, key: &AnalysisKey) -> bool {
        let st = self.shared.lock();
        st.queued.contains_key(key) || st.in_flight.contains_key(key)
    }

    pub fn is_in_flight(&self, key: &AnalysisKey) -> bool {
        self.shared.lock().in_flight.contains_key(key)
    }

    /// Queued plus in-flight keys.
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queued_len(&self) -> usize {
        self.shared.lock().queued.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.lock().capacity
    }

    pub fn is_full(&self) -> bool {
        let st = self.shared.lock();
        st.len() >= st.capacity
    }
}

/// Single consumer of queued entries, driven by the engine manager.
pub struct Dispatcher {
    shared: Arc<Shared>,
    ready: mpsc::Receiver<()>,
}

impl Dispatcher {
    /// Next entry to run: the most recently queued waiting key.
    ///
    /// Cancel-safe. Returns `None` once the pool is closed.
    pub async fn next(&mut self) -> Option<(AnalysisRequest, ResultSender)> {
        loop {
            if self.shared.closed.is_cancelled() {
                return None;
            }
            if let Some(item) = self.shared.pop_newest() {
                return Some(item);
            }
            tokio::select! {
                _ = self.shared.closed.cancelled() => return None,
                signal = self.ready.recv() => signal?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::StreamEvent;
    use crate::protocol::{AnalysisResponse, InstanceId, Perform, ResultStatus};

    fn request(id: u32, revision: u64) -> AnalysisRequest {
        AnalysisRequest {
            instance_id: InstanceId::from("inst"),
            analysis_id: id,
            namespace: "jmv".into(),
            name: "anova".into(),
            options: Vec::new(),
            changed: Vec::new(),
            revision,
            clear_state: false,
            perform: Perform::Init,
            path: None,
            part: None,
            addons: Vec::new(),
        }
    }

    fn ok_response(req: &AnalysisRequest) -> AnalysisResponse {
        let mut resp = AnalysisResponse::error_for(req, "");
        resp.status = ResultStatus::Complete;
        resp.results.status = ResultStatus::Complete;
        resp.results.error = None;
        resp
    }

    #[tokio::test]
    async fn lifo_among_waiting_keys() {
        let pool = Pool::new(4, Bus::new(16));
        let mut dispatcher = pool.dispatcher().expect("dispatcher");
        assert!(pool.dispatcher().is_none());

        let _a = pool.submit(request(1, 1)).expect("a");
        let _b = pool.submit(request(2, 1)).expect("b");
        let _c = pool.submit(request(3, 1)).expect("c");

        let mut taken = Vec::new();
        for _ in 0..3 {
            taken.push(dispatcher.next().await.expect("entry"));
        }
        let order: Vec<u32> = taken.iter().map(|(req, _)| req.analysis_id).collect();
        assert_eq!(order, vec![3, 2, 1]);
        assert_eq!(pool.in_flight_len(), 3);
        assert_eq!(pool.queued_len(), 0);

        drop(taken);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn resubmitted_key_moves_to_the_front() {
        let pool = Pool::new(4, Bus::new(16));
        let mut dispatcher = pool.dispatcher().expect("dispatcher");

        let _a = pool.submit(request(1, 1)).expect("a");
        let _b = pool.submit(request(2, 1)).expect("b");
        let _a2 = pool.submit(request(1, 2)).expect("a again");
        assert_eq!(pool.len(), 2);

        let (first, _) = dispatcher.next().await.expect("entry");
        assert_eq!((first.analysis_id, first.revision), (1, 2));
    }

    #[tokio::test]
    async fn superseded_queued_request_is_cancelled_never_completed() {
        let pool = Pool::new(2, Bus::new(16));
        let mut dispatcher = pool.dispatcher().expect("dispatcher");

        let mut a = pool.submit(request(1, 1)).expect("a");
        let mut b = pool.submit(request(1, 2)).expect("b");
        assert_eq!(a.next().await, Some(StreamEvent::Cancelled));
        assert_eq!(a.next().await, None);

        let (req, mut sender) = dispatcher.next().await.expect("b dispatched");
        assert_eq!(req.revision, 2);
        let resp = ok_response(&req);
        assert!(sender.complete(resp.clone()));
        assert_eq!(b.next().await, Some(StreamEvent::Complete(resp)));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn superseding_in_flight_cancels_the_engine_side() {
        let pool = Pool::new(1, Bus::new(16));
        let mut dispatcher = pool.dispatcher().expect("dispatcher");

        let mut a = pool.submit(request(1, 1)).expect("a");
        let (req_a, mut sender_a) = dispatcher.next().await.expect("a dispatched");
        assert!(sender_a.write(ok_response(&req_a)));

        let _b = pool.submit(request(1, 2)).expect("b replaces a at capacity 1");
        assert!(sender_a.is_cancelled());
        assert!(!sender_a.complete(ok_response(&req_a)));

        assert!(matches!(a.next().await, Some(StreamEvent::Cancelled)));
        assert_eq!(pool.len(), 1);
        assert!(!pool.is_in_flight(&req_a.key()));
    }

    #[tokio::test]
    async fn full_pool_rejects_new_keys_only() {
        let bus = Bus::new(16);
        let mut events = bus.subscribe();
        let pool = Pool::new(1, bus);

        let _a = pool.submit(request(1, 1)).expect("a");
        assert!(pool.is_full());
        assert_eq!(pool.submit(request(2, 1)).err(), Some(PoolError::Full));
        assert!(pool.submit(request(1, 2)).is_ok());

        let mut saw_full = false;
        while let Ok(ev) = events.try_recv() {
            saw_full |= ev.kind == EventKind::PoolFull;
        }
        assert!(saw_full);
    }

    #[tokio::test]
    async fn dropped_sender_releases_and_fails_the_waiter() {
        let pool = Pool::new(1, Bus::new(16));
        let mut dispatcher = pool.dispatcher().expect("dispatcher");

        let mut a = pool.submit(request(1, 1)).expect("a");
        let (_, sender) = dispatcher.next().await.expect("a dispatched");
        drop(sender);

        assert!(matches!(a.next().await, Some(StreamEvent::Failed(_))));
        assert!(pool.is_empty());
        assert!(pool.submit(request(2, 1)).is_ok());
    }

    #[tokio::test]
    async fn cancelled_queued_entries_are_skipped() {
        let pool = Pool::new(2, Bus::new(16));
        let mut dispatcher = pool.dispatcher().expect("dispatcher");

        let _a = pool.submit(request(1, 1)).expect("a");
        let b = pool.submit(request(2, 1)).expect("b");
        b.cancel();

        let (req, _) = dispatcher.next().await.expect("a dispatched");
        assert_eq!(req.analysis_id, 1);
    }

    #[tokio::test]
    async fn cancel_by_key_and_close() {
        let pool = Pool::new(2, Bus::new(16));
        let mut dispatcher = pool.dispatcher().expect("dispatcher");
        let mut a = pool.submit(request(1, 1)).expect("a");

        assert_eq!(pool.cancel(&request(1, 1).key()), Ok(()));
        assert_eq!(pool.cancel(&request(1, 1).key()), Err(PoolError::NotFound));
        assert_eq!(a.next().await, Some(StreamEvent::Cancelled));

        let mut b = pool.submit(request(2, 1)).expect("b");
        pool.close();
        assert_eq!(b.next().await, Some(StreamEvent::Cancelled));
        assert!(dispatcher.next().await.is_none());
        assert_eq!(pool.submit(request(3, 1)).err(), Some(PoolError::Closed));
    }
}
