//! # Scheduler core: slot accounting, admission and result routing.
//!
//! Synchronous state machine owned by the session actor. Every method runs
//! to completion without awaiting, so the slot counters need no locking.
//!
//! ## Admission pass (`send_next`)
//! ```text
//! 1. hinted analysis already in flight and back to NONE
//!      └─► re-issue as INIT on the same key (old slot released first)
//! 2. while active_init + active_run < total_slots:
//!      └─► admit first of needs_init                     (INIT)
//! 3. while active_run < run_slots and the total bound holds:
//!      ├─► admit first of needs_op                       (SAVE)
//!      └─► admit first of needs_run                      (RUN)
//!
//! admit(analysis):
//!   module missing ──► ERROR, ops rejected, no slot
//!   pool full      ──► stop the pass, analysis untouched
//!   accepted       ──► RUNNING, slot reserved, stream returned to the caller
//! ```
//!
//! ## Rules
//! - `active_init + active_run <= total_slots` and `active_run <= run_slots` at all times.
//! - One in-flight entry per key; a newer dispatch replaces the older one and
//!   the older one's stream events are ignored (ticket mismatch).
//! - A terminal result is applied only if its revision is the dispatched one
//!   and the analysis has not moved on since.

use std::collections::HashMap;
use std::sync::Arc;

use crate::analysis::{
    Analysis, AnalysisCollection, AnalysisSnapshot, AnalysisStatus, CollectionError, OpKind,
    OpReply,
};
use crate::error::{OpError, PoolError};
use crate::events::{Bus, Event, EventKind};
use crate::modules::ModuleRegistry;
use crate::pool::{Pool, ResultStream, StreamEvent};
use crate::protocol::{AnalysisKey, AnalysisRequest, AnalysisResponse, InstanceId, Perform};

/// Which budget a dispatch is charged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Init,
    Run,
}

struct Dispatch {
    ticket: u64,
    perform: Perform,
    slot: Slot,
    revision: u64,
}

/// A request accepted by the pool; the caller forwards its stream back to
/// [`Scheduler::on_stream_event`].
pub(crate) struct Started {
    pub key: AnalysisKey,
    pub ticket: u64,
    pub stream: ResultStream,
}

/// Current slot usage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotUsage {
    pub init_slots: usize,
    pub run_slots: usize,
    pub active_init: usize,
    pub active_run: usize,
}

impl SlotUsage {
    pub fn total_slots(&self) -> usize {
        self.init_slots + self.run_slots
    }

    pub fn active(&self) -> usize {
        self.active_init + self.active_run
    }
}

enum View {
    Init,
    Op,
    Run,
}

pub(crate) struct Scheduler {
    init_slots: usize,
    run_slots: usize,
    active_init: usize,
    active_run: usize,
    pool: Pool,
    bus: Bus,
    registry: Arc<dyn ModuleRegistry>,
    collections: Vec<AnalysisCollection>,
    in_flight: HashMap<AnalysisKey, Dispatch>,
    next_ticket: u64,
}

impl Scheduler {
    pub fn new(
        init_slots: usize,
        run_slots: usize,
        pool: Pool,
        bus: Bus,
        registry: Arc<dyn ModuleRegistry>,
    ) -> Self {
        Self {
            init_slots,
            run_slots,
            active_init: 0,
            active_run: 0,
            pool,
            bus,
            registry,
            collections: Vec::new(),
            in_flight: HashMap::new(),
            next_ticket: 1,
        }
    }

    pub fn slots(&self) -> SlotUsage {
        SlotUsage {
            init_slots: self.init_slots,
            run_slots: self.run_slots,
            active_init: self.active_init,
            active_run: self.active_run,
        }
    }

    fn total_slots(&self) -> usize {
        self.init_slots + self.run_slots
    }

    fn active(&self) -> usize {
        self.active_init + self.active_run
    }

    pub fn is_in_flight(&self, key: &AnalysisKey) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Opens the collection of `instance`, creating it on first use.
    pub fn open(&mut self, instance: &InstanceId) {
        if self.collection(instance).is_err() {
            self.collections.push(AnalysisCollection::new(
                instance.clone(),
                Arc::clone(&self.registry),
            ));
        }
    }

    pub fn collection(&self, instance: &InstanceId) -> Result<&AnalysisCollection, CollectionError> {
        self.collections
            .iter()
            .find(|c| c.instance_id() == instance)
            .ok_or_else(|| CollectionError::UnknownInstance(instance.clone()))
    }

    pub fn collection_mut(
        &mut self,
        instance: &InstanceId,
    ) -> Result<&mut AnalysisCollection, CollectionError> {
        self.collections
            .iter_mut()
            .find(|c| c.instance_id() == instance)
            .ok_or_else(|| CollectionError::UnknownInstance(instance.clone()))
    }

    /// Keys changed since the last call, across all instances.
    pub fn take_changed(&mut self) -> Vec<AnalysisKey> {
        self.collections
            .iter_mut()
            .flat_map(|c| {
                let instance = c.instance_id().clone();
                c.take_changed()
                    .into_iter()
                    .map(move |id| AnalysisKey::new(instance.clone(), id))
            })
            .collect()
    }

    pub fn snapshot(&self, key: &AnalysisKey) -> Result<AnalysisSnapshot, CollectionError> {
        self.collection(&key.instance_id)?
            .get(key.analysis_id)
            .map(|a| a.snapshot())
            .ok_or(CollectionError::NotFound(key.analysis_id))
    }

    /// Runs one admission pass. `hint` is an analysis that just changed.
    pub fn send_next(&mut self, hint: Option<&AnalysisKey>) -> Vec<Started> {
        let mut started = Vec::new();

        if let Some(key) = hint
            && self.in_flight.contains_key(key)
            && self.needs_reissue(key)
        {
            match self.admit(key, Perform::Init, Slot::Init) {
                Ok(Some(s)) => started.push(s),
                Ok(None) => {}
                Err(_) => return started,
            }
        }

        while self.active() < self.total_slots() {
            let Some(key) = self.first(View::Init) else { break };
            match self.admit(&key, Perform::Init, Slot::Init) {
                Ok(s) => started.extend(s),
                Err(_) => return started,
            }
        }

        while self.active_run < self.run_slots && self.active() < self.total_slots() {
            let next = self
                .first(View::Op)
                .map(|k| (k, Perform::Save))
                .or_else(|| self.first(View::Run).map(|k| (k, Perform::Run)));
            let Some((key, perform)) = next else { break };
            match self.admit(&key, perform, Slot::Run) {
                Ok(s) => started.extend(s),
                Err(_) => break,
            }
        }

        started
    }

    fn needs_reissue(&self, key: &AnalysisKey) -> bool {
        self.collection(&key.instance_id)
            .ok()
            .and_then(|c| c.get(key.analysis_id))
            .is_some_and(|a| {
                !a.is_builtin() && a.enabled() && a.status() == AnalysisStatus::None
            })
    }

    fn first(&self, view: View) -> Option<AnalysisKey> {
        self.collections.iter().find_map(|c| {
            let found = match view {
                View::Init => c.needs_init().next(),
                View::Op => c.needs_op().next(),
                View::Run => c.needs_run().next(),
            };
            found.map(|a| a.key())
        })
    }

    /// Admits one analysis. `Err` stops the pass.
    fn admit(
        &mut self,
        key: &AnalysisKey,
        perform: Perform,
        slot: Slot,
    ) -> Result<Option<Started>, PoolError> {
        let Ok(collection) = self.collection_mut(&key.instance_id) else {
            return Ok(None);
        };

        if let Err(e) = collection.resolve(key.analysis_id) {
            let message = e.to_string();
            if let Some(analysis) = collection.get_mut(key.analysis_id) {
                analysis.fail_ops(OpError::ModuleNotInstalled(message.clone()));
                analysis.set_error(message.clone());
            }
            tracing::debug!(%key, %message, "analysis rejected");
            self.bus.publish(
                Event::new(EventKind::AnalysisRejected)
                    .with_key(key.clone())
                    .with_reason(message),
            );
            return Ok(None);
        }

        let Some(request) = collection.get(key.analysis_id).map(|a| to_wire_request(a, perform))
        else {
            return Ok(None);
        };
        let revision = request.revision;

        let stream = match self.pool.submit(request) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(%key, error = %e, "admission pass stopped");
                return Err(e);
            }
        };

        if let Ok(collection) = self.collection_mut(&key.instance_id)
            && let Some(analysis) = collection.get_mut(key.analysis_id)
        {
            analysis.set_status(AnalysisStatus::Running);
            if perform == Perform::Save {
                analysis.mark_op_dispatched();
            }
        }

        if let Some(old) = self.in_flight.remove(key) {
            self.release(old.slot);
        }
        match slot {
            Slot::Init => self.active_init += 1,
            Slot::Run => self.active_run += 1,
        }
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.in_flight.insert(
            key.clone(),
            Dispatch {
                ticket,
                perform,
                slot,
                revision,
            },
        );
        tracing::trace!(%key, perform = perform.as_str(), ?slot, usage = ?self.slots(), "admitted");
        self.bus.publish(
            Event::new(EventKind::AnalysisDispatched)
                .with_key(key.clone())
                .with_perform(perform)
                .with_revision(revision),
        );

        Ok(Some(Started {
            key: key.clone(),
            ticket,
            stream,
        }))
    }

    fn release(&mut self, slot: Slot) {
        match slot {
            Slot::Init => self.active_init = self.active_init.saturating_sub(1),
            Slot::Run => self.active_run = self.active_run.saturating_sub(1),
        }
    }

    /// Applies one stream event. Returns `true` if a slot was freed, in which
    /// case the caller runs another admission pass.
    pub fn on_stream_event(&mut self, key: &AnalysisKey, ticket: u64, event: StreamEvent) -> bool {
        let Some(dispatch) = self.in_flight.get(key) else {
            return false;
        };
        if dispatch.ticket != ticket {
            return false;
        }

        let response = match event {
            StreamEvent::Partial(resp) => {
                self.apply_partial(key, resp);
                return false;
            }
            StreamEvent::Cancelled => None,
            StreamEvent::Complete(resp) => Some(resp),
            StreamEvent::Failed(reason) => Some(self.failure_response(key, reason)),
        };

        let Some(dispatch) = self.in_flight.remove(key) else {
            return false;
        };
        self.release(dispatch.slot);
        if let Some(resp) = response {
            self.apply_terminal(key, &dispatch, resp);
        }
        true
    }

    fn apply_partial(&mut self, key: &AnalysisKey, resp: AnalysisResponse) {
        let Some(dispatch) = self.in_flight.get(key) else { return };
        if dispatch.perform == Perform::Save {
            return;
        }
        let revision = dispatch.revision;
        if resp.revision != revision {
            self.stale(key, resp.revision);
            return;
        }
        if let Ok(c) = self.collection_mut(&key.instance_id)
            && let Some(analysis) = c.get_mut(key.analysis_id)
            && awaits_result(analysis, revision)
        {
            analysis.set_results(resp, false, false);
        }
    }

    fn failure_response(&self, key: &AnalysisKey, reason: String) -> AnalysisResponse {
        let revision = self.in_flight.get(key).map(|d| d.revision);
        let mut resp = self
            .collection(&key.instance_id)
            .ok()
            .and_then(|c| c.get(key.analysis_id))
            .map(|a| a.error_response(reason.clone()))
            .unwrap_or_else(|| placeholder_error(key, reason));
        if let Some(revision) = revision {
            resp.revision = revision;
        }
        resp
    }

    fn apply_terminal(&mut self, key: &AnalysisKey, dispatch: &Dispatch, resp: AnalysisResponse) {
        let Ok(collection) = self.collection_mut(&key.instance_id) else { return };
        let Some(analysis) = collection.get_mut(key.analysis_id) else { return };

        let status = if dispatch.perform == Perform::Save {
            if resp.is_error() {
                let message = resp.results.error_message().unwrap_or("save failed").to_owned();
                analysis.resolve_op(Err(OpError::Failed(message)));
            } else {
                analysis.resolve_op(Ok(resp));
            }
            if analysis.status() != AnalysisStatus::Running {
                return;
            }
            AnalysisStatus::Complete
        } else {
            let current = awaits_result(analysis, dispatch.revision);
            if resp.revision != dispatch.revision || !current {
                let revision = resp.revision;
                self.stale(key, revision);
                return;
            }
            let is_error = resp.is_error();
            analysis.set_results(resp, true, false);
            if is_error {
                AnalysisStatus::Error
            } else if dispatch.perform == Perform::Init {
                AnalysisStatus::Inited
            } else {
                AnalysisStatus::Complete
            }
        };
        analysis.set_status(status);

        self.bus.publish(
            Event::new(EventKind::AnalysisSettled)
                .with_key(key.clone())
                .with_perform(dispatch.perform)
                .with_revision(dispatch.revision)
                .with_status(status),
        );
    }

    fn stale(&self, key: &AnalysisKey, revision: u64) {
        tracing::debug!(%key, revision, "dropping stale result");
        self.bus.publish(
            Event::new(EventKind::StaleResultDropped)
                .with_key(key.clone())
                .with_revision(revision),
        );
    }

    /// Removes an analysis: cancels its pool entry, frees its slot and
    /// rejects its pending ops.
    pub fn delete(&mut self, key: &AnalysisKey) -> Result<(), CollectionError> {
        self.collection_mut(&key.instance_id)?
            .remove(key.analysis_id)?;
        if let Some(dispatch) = self.in_flight.remove(key) {
            self.release(dispatch.slot);
            let _ = self.pool.cancel(key);
        }
        Ok(())
    }

    /// Queues a SAVE on a completed analysis.
    pub fn queue_save(
        &mut self,
        key: &AnalysisKey,
        path: String,
        part: Option<String>,
    ) -> Result<OpReply, CollectionError> {
        self.collection_mut(&key.instance_id)?
            .queue_op(key.analysis_id, OpKind::Save { path, part })
    }

    /// Module `namespace` became available: rerun its analyses everywhere.
    pub fn module_installed(&mut self, namespace: &str) -> usize {
        self.collections
            .iter_mut()
            .map(|c| c.module_installed(namespace))
            .sum()
    }

    /// Rejects every pending op; used when the session ends.
    pub fn abandon(&mut self, err: OpError) {
        for collection in &mut self.collections {
            collection.fail_all_ops(err.clone());
        }
    }
}

/// Builds the wire request for `analysis`.
///
/// A completed analysis with an undispatched op becomes SAVE; otherwise the
/// given perform is used with the current options, changes, revision and
/// `clear_state`. Addons are nested as INIT for an INIT, RUN otherwise.
/// Whether `analysis` still waits for the result of a request sent at
/// `revision`. A passive option change bumps the revision but leaves the
/// analysis RUNNING; any change that reschedules it resets the status.
fn awaits_result(analysis: &Analysis, revision: u64) -> bool {
    analysis.revision() == revision || analysis.status() == AnalysisStatus::Running
}

pub(crate) fn to_wire_request(analysis: &Analysis, perform: Perform) -> AnalysisRequest {
    let save = (analysis.status() == AnalysisStatus::Complete)
        .then(|| analysis.pending_op())
        .flatten();

    let addon_perform = match perform {
        Perform::Init => Perform::Init,
        Perform::Run | Perform::Save => Perform::Run,
    };

    let mut request = AnalysisRequest {
        instance_id: analysis.instance_id().clone(),
        analysis_id: analysis.id(),
        namespace: analysis.namespace().to_owned(),
        name: analysis.name().to_owned(),
        options: analysis.options_bytes(),
        changed: Vec::new(),
        revision: analysis.revision(),
        clear_state: false,
        perform,
        path: None,
        part: None,
        addons: analysis
            .addons()
            .iter()
            .map(|addon| to_wire_request(addon, addon_perform))
            .collect(),
    };

    match save {
        Some(OpKind::Save { path, part }) => {
            request.perform = Perform::Save;
            request.path = Some(path.clone());
            request.part = part.clone();
        }
        None => {
            request.changed = analysis.changes().map(str::to_owned).collect();
            request.clear_state = analysis.clear_state();
        }
    }
    request
}

fn placeholder_error(key: &AnalysisKey, reason: String) -> AnalysisResponse {
    let request = AnalysisRequest {
        instance_id: key.instance_id.clone(),
        analysis_id: key.analysis_id,
        namespace: String::new(),
        name: String::new(),
        options: Vec::new(),
        changed: Vec::new(),
        revision: 0,
        clear_state: false,
        perform: Perform::Run,
        path: None,
        part: None,
        addons: Vec::new(),
    };
    AnalysisResponse::error_for(&request, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::NewAnalysis;
    use crate::modules::{AnalysisMeta, StaticRegistry};
    use crate::options::OptionMap;
    use crate::pool::Dispatcher;
    use crate::protocol::{ResultElement, ResultStatus, ResultTree};
    use tokio::sync::broadcast;

    struct Harness {
        s: Scheduler,
        d: Dispatcher,
        pool: Pool,
        events: broadcast::Receiver<Event>,
    }

    fn inst() -> InstanceId {
        InstanceId::from("inst")
    }

    fn harness(init: usize, run: usize) -> Harness {
        let bus = Bus::new(256);
        let events = bus.subscribe();
        let pool = Pool::new(init + run, bus.clone());
        let d = pool.dispatcher().expect("dispatcher");
        let registry = Arc::new(StaticRegistry::new().with_module(
            "jmv",
            [
                AnalysisMeta::new("anova").with_addon("jmv", "ttest"),
                AnalysisMeta::new("ttest"),
            ],
        ));
        let mut s = Scheduler::new(init, run, pool.clone(), bus, registry);
        s.open(&inst());
        Harness { s, d, pool, events }
    }

    fn create(s: &mut Scheduler, namespace: &str, name: &str) -> AnalysisKey {
        let id = s
            .collection_mut(&inst())
            .unwrap()
            .create(NewAnalysis::new(namespace, name))
            .unwrap();
        AnalysisKey::new(inst(), id)
    }

    fn status(s: &Scheduler, key: &AnalysisKey) -> AnalysisStatus {
        s.snapshot(key).unwrap().status
    }

    fn respond(req: &AnalysisRequest, status: ResultStatus) -> AnalysisResponse {
        AnalysisResponse {
            instance_id: req.instance_id.clone(),
            analysis_id: req.analysis_id,
            namespace: req.namespace.clone(),
            name: req.name.clone(),
            revision: req.revision,
            status,
            options: Vec::new(),
            results: ResultTree {
                title: req.name.clone(),
                status,
                error: None,
                elements: vec![ResultElement::preformatted("main", "ok")],
            },
        }
    }

    fn assert_bounds(s: &Scheduler) {
        let usage = s.slots();
        assert!(usage.active() <= usage.total_slots(), "{usage:?}");
        assert!(usage.active_run <= usage.run_slots, "{usage:?}");
    }

    fn kinds(events: &mut broadcast::Receiver<Event>) -> Vec<(EventKind, Option<AnalysisKey>)> {
        let mut out = Vec::new();
        while let Ok(ev) = events.try_recv() {
            out.push((ev.kind, ev.key));
        }
        out
    }

    /// Answers the newest dispatched request with a successful result.
    async fn answer(h: &mut Harness, started: &mut Started) -> AnalysisRequest {
        let (req, mut sender) = h.d.next().await.expect("dispatched");
        let status = if req.perform == Perform::Init {
            ResultStatus::Inited
        } else {
            ResultStatus::Complete
        };
        assert!(sender.complete(respond(&req, status)));
        let ev = started.stream.next().await.expect("terminal");
        assert!(h.s.on_stream_event(&started.key, started.ticket, ev));
        req
    }

    async fn to_complete(h: &mut Harness, key: &AnalysisKey) {
        for _ in 0..2 {
            let mut st = h
                .s
                .send_next(None)
                .into_iter()
                .find(|st| &st.key == key)
                .expect("admitted");
            answer(h, &mut st).await;
        }
        assert_eq!(status(&h.s, key), AnalysisStatus::Complete);
    }

    #[tokio::test]
    async fn slot_bounds_hold_while_draining_work() {
        let mut h = harness(1, 2);
        let keys: Vec<_> = (0..4).map(|_| create(&mut h.s, "jmv", "anova")).collect();

        let mut streams: HashMap<AnalysisKey, Started> = HashMap::new();
        for st in h.s.send_next(None) {
            streams.insert(st.key.clone(), st);
        }
        assert_eq!(h.s.slots().active_init, 3);
        assert_bounds(&h.s);

        let mut rounds = 0;
        while keys.iter().any(|k| status(&h.s, k) != AnalysisStatus::Complete) {
            rounds += 1;
            assert!(rounds <= 8, "too many rounds");

            let (req, mut sender) = h.d.next().await.expect("queued request");
            let result = if req.perform == Perform::Init {
                ResultStatus::Inited
            } else {
                ResultStatus::Complete
            };
            sender.complete(respond(&req, result));

            let mut st = streams.remove(&req.key()).expect("stream");
            let ev = st.stream.next().await.expect("terminal");
            assert!(h.s.on_stream_event(&st.key, st.ticket, ev));
            for st in h.s.send_next(None) {
                streams.insert(st.key.clone(), st);
            }
            assert_bounds(&h.s);
        }
        assert_eq!(h.s.slots().active(), 0);
        assert!(h.pool.is_empty());
    }

    #[tokio::test]
    async fn missing_module_errors_without_consuming_a_slot() {
        let mut h = harness(1, 1);
        let a = create(&mut h.s, "jmv", "anova");
        let b = create(&mut h.s, "foo", "bar");

        let mut started = h.s.send_next(None);
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].key, a);
        assert_eq!(status(&h.s, &a), AnalysisStatus::Running);
        assert_eq!(status(&h.s, &b), AnalysisStatus::Error);
        assert_eq!(h.s.slots().active_init, 1);

        let err = h.s.snapshot(&b).unwrap().results.expect("error result");
        assert_eq!(err.results.error_message(), Some("module 'foo' is not installed"));
        assert!(kinds(&mut h.events).contains(&(EventKind::AnalysisRejected, Some(b.clone()))));

        let mut st = started.remove(0);
        answer(&mut h, &mut st).await;
        assert_eq!(status(&h.s, &a), AnalysisStatus::Inited);
        assert!(h.s.slots().active_init <= 1);

        let mut st = h.s.send_next(None).pop().expect("run admitted");
        assert_eq!(h.s.slots().active_run, 1);
        let req = answer(&mut h, &mut st).await;
        assert_eq!(req.perform, Perform::Run);
        assert_eq!(status(&h.s, &a), AnalysisStatus::Complete);
        assert_eq!(status(&h.s, &b), AnalysisStatus::Error);
    }

    #[tokio::test]
    async fn change_before_dispatch_yields_one_result_for_latest_options() {
        let mut h = harness(1, 1);
        let a = create(&mut h.s, "jmv", "anova");
        h.s.take_changed();

        let mut first = h.s.send_next(None).pop().expect("admitted");
        let opts = OptionMap::new().with("alpha", 0.01).to_bytes();
        let rescheduled = h
            .s
            .collection_mut(&inst())
            .unwrap()
            .set_options(a.analysis_id, &opts, &["alpha".to_owned()], 2, None)
            .unwrap();
        assert!(rescheduled);
        assert_eq!(h.s.take_changed(), vec![a.clone()]);

        let mut second = h.s.send_next(Some(&a)).pop().expect("re-issued");
        assert_eq!(h.s.slots().active_init, 1);
        assert_eq!(h.pool.len(), 1);

        assert_eq!(first.stream.next().await, Some(StreamEvent::Cancelled));
        assert!(!h.s.on_stream_event(&a, first.ticket, StreamEvent::Cancelled));
        assert_eq!(h.s.slots().active_init, 1);

        let req = answer(&mut h, &mut second).await;
        assert_eq!(req.revision, 2);
        assert_eq!(req.changed, vec!["alpha".to_owned()]);

        let snap = h.s.snapshot(&a).unwrap();
        assert_eq!(snap.status, AnalysisStatus::Inited);
        assert_eq!(snap.results.map(|r| r.revision), Some(2));
        assert_eq!(h.s.slots().active(), 0);
    }

    #[tokio::test]
    async fn result_for_an_outdated_revision_is_dropped() {
        let mut h = harness(1, 1);
        let a = create(&mut h.s, "jmv", "anova");
        let mut st = h.s.send_next(None).pop().expect("admitted");

        let opts = OptionMap::new().with("alpha", 0.1).to_bytes();
        h.s.collection_mut(&inst())
            .unwrap()
            .set_options(a.analysis_id, &opts, &["alpha".to_owned()], 3, Some(false))
            .unwrap();
        for hint in h.s.take_changed() {
            assert!(h.s.send_next(Some(&hint)).is_empty());
        }

        let req = answer(&mut h, &mut st).await;
        assert_eq!(req.revision, 0);

        let snap = h.s.snapshot(&a).unwrap();
        assert_eq!(snap.status, AnalysisStatus::None);
        assert!(snap.results.is_none());
        assert_eq!(h.s.slots().active(), 0);
        assert!(kinds(&mut h.events).contains(&(EventKind::StaleResultDropped, Some(a))));
    }

    #[tokio::test]
    async fn unchanged_options_keep_the_in_flight_result() {
        let mut h = harness(1, 1);
        let a = create(&mut h.s, "jmv", "anova");
        let mut st = h.s.send_next(None).pop().expect("admitted");

        let same = OptionMap::new().to_bytes();
        let rescheduled = h
            .s
            .collection_mut(&inst())
            .unwrap()
            .set_options(a.analysis_id, &same, &[], 7, None)
            .unwrap();
        assert!(!rescheduled);
        assert_eq!(status(&h.s, &a), AnalysisStatus::Running);

        let req = answer(&mut h, &mut st).await;
        assert_eq!(req.revision, 0);

        let snap = h.s.snapshot(&a).unwrap();
        assert_eq!(snap.status, AnalysisStatus::Inited);
        assert_eq!(snap.results.map(|r| r.revision), Some(0));
        assert!(!kinds(&mut h.events).iter().any(|(k, _)| *k == EventKind::StaleResultDropped));

        let mut st = h.s.send_next(None).pop().expect("run admitted");
        let req = answer(&mut h, &mut st).await;
        assert_eq!(req.perform, Perform::Run);
        assert_eq!(status(&h.s, &a), AnalysisStatus::Complete);
    }

    #[tokio::test]
    async fn save_resolves_or_rejects_the_pending_op() {
        let mut h = harness(1, 1);
        let a = create(&mut h.s, "jmv", "anova");
        to_complete(&mut h, &a).await;

        let reply = h.s.queue_save(&a, "/tmp/out.omv".into(), None).unwrap();
        let mut st = h.s.send_next(None).pop().expect("save admitted");
        assert_eq!(h.s.slots().active_run, 1);
        let (req, mut sender) = h.d.next().await.expect("dispatched");
        assert_eq!(req.perform, Perform::Save);
        assert_eq!(req.path.as_deref(), Some("/tmp/out.omv"));
        let resp = respond(&req, ResultStatus::Complete);
        sender.complete(resp.clone());
        let ev = st.stream.next().await.expect("terminal");
        assert!(h.s.on_stream_event(&a, st.ticket, ev));
        assert_eq!(reply.await.unwrap(), Ok(resp));
        assert_eq!(status(&h.s, &a), AnalysisStatus::Complete);

        let reply = h
            .s
            .queue_save(&a, "/readonly".into(), Some("table".into()))
            .unwrap();
        let mut st = h.s.send_next(None).pop().expect("save admitted");
        let (req, mut sender) = h.d.next().await.expect("dispatched");
        assert_eq!(req.part.as_deref(), Some("table"));
        let mut resp = respond(&req, ResultStatus::Error);
        resp.results.error = Some("disk full".into());
        sender.complete(resp);
        let ev = st.stream.next().await.expect("terminal");
        assert!(h.s.on_stream_event(&a, st.ticket, ev));
        assert_eq!(reply.await.unwrap(), Err(OpError::Failed("disk full".into())));
        assert_eq!(status(&h.s, &a), AnalysisStatus::Complete);
    }

    #[tokio::test]
    async fn failed_stream_becomes_an_error_result() {
        let mut h = harness(1, 1);
        let a = create(&mut h.s, "jmv", "anova");
        let mut st = h.s.send_next(None).pop().expect("admitted");

        let (_, mut sender) = h.d.next().await.expect("dispatched");
        sender.fail("worker vanished");
        let ev = st.stream.next().await.expect("terminal");
        assert!(h.s.on_stream_event(&a, st.ticket, ev));

        let snap = h.s.snapshot(&a).unwrap();
        assert_eq!(snap.status, AnalysisStatus::Error);
        assert_eq!(
            snap.results.as_ref().and_then(|r| r.results.error_message()),
            Some("worker vanished")
        );
    }

    #[tokio::test]
    async fn delete_frees_the_slot_and_rejects_ops() {
        let mut h = harness(1, 1);
        let a = create(&mut h.s, "jmv", "anova");
        let reply = h.s.queue_save(&a, "/tmp/x".into(), None).unwrap();
        let mut st = h.s.send_next(None).pop().expect("admitted");
        assert!(h.pool.contains(&a));

        h.s.delete(&a).unwrap();
        assert_eq!(h.s.slots().active(), 0);
        assert!(!h.pool.contains(&a));
        assert_eq!(reply.await.unwrap(), Err(OpError::Deleted));

        assert_eq!(st.stream.next().await, Some(StreamEvent::Cancelled));
        assert!(!h.s.on_stream_event(&a, st.ticket, StreamEvent::Cancelled));
        assert_eq!(
            h.s.delete(&a),
            Err(CollectionError::NotFound(a.analysis_id))
        );
    }

    #[test]
    fn wire_request_carries_state_and_nested_addons() {
        let mut h = harness(1, 1);
        let a = create(&mut h.s, "jmv", "anova");
        h.s.collection_mut(&inst())
            .unwrap()
            .rerun(a.analysis_id)
            .unwrap();

        let analysis = h.s.collection(&inst()).unwrap().get(a.analysis_id).unwrap();
        let req = to_wire_request(analysis, Perform::Init);
        assert!(req.clear_state);
        assert_eq!(req.perform, Perform::Init);
        assert_eq!(req.addons.len(), 1);
        assert_eq!(req.addons[0].name, "ttest");
        assert_eq!(req.addons[0].perform, Perform::Init);

        let req = to_wire_request(analysis, Perform::Run);
        assert_eq!(req.addons[0].perform, Perform::Run);
    }
}
