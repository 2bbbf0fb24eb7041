//! Dependency-ordered entity synchronization.
//!
//! [`DependencySync`] schedules entities like [`IdentifierSync`] does, but an
//! entity is held back while it is blocked on a dependency (for example a
//! message that cannot be sent before the conversation's key material is
//! known). Callers either resolve the dependency, making its entities
//! eligible again, or expire every entity blocked on it.
//!
//! Each entity ends with exactly one [`EntitySyncOutcome`], reported through
//! the returned [`EntityCompletion`]s and an optional per-entity handler.
//!
//! [`IdentifierSync`]: crate::IdentifierSync

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug};
use std::time::Instant;
use sync_types::{Request, Response, ResponseClass};
use tracing::{debug, warn};

use crate::aggregator::RequestSource;
use crate::dependency::DependentObjects;
use crate::queue::{RequestTicket, ScheduledRequest, SyncQueue};

/// How the synchronization of an entity ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitySyncOutcome {
    /// The backend accepted the request.
    Success,
    /// The entity's deadline passed or its dependency was expired.
    Expired,
    /// The transcoder declined to retry after a failure.
    GaveUpRetrying,
}

/// Outcome for a single entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCompletion<E> {
    /// The entity.
    pub entity: E,
    /// How its synchronization ended.
    pub outcome: EntitySyncOutcome,
}

/// Per-entity completion callback.
pub type CompletionHandler = Box<dyn FnOnce(EntitySyncOutcome) + Send>;

/// Builds requests for entities and decides on retries.
pub trait EntityTranscoder<E> {
    /// Maximum number of entities covered by a single request.
    fn fetch_limit(&self) -> usize {
        1
    }

    /// Whether an expired request is put back into the pending set.
    fn should_retry_on_expiration(&self) -> bool {
        true
    }

    /// Build one request covering exactly `entities`.
    fn request_for(&mut self, entities: &BTreeSet<E>) -> Option<Request>;

    /// Called on success, and on failures that will not be retried.
    fn did_complete(&mut self, response: &Response, entities: &BTreeSet<E>);

    /// Whether a failed request should be sent again.
    fn should_retry(&mut self, _entities: &BTreeSet<E>, response: &Response) -> bool {
        response.result() != ResponseClass::PermanentError
    }

    /// Called for each entity once a request covering it was built.
    fn on_scheduled(&mut self, _entity: &E) {}

    /// Receives completions when driven through a
    /// [`RequestAggregator`](crate::RequestAggregator).
    fn on_completed(&mut self, _completion: &EntityCompletion<E>) {}
}

/// Scheduler that gates entities on dependencies and deadlines.
pub struct DependencySync<E: Ord + Clone, D: Ord + Clone, T> {
    queue: SyncQueue<E>,
    dependencies: DependentObjects<E, D>,
    deadlines: BTreeMap<E, Instant>,
    handlers: BTreeMap<E, Vec<CompletionHandler>>,
    transcoder: T,
}

impl<E, D, T> DependencySync<E, D, T>
where
    E: Ord + Clone + Debug,
    D: Ord + Clone + Debug,
    T: EntityTranscoder<E>,
{
    /// Create a scheduler driving the given transcoder.
    pub fn new(transcoder: T) -> Self {
        Self {
            queue: SyncQueue::new(),
            dependencies: DependentObjects::new(),
            deadlines: BTreeMap::new(),
            handlers: BTreeMap::new(),
            transcoder,
        }
    }

    /// The transcoder.
    pub fn transcoder(&self) -> &T {
        &self.transcoder
    }

    /// Mutable access to the transcoder.
    pub fn transcoder_mut(&mut self) -> &mut T {
        &mut self.transcoder
    }

    /// Whether any entity is pending or in flight.
    pub fn is_syncing(&self) -> bool {
        self.queue.is_syncing()
    }

    /// Whether `entity` is waiting for a request.
    pub fn is_pending(&self, entity: &E) -> bool {
        self.queue.is_pending(entity)
    }

    /// Whether a request for `entity` is outstanding.
    pub fn is_in_flight(&self, entity: &E) -> bool {
        self.queue.is_in_flight(entity)
    }

    /// Whether `entity` is blocked on a dependency.
    pub fn is_blocked(&self, entity: &E) -> bool {
        self.dependencies.is_blocked(entity)
    }

    /// Queue `entity` for synchronization.
    ///
    /// Queuing an entity that is already pending or in flight does not send
    /// it again; `completion` then runs with the outcome of the outstanding
    /// synchronization, after any handler registered earlier.
    pub fn synchronize(&mut self, entity: E, completion: Option<CompletionHandler>) {
        if let Some(handler) = completion {
            self.handlers.entry(entity.clone()).or_default().push(handler);
        }
        self.queue.enqueue([entity]);
    }

    /// Queue `entity`, blocked until `dependency` is resolved.
    pub fn synchronize_after(
        &mut self,
        entity: E,
        dependency: D,
        completion: Option<CompletionHandler>,
    ) {
        self.add_dependency(entity.clone(), dependency);
        self.synchronize(entity, completion);
    }

    /// Block `entity` on `dependency`.
    pub fn add_dependency(&mut self, entity: E, dependency: D) {
        debug!(?entity, ?dependency, "Entity blocked on dependency");
        self.dependencies.add(entity, dependency);
    }

    /// Set the deadline after which `entity` expires instead of being sent.
    pub fn set_deadline(&mut self, entity: E, deadline: Instant) {
        self.deadlines.insert(entity, deadline);
    }

    /// Mark `dependency` as resolved; returns the entities that became eligible.
    pub fn resolve_dependency(&mut self, dependency: &D) -> Vec<E> {
        let unblocked = self.dependencies.resolve(dependency);
        debug!(?dependency, count = unblocked.len(), "Dependency resolved");
        unblocked
    }

    /// Expire every entity blocked on `dependency`.
    ///
    /// Pending entities complete with [`EntitySyncOutcome::Expired`]. An
    /// entity already in flight only loses its dependency record and runs
    /// to completion.
    pub fn expire_entities_blocked_on(&mut self, dependency: &D) -> Vec<EntityCompletion<E>> {
        let dependants = self.dependencies.detach(dependency);
        let mut completions = Vec::new();
        for entity in dependants {
            if !self.queue.remove_pending(&entity) {
                continue;
            }
            self.deadlines.remove(&entity);
            completions.push(self.report(entity, EntitySyncOutcome::Expired));
        }
        if !completions.is_empty() {
            debug!(?dependency, count = completions.len(), "Expired blocked entities");
        }
        completions
    }

    /// Expire pending entities whose deadline is at or before `now`.
    pub fn expire_overdue(&mut self, now: Instant) -> Vec<EntityCompletion<E>> {
        let overdue: Vec<E> = self
            .deadlines
            .iter()
            .filter(|(entity, deadline)| **deadline <= now && !self.queue.is_in_flight(entity))
            .map(|(entity, _)| entity.clone())
            .collect();

        let mut completions = Vec::new();
        for entity in overdue {
            self.deadlines.remove(&entity);
            self.dependencies.remove(&entity);
            if self.queue.remove_pending(&entity) {
                completions.push(self.report(entity, EntitySyncOutcome::Expired));
            }
        }
        completions
    }

    /// Stop synchronizing pending `entity`. No outcome is reported.
    pub fn cancel(&mut self, entity: &E) {
        if self.queue.remove_pending(entity) {
            self.handlers.remove(entity);
            self.deadlines.remove(entity);
            self.dependencies.remove(entity);
        }
    }

    /// Build the next request from eligible entities.
    ///
    /// Blocked and overdue entities are skipped. The request expires at the
    /// earliest deadline among the entities it covers unless the transcoder
    /// set one.
    pub fn next_request(&mut self, now: Instant) -> Option<ScheduledRequest> {
        let limit = self.transcoder.fetch_limit().max(1);
        let dependencies = &self.dependencies;
        let deadlines = &self.deadlines;
        let scheduled = self.queue.select(limit, |entity| {
            !dependencies.is_blocked(entity)
                && deadlines.get(entity).map_or(true, |deadline| *deadline > now)
        });
        if scheduled.is_empty() {
            return None;
        }

        let mut request = self.transcoder.request_for(&scheduled)?;
        if request.expires_at.is_none() {
            request.expires_at = scheduled
                .iter()
                .filter_map(|entity| self.deadlines.get(entity))
                .min()
                .copied();
        }
        for entity in &scheduled {
            self.transcoder.on_scheduled(entity);
        }
        debug!(count = scheduled.len(), %request, "Scheduling entities");
        let ticket = self.queue.dispatch(scheduled);
        Some(ScheduledRequest { ticket, request })
    }

    /// Route a response to the request identified by `ticket`.
    pub fn handle_response(
        &mut self,
        ticket: RequestTicket,
        response: &Response,
    ) -> Vec<EntityCompletion<E>> {
        let Some(scheduled) = self.queue.ack(ticket) else {
            debug!(ticket = ticket.value(), "Response for unknown ticket ignored");
            return Vec::new();
        };

        let outcome = match response.result() {
            ResponseClass::Success => {
                self.transcoder.did_complete(response, &scheduled);
                Some(EntitySyncOutcome::Success)
            }
            ResponseClass::Expired => {
                if self.transcoder.should_retry_on_expiration() {
                    None
                } else {
                    Some(EntitySyncOutcome::Expired)
                }
            }
            ResponseClass::PermanentError | ResponseClass::TransientError => {
                if self.transcoder.should_retry(&scheduled, response) {
                    None
                } else {
                    warn!(
                        status = response.status,
                        entities = ?scheduled,
                        "Giving up synchronizing entities"
                    );
                    self.transcoder.did_complete(response, &scheduled);
                    Some(EntitySyncOutcome::GaveUpRetrying)
                }
            }
        };

        match outcome {
            Some(outcome) => scheduled
                .into_iter()
                .map(|entity| {
                    self.deadlines.remove(&entity);
                    self.dependencies.remove(&entity);
                    self.report(entity, outcome)
                })
                .collect(),
            None => {
                debug!(
                    status = response.status,
                    count = scheduled.len(),
                    "Rescheduling entities"
                );
                self.queue.requeue(scheduled);
                Vec::new()
            }
        }
    }

    fn report(&mut self, entity: E, outcome: EntitySyncOutcome) -> EntityCompletion<E> {
        for handler in self.handlers.remove(&entity).unwrap_or_default() {
            handler(outcome);
        }
        EntityCompletion { entity, outcome }
    }
}

impl<E: Ord + Clone + Debug, D: Ord + Clone + Debug, T> Debug for DependencySync<E, D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencySync")
            .field("queue", &self.queue)
            .field("dependencies", &self.dependencies)
            .field("deadlines", &self.deadlines.len())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl<E, D, T> RequestSource for DependencySync<E, D, T>
where
    E: Ord + Clone + Debug + Send,
    D: Ord + Clone + Debug + Send,
    T: EntityTranscoder<E> + Send,
{
    fn next_request(&mut self) -> Option<ScheduledRequest> {
        let now = Instant::now();
        for completion in self.expire_overdue(now) {
            self.transcoder.on_completed(&completion);
        }
        DependencySync::next_request(self, now)
    }

    fn handle_response(&mut self, ticket: RequestTicket, response: &Response) {
        for completion in DependencySync::handle_response(self, ticket, response) {
            self.transcoder.on_completed(&completion);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct MessageTranscoder {
        fetch_limit: Option<usize>,
        retry_on_expiration: bool,
        scheduled: Vec<u32>,
        completed: Vec<(u16, BTreeSet<u32>)>,
        reported: Vec<EntityCompletion<u32>>,
    }

    impl EntityTranscoder<u32> for MessageTranscoder {
        fn fetch_limit(&self) -> usize {
            self.fetch_limit.unwrap_or(1)
        }

        fn should_retry_on_expiration(&self) -> bool {
            self.retry_on_expiration
        }

        fn request_for(&mut self, entities: &BTreeSet<u32>) -> Option<Request> {
            let first = entities.iter().next()?;
            Some(Request::post(
                format!("/conversations/{first}/messages"),
                serde_json::json!({}),
            ))
        }

        fn did_complete(&mut self, response: &Response, entities: &BTreeSet<u32>) {
            self.completed.push((response.status, entities.clone()));
        }

        fn on_scheduled(&mut self, entity: &u32) {
            self.scheduled.push(*entity);
        }

        fn on_completed(&mut self, completion: &EntityCompletion<u32>) {
            self.reported.push(completion.clone());
        }
    }

    type MessageSync = DependencySync<u32, &'static str, MessageTranscoder>;

    fn new_sync() -> MessageSync {
        DependencySync::new(MessageTranscoder {
            retry_on_expiration: true,
            ..Default::default()
        })
    }

    fn recorder() -> (Arc<Mutex<Vec<EntitySyncOutcome>>>, CompletionHandler) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        let handler: CompletionHandler = Box::new(move |outcome| {
            sink.lock().unwrap().push(outcome);
        });
        (outcomes, handler)
    }

    #[test]
    fn unblocked_entity_is_scheduled() {
        let mut sync = new_sync();
        sync.synchronize(1, None);

        let scheduled = sync.next_request(Instant::now()).unwrap();
        assert_eq!(scheduled.request.path, "/conversations/1/messages");
        assert_eq!(sync.transcoder().scheduled, vec![1]);
        assert!(sync.is_in_flight(&1));
    }

    #[test]
    fn blocked_entity_waits_for_dependency() {
        let mut sync = new_sync();
        sync.synchronize_after(1, "conv-a", None);

        assert!(sync.next_request(Instant::now()).is_none());
        assert!(sync.is_pending(&1));

        assert_eq!(sync.resolve_dependency(&"conv-a"), vec![1]);
        let scheduled = sync.next_request(Instant::now()).unwrap();
        assert_eq!(scheduled.request.path, "/conversations/1/messages");
    }

    #[test]
    fn blocked_entity_does_not_hold_back_others() {
        let mut sync = new_sync();
        sync.synchronize_after(1, "conv-a", None);
        sync.synchronize(2, None);

        let scheduled = sync.next_request(Instant::now()).unwrap();
        assert_eq!(scheduled.request.path, "/conversations/2/messages");
        assert!(sync.next_request(Instant::now()).is_none());
    }

    #[test]
    fn success_reports_completion() {
        let mut sync = new_sync();
        let (outcomes, handler) = recorder();
        sync.synchronize(1, Some(handler));

        let scheduled = sync.next_request(Instant::now()).unwrap();
        let completions = sync.handle_response(scheduled.ticket, &Response::status(201));

        assert_eq!(
            completions,
            vec![EntityCompletion {
                entity: 1,
                outcome: EntitySyncOutcome::Success
            }]
        );
        assert_eq!(*outcomes.lock().unwrap(), vec![EntitySyncOutcome::Success]);
        assert!(!sync.is_syncing());
    }

    #[test]
    fn transient_failure_is_retried() {
        let mut sync = new_sync();
        sync.synchronize(1, None);

        let scheduled = sync.next_request(Instant::now()).unwrap();
        let completions = sync.handle_response(scheduled.ticket, &Response::status(500));
        assert!(completions.is_empty());
        assert!(sync.is_pending(&1));
    }

    #[test]
    fn permanent_failure_gives_up() {
        let mut sync = new_sync();
        let (outcomes, handler) = recorder();
        sync.synchronize(1, Some(handler));

        let scheduled = sync.next_request(Instant::now()).unwrap();
        let completions = sync.handle_response(scheduled.ticket, &Response::status(403));

        assert_eq!(completions[0].outcome, EntitySyncOutcome::GaveUpRetrying);
        assert_eq!(sync.transcoder().completed, vec![(403, BTreeSet::from([1]))]);
        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![EntitySyncOutcome::GaveUpRetrying]
        );
    }

    #[test]
    fn expired_response_is_retried_when_configured() {
        let mut sync = new_sync();
        sync.synchronize(1, None);

        let scheduled = sync.next_request(Instant::now()).unwrap();
        assert!(sync
            .handle_response(scheduled.ticket, &Response::expired())
            .is_empty());
        assert!(sync.is_pending(&1));
    }

    #[test]
    fn expired_response_completes_when_not_retried() {
        let mut sync = DependencySync::<u32, &str, _>::new(MessageTranscoder::default());
        sync.synchronize(1, None);

        let scheduled = sync.next_request(Instant::now()).unwrap();
        let completions = sync.handle_response(scheduled.ticket, &Response::expired());
        assert_eq!(completions[0].outcome, EntitySyncOutcome::Expired);
        assert!(!sync.is_syncing());
    }

    #[test]
    fn expiring_a_dependency_expires_blocked_entities() {
        let mut sync = new_sync();
        let (outcomes, handler) = recorder();
        sync.synchronize_after(1, "conv-a", Some(handler));
        sync.synchronize_after(2, "conv-a", None);
        sync.synchronize_after(3, "conv-b", None);

        let mut expired: Vec<u32> = sync
            .expire_entities_blocked_on(&"conv-a")
            .into_iter()
            .map(|c| c.entity)
            .collect();
        expired.sort();

        assert_eq!(expired, vec![1, 2]);
        assert_eq!(*outcomes.lock().unwrap(), vec![EntitySyncOutcome::Expired]);
        assert!(!sync.is_pending(&1));
        assert!(sync.is_pending(&3));
        assert!(sync.is_blocked(&3));
    }

    #[test]
    fn expiring_a_dependency_spares_in_flight_entities() {
        let mut sync = new_sync();
        sync.synchronize(1, None);
        let scheduled = sync.next_request(Instant::now()).unwrap();
        sync.add_dependency(1, "conv-a");

        assert!(sync.expire_entities_blocked_on(&"conv-a").is_empty());
        let completions = sync.handle_response(scheduled.ticket, &Response::status(200));
        assert_eq!(completions[0].outcome, EntitySyncOutcome::Success);
    }

    #[test]
    fn overdue_entity_expires_instead_of_being_sent() {
        let mut sync = new_sync();
        let now = Instant::now();
        sync.synchronize(1, None);
        sync.set_deadline(1, now);

        assert!(sync.next_request(now).is_none());
        let completions = sync.expire_overdue(now);
        assert_eq!(completions[0].outcome, EntitySyncOutcome::Expired);
        assert!(!sync.is_syncing());
    }

    #[test]
    fn request_carries_earliest_deadline() {
        let mut sync = DependencySync::<u32, &str, _>::new(MessageTranscoder {
            fetch_limit: Some(2),
            retry_on_expiration: true,
            ..Default::default()
        });
        let now = Instant::now();
        sync.synchronize(1, None);
        sync.synchronize(2, None);
        sync.set_deadline(1, now + Duration::from_secs(30));
        sync.set_deadline(2, now + Duration::from_secs(10));

        let scheduled = sync.next_request(now).unwrap();
        assert_eq!(
            scheduled.request.expires_at,
            Some(now + Duration::from_secs(10))
        );
    }

    #[test]
    fn cancel_drops_pending_entity_without_outcome() {
        let mut sync = new_sync();
        let (outcomes, handler) = recorder();
        sync.synchronize(1, Some(handler));
        sync.cancel(&1);

        assert!(!sync.is_syncing());
        assert!(sync.next_request(Instant::now()).is_none());
        assert!(outcomes.lock().unwrap().is_empty());
    }

    #[test]
    fn request_source_forwards_completions() {
        let mut sync = new_sync();
        sync.synchronize(1, None);

        let scheduled = RequestSource::next_request(&mut sync).unwrap();
        RequestSource::handle_response(&mut sync, scheduled.ticket, &Response::status(200));

        assert_eq!(
            sync.transcoder().reported,
            vec![EntityCompletion {
                entity: 1,
                outcome: EntitySyncOutcome::Success
            }]
        );
    }

    #[test]
    fn resynchronizing_in_flight_entity_keeps_every_handler() {
        let mut sync = new_sync();
        let (first, first_handler) = recorder();
        let (second, second_handler) = recorder();
        sync.synchronize(1, Some(first_handler));
        let scheduled = sync.next_request(Instant::now()).unwrap();

        sync.synchronize(1, Some(second_handler));
        assert!(sync.next_request(Instant::now()).is_none());

        let completions = sync.handle_response(scheduled.ticket, &Response::status(200));
        assert_eq!(completions.len(), 1);
        assert_eq!(*first.lock().unwrap(), vec![EntitySyncOutcome::Success]);
        assert_eq!(*second.lock().unwrap(), vec![EntitySyncOutcome::Success]);
    }

    #[test]
    fn resynchronizing_pending_entity_reports_once_per_handler() {
        let mut sync = new_sync();
        let (first, first_handler) = recorder();
        let (second, second_handler) = recorder();
        sync.synchronize_after(1, "conv-a", Some(first_handler));
        sync.synchronize(1, Some(second_handler));

        let completions = sync.expire_entities_blocked_on(&"conv-a");
        assert_eq!(completions.len(), 1);
        assert_eq!(*first.lock().unwrap(), vec![EntitySyncOutcome::Expired]);
        assert_eq!(*second.lock().unwrap(), vec![EntitySyncOutcome::Expired]);
    }
}
