/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The identity manager: owns the identity set and orchestrates refreshes.

use crate::event::{IdentityManagerEvent, IdentitySignal, SignalMessage};
use crate::identity::{IdentityContext, KerberosIdentity};
use crate::op::{IdentityList, ListGate, Operation, OperationToken};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use ticketd_async::alarm::AlarmContext;
use ticketd_async::sleep::{default_async_sleep, SharedAsyncSleep};
use ticketd_async::time::SharedTimeSource;
use ticketd_credentials::cache::CredentialCache;
use ticketd_credentials::provider::{
    CacheCollection, CollectionChangeSink, CollectionWatcher, ProvideCaches, SharedCacheCollection,
    SharedCacheProvider,
};
use ticketd_credentials::CredentialsError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Default)]
struct ManagerState {
    collection: Option<SharedCacheCollection>,
    watcher: Option<Box<dyn CollectionWatcher>>,
    identities: HashMap<String, Arc<KerberosIdentity>>,
    expired_identities: HashSet<String>,
    identities_by_realm: HashMap<String, Vec<Arc<KerberosIdentity>>>,
}

struct ManagerInner {
    provider: SharedCacheProvider,
    alarm_context: AlarmContext,
    monitoring_required: bool,
    ops_tx: UnboundedSender<Operation>,
    ops_rx: Mutex<Option<UnboundedReceiver<Operation>>>,
    signals_tx: UnboundedSender<SignalMessage>,
    signals_rx: Mutex<Option<UnboundedReceiver<SignalMessage>>>,
    pending_refresh_count: AtomicI64,
    scheduler_cancel: CancellationToken,
    gate: ListGate,
    state: Mutex<ManagerState>,
    subscribers: Mutex<Vec<UnboundedSender<IdentityManagerEvent>>>,
}

/// Tracks the identities present in a credential store's cache collection.
///
/// The manager discovers identities by enumerating the collection, diffs each
/// enumeration against its current identity set, and reports the differences as
/// [`IdentityManagerEvent`]s. All identity operations are serialized through one
/// background worker; results are delivered through the returned futures.
///
/// Construct with [`IdentityManager::builder`], then call
/// [`start`](IdentityManager::start) from within a tokio runtime. The worker shuts
/// down when [`stop`](IdentityManager::stop) is called or the last manager handle
/// is dropped.
#[derive(Clone)]
pub struct IdentityManager {
    inner: Arc<ManagerInner>,
    _shutdown: Arc<DropGuard>,
}

impl Debug for IdentityManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityManager").finish()
    }
}

impl IdentityManager {
    /// Returns a builder for `IdentityManager`.
    pub fn builder() -> IdentityManagerBuilder {
        IdentityManagerBuilder::default()
    }

    /// Opens the credential store's cache collection, installs the collection
    /// watcher, starts the background worker, and queues the initial refresh.
    ///
    /// Failure to open the collection is fatal. Failure to install the watcher is
    /// logged and degrades the manager to refresh-on-demand, unless monitoring was
    /// required via the builder.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), CredentialsError> {
        let collection = self.inner.provider.open_collection()?;

        let watcher = {
            let weak = Arc::downgrade(&self.inner);
            let sink = CollectionChangeSink::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.schedule_refresh();
                }
            });
            match collection.watch(sink) {
                Ok(watcher) => Some(watcher),
                Err(err) if self.inner.monitoring_required => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        err = %err,
                        "could not monitor credential caches; refreshing on demand only"
                    );
                    None
                }
            }
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.collection = Some(collection);
            state.watcher = watcher;
        }

        let ops_rx = self.inner.ops_rx.lock().unwrap().take();
        let signals_rx = self.inner.signals_rx.lock().unwrap().take();
        match (ops_rx, signals_rx) {
            (Some(ops_rx), Some(signals_rx)) => {
                tokio::spawn(run_worker(self.inner.clone(), ops_rx));
                tokio::spawn(run_signal_pump(self.inner.clone(), signals_rx));
            }
            _ => {
                tracing::debug!("identity manager already started");
            }
        }

        self.inner.schedule_refresh();
        Ok(())
    }

    /// Stops the manager: terminates the worker, cancels every queued operation,
    /// releases the collection watcher, and drops the store collection handle.
    pub fn stop(&self) {
        tracing::debug!("stopping identity manager");
        self.inner.scheduler_cancel.cancel();
        let mut state = self.inner.state.lock().unwrap();
        state.watcher = None;
        state.collection = None;
    }

    /// Subscribes to collection-level events.
    ///
    /// Events are delivered in the order the worker emitted them. Dropping the
    /// receiver unsubscribes.
    pub fn subscribe(&self) -> UnboundedReceiver<IdentityManagerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Produces the current identities, sorted by identifier.
    ///
    /// Until the returned [`IdentityList`] is dropped, the worker holds back
    /// refreshes so no added/removed events race against the caller reading the
    /// snapshot. Renew and sign-out operations are not held back.
    pub async fn list_identities(
        &self,
        cancel: Option<CancellationToken>,
    ) -> Result<IdentityList, CredentialsError> {
        let (respond_to, response) = oneshot::channel();
        self.submit(Operation::List {
            cancel: OperationToken::from_caller(cancel),
            respond_to,
        })?;
        response.await.map_err(|_| CredentialsError::Cancelled)?
    }

    /// Renews `identity`'s credentials through the store.
    pub async fn renew_identity(
        &self,
        identity: &Arc<KerberosIdentity>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), CredentialsError> {
        let (respond_to, response) = oneshot::channel();
        self.submit(Operation::Renew {
            identity: identity.clone(),
            cancel: OperationToken::from_caller(cancel),
            respond_to,
        })?;
        response.await.map_err(|_| CredentialsError::Cancelled)?
    }

    /// Signs `identity` out by erasing its credential cache.
    pub async fn sign_out_identity(
        &self,
        identity: &Arc<KerberosIdentity>,
        cancel: Option<CancellationToken>,
    ) -> Result<(), CredentialsError> {
        let (respond_to, response) = oneshot::channel();
        self.submit(Operation::SignOut {
            identity: identity.clone(),
            cancel: OperationToken::from_caller(cancel),
            respond_to,
        })?;
        response.await.map_err(|_| CredentialsError::Cancelled)?
    }

    /// Names `identity` for display and makes it the most recently used of its realm.
    ///
    /// The sole identity of a realm goes by the bare realm name; realmmates go by
    /// their full principal names. When naming this identity makes a previously sole
    /// realmmate ambiguous, a [`IdentityManagerEvent::Renamed`] event is emitted for
    /// it.
    pub fn name_identity(&self, identity: &Arc<KerberosIdentity>) -> Option<String> {
        let mut state = self.inner.state.lock().unwrap();
        self.inner.assign_name(&mut state, identity)
    }

    fn submit(&self, operation: Operation) -> Result<(), CredentialsError> {
        self.inner
            .ops_tx
            .send(operation)
            .map_err(|_| CredentialsError::Cancelled)
    }
}

impl ManagerInner {
    /// Queues a coalescible refresh.
    fn schedule_refresh(&self) {
        self.pending_refresh_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.ops_tx.send(Operation::Refresh {
            cancel: OperationToken::fresh(),
        });
    }

    /// Delivers `event` to every live subscriber, in order.
    fn emit(&self, event: IdentityManagerEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn identity_context(&self) -> IdentityContext {
        IdentityContext {
            alarm: self.alarm_context.clone(),
            signals: self.signals_tx.clone(),
        }
    }

    /// Re-enumerates the cache collection and diffs it against the identity set.
    fn refresh_identities(&self) {
        // If more refreshes are queued up, don't bother doing this one.
        if self.pending_refresh_count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        tracing::debug!("refreshing identities");

        let collection = self.state.lock().unwrap().collection.clone();
        let Some(collection) = collection else {
            return;
        };
        let caches = match collection.enumerate() {
            Ok(caches) => caches,
            Err(err) => {
                // The next collection-change notification retries; identities that
                // merely failed to enumerate this cycle must not look removed.
                tracing::warn!(err = %err, "error looking up available credential caches");
                return;
            }
        };

        let mut refreshed = HashSet::new();
        for cache in caches {
            let cache = match cache {
                Ok(cache) => cache,
                Err(err) => {
                    tracing::warn!(err = %err, "error iterating over available credential caches");
                    continue;
                }
            };
            let transient = match KerberosIdentity::new(cache.clone(), self.identity_context()) {
                Ok(transient) => transient,
                Err(err) => {
                    tracing::debug!(
                        cache = cache.name().as_deref().unwrap_or("<unnamed>"),
                        err = %err,
                        "could not build identity from credentials cache"
                    );
                    continue;
                }
            };
            self.refresh_identity(transient, &mut refreshed);
        }

        self.drop_stale_identities(&refreshed);
    }

    /// Folds one enumerated identity into the set, updating or adding.
    fn refresh_identity(&self, transient: Arc<KerberosIdentity>, refreshed: &mut HashSet<String>) {
        let Some(identifier) = transient.identifier() else {
            return;
        };

        let existing = {
            let state = self.state.lock().unwrap();
            state.identities.get(&identifier).cloned()
        };
        match existing {
            Some(existing) => {
                let was_expired = {
                    let mut state = self.state.lock().unwrap();
                    state.expired_identities.remove(&identifier)
                };
                // Reuse the existing instance so handles held by consumers stay valid.
                existing.update(&transient);
                if was_expired {
                    if existing.is_signed_in() {
                        self.emit(IdentityManagerEvent::Renewed(existing));
                    } else {
                        // Still expired after the update; nothing was renewed.
                        let mut state = self.state.lock().unwrap();
                        state.expired_identities.insert(identifier.clone());
                    }
                }
            }
            None => {
                let mut state = self.state.lock().unwrap();
                self.add_identity(&mut state, transient, identifier.clone());
            }
        }
        refreshed.insert(identifier);
    }

    fn add_identity(
        &self,
        state: &mut ManagerState,
        identity: Arc<KerberosIdentity>,
        identifier: String,
    ) {
        state.identities.insert(identifier.clone(), identity.clone());
        if !identity.is_signed_in() {
            state.expired_identities.insert(identifier);
        }
        self.emit(IdentityManagerEvent::Added(identity.clone()));
        self.assign_name(state, &identity);
    }

    /// Drops identities the last enumeration no longer produced.
    fn drop_stale_identities(&self, refreshed: &HashSet<String>) {
        let stale: Vec<_> = {
            let state = self.state.lock().unwrap();
            state
                .identities
                .iter()
                .filter(|(identifier, _)| !refreshed.contains(*identifier))
                .map(|(identifier, identity)| (identifier.clone(), identity.clone()))
                .collect()
        };
        for (identifier, identity) in stale {
            let mut state = self.state.lock().unwrap();
            self.remove_identity(&mut state, &identifier, identity);
        }
    }

    fn remove_identity(
        &self,
        state: &mut ManagerState,
        identifier: &str,
        identity: Arc<KerberosIdentity>,
    ) {
        let mut newly_sole = None;
        if let Some(realm) = identity.realm_name() {
            if let Some(bucket) = state.identities_by_realm.get_mut(&realm) {
                bucket.retain(|other| !Arc::ptr_eq(other, &identity));
                if bucket.is_empty() {
                    state.identities_by_realm.remove(&realm);
                } else if bucket.len() == 1 {
                    // The remaining realmmate's display name collapses from the
                    // full principal down to the bare realm.
                    newly_sole = Some(bucket[0].clone());
                }
            }
        }

        state.expired_identities.remove(identifier);
        state.identities.remove(identifier);

        self.emit(IdentityManagerEvent::Removed(identity));
        if let Some(renamed) = newly_sole {
            self.emit(IdentityManagerEvent::Renamed(renamed));
        }
    }

    /// Places `identity` at the head of its realm bucket and derives its display
    /// name, emitting a rename for a previously sole realmmate that just became
    /// ambiguous.
    fn assign_name(
        &self,
        state: &mut ManagerState,
        identity: &Arc<KerberosIdentity>,
    ) -> Option<String> {
        let realm = identity.realm_name()?;
        let bucket = state.identities_by_realm.entry(realm.clone()).or_default();

        let displaced_sole = match &bucket[..] {
            [sole] if !Arc::ptr_eq(sole, identity) => Some(sole.clone()),
            _ => None,
        };

        bucket.retain(|other| !Arc::ptr_eq(other, identity));
        bucket.insert(0, identity.clone());

        if bucket.len() > 1 {
            let name = identity.principal_name();
            if let Some(displaced) = displaced_sole {
                self.emit(IdentityManagerEvent::Renamed(displaced));
            }
            name
        } else {
            Some(realm)
        }
    }
}

/// The worker: drains the operation queue, one operation at a time.
///
/// While a list result is held by a caller, refreshes and further lists are parked
/// in arrival order; renew and sign-out operations keep flowing.
async fn run_worker(inner: Arc<ManagerInner>, mut ops: UnboundedReceiver<Operation>) {
    let cancel = inner.scheduler_cancel.clone();
    let mut deferred: VecDeque<Operation> = VecDeque::new();

    loop {
        if deferred.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                operation = ops.recv() => match operation {
                    None => break,
                    Some(operation) => {
                        if !operation.bypasses_gate() && inner.gate.is_blocked() {
                            deferred.push_back(operation);
                        } else {
                            process_operation(&inner, operation);
                        }
                    }
                },
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = inner.gate.unblocked() => {
                    let operation = deferred.pop_front().expect("deferred operation present");
                    process_operation(&inner, operation);
                }
                operation = ops.recv() => match operation {
                    None => break,
                    Some(operation) => {
                        if operation.bypasses_gate() {
                            process_operation(&inner, operation);
                        } else {
                            deferred.push_back(operation);
                        }
                    }
                },
            }
        }
    }

    // Shutdown drain: every queued operation resolves with a cancellation error.
    for operation in deferred {
        operation.cancel_and_complete();
    }
    while let Ok(operation) = ops.try_recv() {
        operation.cancel_and_complete();
    }
}

fn process_operation(inner: &Arc<ManagerInner>, operation: Operation) {
    if operation.cancelled_before_start() {
        operation.complete_cancelled();
        return;
    }

    match operation {
        Operation::Refresh { .. } => inner.refresh_identities(),
        Operation::List { respond_to, .. } => {
            tracing::debug!("listing identities");
            let mut identities: Vec<_> = {
                let state = inner.state.lock().unwrap();
                state.identities.values().cloned().collect()
            };
            identities.sort_by(|a, b| a.identifier().cmp(&b.identifier()));

            // Hold refreshes until the caller has had a chance to look at the
            // batch of results; the list's drop reopens the gate.
            tracing::debug!("blocking refreshes until the identity list is released");
            let list = IdentityList::new(identities, inner.gate.block());
            let _ = respond_to.send(Ok(list));
        }
        Operation::Renew {
            identity,
            respond_to,
            ..
        } => {
            tracing::debug!(
                identity = identity.principal_name().as_deref().unwrap_or("<unnamed>"),
                "renewing identity"
            );
            let result = identity.renew();
            if let Err(err) = &result {
                tracing::debug!(err = %err, "could not renew identity");
            }
            let _ = respond_to.send(result);
        }
        Operation::SignOut {
            identity,
            respond_to,
            ..
        } => {
            tracing::debug!(
                identity = identity.principal_name().as_deref().unwrap_or("<unnamed>"),
                "signing out identity"
            );
            let result = identity.erase();
            if let Err(err) = &result {
                tracing::debug!(err = %err, "could not sign out identity");
            }
            let _ = respond_to.send(result);
        }
    }
}

/// Reacts to per-identity signals on behalf of the manager.
async fn run_signal_pump(inner: Arc<ManagerInner>, mut signals: UnboundedReceiver<SignalMessage>) {
    let cancel = inner.scheduler_cancel.clone();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = signals.recv() => match message {
                None => break,
                Some(message) => message,
            },
        };
        let Some(identity) = message.identity.upgrade() else {
            continue;
        };
        match message.signal {
            IdentitySignal::NeedsRefresh => inner.schedule_refresh(),
            IdentitySignal::Unexpired => {
                // An identity coming back unexpired means the clock skewed, which
                // probably affected more than one identity.
                inner.schedule_refresh();
            }
            IdentitySignal::NeedsRenewal => {
                tracing::debug!("identity needs renewal");
                let (respond_to, response) = oneshot::channel();
                let _ = inner.ops_tx.send(Operation::Renew {
                    identity,
                    cancel: OperationToken::fresh(),
                    respond_to,
                });
                tokio::spawn(async move {
                    if let Ok(Err(err)) = response.await {
                        tracing::debug!(err = %err, "could not renew identity");
                    }
                });
            }
            IdentitySignal::Expired => {
                if let Some(identifier) = identity.identifier() {
                    let mut state = inner.state.lock().unwrap();
                    state.expired_identities.insert(identifier);
                }
                inner.emit(IdentityManagerEvent::Expired(identity));
            }
        }
    }
}

/// Builder for [`IdentityManager`].
#[derive(Default)]
pub struct IdentityManagerBuilder {
    provider: Option<SharedCacheProvider>,
    time_source: Option<SharedTimeSource>,
    sleep: Option<SharedAsyncSleep>,
    kernel_timers: Option<bool>,
    monitoring_required: bool,
}

impl IdentityManagerBuilder {
    /// Sets the credential store the manager tracks. Required.
    pub fn credential_store(mut self, provider: impl ProvideCaches + 'static) -> Self {
        self.provider = Some(SharedCacheProvider::new(provider));
        self
    }

    /// Sets the time source identity validity is judged against.
    /// Defaults to the system clock.
    pub fn time_source(mut self, time_source: SharedTimeSource) -> Self {
        self.time_source = Some(time_source);
        self
    }

    /// Sets the sleep implementation alarms poll with. Defaults to the tokio sleep.
    pub fn sleep_impl(mut self, sleep: SharedAsyncSleep) -> Self {
        self.sleep = Some(sleep);
        self
    }

    /// Enables or disables kernel timers for alarms. Defaults to enabled, unless a
    /// custom time source was configured (kernel timers follow the real wall clock).
    pub fn kernel_timers(mut self, enabled: bool) -> Self {
        self.kernel_timers = Some(enabled);
        self
    }

    /// Makes [`start`](IdentityManager::start) fail when the cache collection
    /// cannot be watched, instead of degrading to refresh-on-demand.
    pub fn require_monitoring(mut self) -> Self {
        self.monitoring_required = true;
        self
    }

    /// Builds the [`IdentityManager`].
    ///
    /// # Panics
    ///
    /// Panics if no credential store was provided.
    pub fn build(self) -> IdentityManager {
        let provider = self.provider.expect("a credential store is required");
        let kernel_timers = self.kernel_timers.unwrap_or(self.time_source.is_none());
        let time_source = self.time_source.unwrap_or_default();
        let sleep = self.sleep.unwrap_or_else(default_async_sleep);
        let alarm_context =
            AlarmContext::new(time_source, sleep).with_kernel_timers(kernel_timers);

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let scheduler_cancel = CancellationToken::new();
        let shutdown = scheduler_cancel.clone().drop_guard();

        IdentityManager {
            inner: Arc::new(ManagerInner {
                provider,
                alarm_context,
                monitoring_required: self.monitoring_required,
                ops_tx,
                ops_rx: Mutex::new(Some(ops_rx)),
                signals_tx,
                signals_rx: Mutex::new(Some(signals_rx)),
                pending_refresh_count: AtomicI64::new(0),
                scheduler_cancel,
                gate: ListGate::default(),
                state: Mutex::new(ManagerState::default()),
                subscribers: Mutex::new(Vec::new()),
            }),
            _shutdown: Arc::new(shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use ticketd_async::test_util::TestClock;
    use ticketd_credentials::memory::MemoryCredentialStore;
    use ticketd_credentials::{Credential, Principal};

    fn tgt(principal: &Principal, end_time: SystemTime) -> Credential {
        Credential::builder()
            .client(principal.clone())
            .server(Principal::ticket_granting_service(principal.realm()))
            .end_time(end_time)
            .build()
    }

    fn at(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn started_manager(store: &MemoryCredentialStore) -> IdentityManager {
        let clock = TestClock::new(SystemTime::UNIX_EPOCH);
        let manager = IdentityManager::builder()
            .credential_store(store.clone())
            .time_source(SharedTimeSource::new(clock.clone()))
            .sleep_impl(SharedAsyncSleep::new(clock))
            .build();
        manager.start().unwrap();
        manager
    }

    // The manager handles the reserved fine-grained signal kinds even though current
    // identity policy only ever emits NeedsRefresh.

    #[tokio::test]
    async fn expired_signal_marks_the_identity_and_notifies() {
        let store = MemoryCredentialStore::default();
        let alice = Principal::user("alice", "EXAMPLE.COM");
        store.put_cache("krb5cc_a", alice.clone(), vec![tgt(&alice, at(100))]);

        let manager = started_manager(&store);
        let mut events = manager.subscribe();
        settle().await;
        let added = events.recv().await.unwrap();
        let identity = added.identity().clone();

        manager
            .inner
            .signals_tx
            .send(SignalMessage {
                identity: Arc::downgrade(&identity),
                signal: IdentitySignal::Expired,
            })
            .unwrap();
        settle().await;

        let event = events.recv().await.unwrap();
        assert!(matches!(event, IdentityManagerEvent::Expired(_)));
        let state = manager.inner.state.lock().unwrap();
        assert!(state
            .expired_identities
            .contains(&identity.identifier().unwrap()));
    }

    #[tokio::test]
    async fn needs_renewal_signal_renews_automatically() {
        let clock = TestClock::new(SystemTime::UNIX_EPOCH);
        let store = MemoryCredentialStore::builder()
            .time_source(SharedTimeSource::new(clock.clone()))
            .renew_lifetime(Duration::from_secs(600))
            .build();
        let alice = Principal::user("alice", "EXAMPLE.COM");
        store.put_cache("krb5cc_a", alice.clone(), vec![tgt(&alice, at(100))]);

        let manager = IdentityManager::builder()
            .credential_store(store.clone())
            .time_source(SharedTimeSource::new(clock.clone()))
            .sleep_impl(SharedAsyncSleep::new(clock))
            .build();
        manager.start().unwrap();
        let mut events = manager.subscribe();
        settle().await;
        let identity = events.recv().await.unwrap().identity().clone();
        assert_eq!(identity.expiration_time(), Some(at(100)));

        manager
            .inner
            .signals_tx
            .send(SignalMessage {
                identity: Arc::downgrade(&identity),
                signal: IdentitySignal::NeedsRenewal,
            })
            .unwrap();
        settle().await;

        // The automatic renewal extended the credentials, and the refresh the
        // store change triggered folded the new end time into the identity.
        assert_eq!(identity.expiration_time(), Some(at(600)));
    }
}
