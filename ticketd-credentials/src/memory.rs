/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! In-memory credential store.
//!
//! Implements the full store capability surface over a mutable in-memory cache
//! collection. It backs the test suites of the identity tracking crates and can stand
//! in for a real store in embedders that fabricate their own credentials.

use crate::cache::{CredentialCache, SharedCredentialCache};
use crate::credential::Credential;
use crate::error::{CredentialsError, RenewalPhase};
use crate::principal::Principal;
use crate::provider::{
    CacheCollection, CacheIter, CollectionChangeSink, CollectionWatcher, ProvideCaches,
    SharedCacheCollection,
};
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use ticketd_async::time::{SharedTimeSource, TimeSource};

/// Validity granted to credentials renewed by the in-memory store.
const DEFAULT_RENEW_LIFETIME: Duration = Duration::from_secs(10 * 60 * 60);

#[derive(Debug)]
struct CacheEntry {
    principal: Option<Principal>,
    credentials: Vec<Credential>,
    renewable: bool,
    inspect_failure: bool,
}

#[derive(Default)]
struct StoreState {
    caches: BTreeMap<String, CacheEntry>,
    sinks: Vec<(u64, CollectionChangeSink)>,
    next_sink_id: u64,
    enumerate_count: u64,
    fail_enumerate: bool,
}

struct StoreInner {
    time_source: SharedTimeSource,
    renew_lifetime: Duration,
    watchable: bool,
    fail_open: bool,
    state: Mutex<StoreState>,
}

impl Debug for StoreInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCredentialStore")
            .field("watchable", &self.watchable)
            .finish()
    }
}

/// An in-memory credential store.
///
/// Cloning yields another handle onto the same collection. Any mutation of the
/// collection notifies installed watchers, the way an on-disk store's file monitor
/// would.
#[derive(Clone, Debug)]
pub struct MemoryCredentialStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl MemoryCredentialStore {
    /// Returns a builder for `MemoryCredentialStore`.
    pub fn builder() -> MemoryCredentialStoreBuilder {
        MemoryCredentialStoreBuilder::default()
    }

    /// Inserts or replaces the cache called `name` and notifies watchers.
    pub fn put_cache(
        &self,
        name: impl Into<String>,
        principal: Principal,
        credentials: Vec<Credential>,
    ) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.caches.insert(
                name.into(),
                CacheEntry {
                    principal: Some(principal),
                    credentials,
                    renewable: true,
                    inspect_failure: false,
                },
            );
        }
        self.notify_change();
    }

    /// Inserts a cache that has no principal associated with it and notifies watchers.
    pub fn put_cache_without_principal(&self, name: impl Into<String>) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.caches.insert(
                name.into(),
                CacheEntry {
                    principal: None,
                    credentials: Vec::new(),
                    renewable: false,
                    inspect_failure: false,
                },
            );
        }
        self.notify_change();
    }

    /// Removes the cache called `name`, if present, and notifies watchers.
    pub fn remove_cache(&self, name: &str) {
        let removed = self
            .inner
            .state
            .lock()
            .unwrap()
            .caches
            .remove(name)
            .is_some();
        if removed {
            self.notify_change();
        }
    }

    /// Marks whether the cache called `name` can be renewed.
    pub fn set_renewable(&self, name: &str, renewable: bool) {
        if let Some(entry) = self.inner.state.lock().unwrap().caches.get_mut(name) {
            entry.renewable = renewable;
        }
    }

    /// Makes inspection of the cache called `name` fail, to exercise skip paths.
    pub fn set_inspect_failure(&self, name: &str, fail: bool) {
        if let Some(entry) = self.inner.state.lock().unwrap().caches.get_mut(name) {
            entry.inspect_failure = fail;
        }
    }

    /// Makes collection enumeration fail as a whole.
    pub fn set_fail_enumerate(&self, fail: bool) {
        self.inner.state.lock().unwrap().fail_enumerate = fail;
    }

    /// True if a cache called `name` currently exists.
    pub fn contains_cache(&self, name: &str) -> bool {
        self.inner.state.lock().unwrap().caches.contains_key(name)
    }

    /// Number of successful collection enumerations so far.
    pub fn enumerate_count(&self) -> u64 {
        self.inner.state.lock().unwrap().enumerate_count
    }

    /// Notifies watchers of a collection change without changing anything.
    pub fn notify_change(&self) {
        let sinks: Vec<_> = self
            .inner
            .state
            .lock()
            .unwrap()
            .sinks
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in sinks {
            sink.notify();
        }
    }
}

impl ProvideCaches for MemoryCredentialStore {
    fn open_collection(&self) -> Result<SharedCacheCollection, CredentialsError> {
        if self.inner.fail_open {
            return Err(CredentialsError::initializing(
                "the in-memory store was configured to fail to open",
            ));
        }
        Ok(SharedCacheCollection::new(MemoryCacheCollection {
            inner: self.inner.clone(),
        }))
    }
}

/// Builder for [`MemoryCredentialStore`].
#[derive(Default)]
pub struct MemoryCredentialStoreBuilder {
    time_source: Option<SharedTimeSource>,
    renew_lifetime: Option<Duration>,
    unwatchable: bool,
    fail_open: bool,
}

impl MemoryCredentialStoreBuilder {
    /// Sets the time source renewals compute new end times against.
    pub fn time_source(mut self, time_source: SharedTimeSource) -> Self {
        self.time_source = Some(time_source);
        self
    }

    /// Sets the validity granted to renewed credentials. Defaults to ten hours.
    pub fn renew_lifetime(mut self, lifetime: Duration) -> Self {
        self.renew_lifetime = Some(lifetime);
        self
    }

    /// Makes `watch` fail, to exercise no-monitoring degradation.
    pub fn unwatchable(mut self) -> Self {
        self.unwatchable = true;
        self
    }

    /// Makes `open_collection` fail, to exercise fatal start errors.
    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Builds the [`MemoryCredentialStore`].
    pub fn build(self) -> MemoryCredentialStore {
        MemoryCredentialStore {
            inner: Arc::new(StoreInner {
                time_source: self.time_source.unwrap_or_default(),
                renew_lifetime: self.renew_lifetime.unwrap_or(DEFAULT_RENEW_LIFETIME),
                watchable: !self.unwatchable,
                fail_open: self.fail_open,
                state: Mutex::new(StoreState::default()),
            }),
        }
    }
}

#[derive(Debug)]
struct MemoryCacheCollection {
    inner: Arc<StoreInner>,
}

impl CacheCollection for MemoryCacheCollection {
    fn enumerate(&self) -> Result<CacheIter<'_>, CredentialsError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.fail_enumerate {
            return Err(CredentialsError::verifying(
                "could not enumerate the credential cache collection",
            ));
        }
        state.enumerate_count += 1;
        let caches: Vec<_> = state
            .caches
            .keys()
            .map(|name| {
                Ok(SharedCredentialCache::new(MemoryCache {
                    name: name.clone(),
                    inner: self.inner.clone(),
                }))
            })
            .collect();
        Ok(Box::new(caches.into_iter()))
    }

    fn watch(
        &self,
        sink: CollectionChangeSink,
    ) -> Result<Box<dyn CollectionWatcher>, CredentialsError> {
        if !self.inner.watchable {
            return Err(CredentialsError::monitoring(
                "only FILE and DIR credential cache collections can be watched, not 'MEMORY'",
            ));
        }
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_sink_id;
        state.next_sink_id += 1;
        state.sinks.push((id, sink));
        Ok(Box::new(MemoryCollectionWatcher {
            inner: self.inner.clone(),
            id,
        }))
    }
}

#[derive(Debug)]
struct MemoryCollectionWatcher {
    inner: Arc<StoreInner>,
    id: u64,
}

impl CollectionWatcher for MemoryCollectionWatcher {}

impl Drop for MemoryCollectionWatcher {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap();
        state.sinks.retain(|(id, _)| *id != self.id);
    }
}

#[derive(Debug)]
struct MemoryCache {
    name: String,
    inner: Arc<StoreInner>,
}

impl MemoryCache {
    fn notify_change(&self) {
        let sinks: Vec<_> = self
            .inner
            .state
            .lock()
            .unwrap()
            .sinks
            .iter()
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in sinks {
            sink.notify();
        }
    }
}

impl CredentialCache for MemoryCache {
    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn principal(&self) -> Result<Option<Principal>, CredentialsError> {
        let state = self.inner.state.lock().unwrap();
        match state.caches.get(&self.name) {
            None => Ok(None),
            Some(entry) if entry.inspect_failure => Err(CredentialsError::verifying(format!(
                "could not read credential cache '{}'",
                self.name
            ))),
            Some(entry) => Ok(entry.principal.clone()),
        }
    }

    fn credentials(&self) -> Result<Vec<Credential>, CredentialsError> {
        let state = self.inner.state.lock().unwrap();
        match state.caches.get(&self.name) {
            None => Ok(Vec::new()),
            Some(entry) if entry.inspect_failure => Err(CredentialsError::verifying(format!(
                "could not read credential cache '{}'",
                self.name
            ))),
            Some(entry) => Ok(entry.credentials.clone()),
        }
    }

    fn renew(&self) -> Result<(), CredentialsError> {
        let renewed_until = self.inner.time_source.now() + self.inner.renew_lifetime;
        {
            let mut state = self.inner.state.lock().unwrap();
            let entry = state.caches.get_mut(&self.name).ok_or_else(|| {
                CredentialsError::renewing(
                    RenewalPhase::LookupPrincipal,
                    format!("credential cache '{}' no longer exists", self.name),
                )
            })?;
            if !entry.renewable {
                return Err(CredentialsError::renewing(
                    RenewalPhase::ObtainCredentials,
                    "the stored credentials are not renewable",
                ));
            }
            entry.credentials = entry
                .credentials
                .iter()
                .map(|credential| {
                    if credential.is_config() {
                        credential.clone()
                    } else {
                        credential.with_end_time(renewed_until)
                    }
                })
                .collect();
        }
        self.notify_change();
        Ok(())
    }

    fn destroy(&self) -> Result<(), CredentialsError> {
        let removed = self
            .inner
            .state
            .lock()
            .unwrap()
            .caches
            .remove(&self.name)
            .is_some();
        if removed {
            self.notify_change();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CredentialCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use ticketd_async::test_util::TestClock;

    fn tgt(principal: &Principal, end_time: SystemTime) -> Credential {
        Credential::builder()
            .client(principal.clone())
            .server(Principal::ticket_granting_service(principal.realm()))
            .end_time(end_time)
            .build()
    }

    fn enumerate_names(collection: &SharedCacheCollection) -> Vec<String> {
        collection
            .enumerate()
            .unwrap()
            .map(|cache| cache.unwrap().name().unwrap())
            .collect()
    }

    #[test]
    fn enumeration_reflects_the_collection() {
        let store = MemoryCredentialStore::default();
        let collection = store.open_collection().unwrap();
        assert!(enumerate_names(&collection).is_empty());

        let alice = Principal::user("alice", "EXAMPLE.COM");
        store.put_cache("krb5cc_a", alice.clone(), vec![tgt(&alice, SystemTime::now())]);
        assert_eq!(enumerate_names(&collection), ["krb5cc_a"]);

        store.remove_cache("krb5cc_a");
        assert!(enumerate_names(&collection).is_empty());
    }

    #[test]
    fn watchers_see_changes_until_dropped() {
        let store = MemoryCredentialStore::default();
        let collection = store.open_collection().unwrap();
        let changes = Arc::new(AtomicUsize::new(0));
        let sink = {
            let changes = changes.clone();
            CollectionChangeSink::new(move || {
                changes.fetch_add(1, Ordering::SeqCst);
            })
        };
        let watcher = collection.watch(sink).unwrap();

        let alice = Principal::user("alice", "EXAMPLE.COM");
        store.put_cache("krb5cc_a", alice, Vec::new());
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        drop(watcher);
        store.remove_cache("krb5cc_a");
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn renew_extends_credential_end_times() {
        let clock = TestClock::new(SystemTime::UNIX_EPOCH);
        let store = MemoryCredentialStore::builder()
            .time_source(SharedTimeSource::new(clock.clone()))
            .renew_lifetime(Duration::from_secs(600))
            .build();
        let alice = Principal::user("alice", "EXAMPLE.COM");
        store.put_cache(
            "krb5cc_a",
            alice.clone(),
            vec![tgt(&alice, SystemTime::UNIX_EPOCH)],
        );

        let collection = store.open_collection().unwrap();
        let cache = collection.enumerate().unwrap().next().unwrap().unwrap();

        clock.set_time(SystemTime::UNIX_EPOCH + Duration::from_secs(100));
        cache.renew().unwrap();
        let credentials = cache.credentials().unwrap();
        assert_eq!(
            credentials[0].end_time(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(700)
        );
    }

    #[test]
    fn renew_reports_unrenewable_credentials() {
        let store = MemoryCredentialStore::default();
        let alice = Principal::user("alice", "EXAMPLE.COM");
        store.put_cache("krb5cc_a", alice.clone(), vec![tgt(&alice, SystemTime::now())]);
        store.set_renewable("krb5cc_a", false);

        let collection = store.open_collection().unwrap();
        let cache = collection.enumerate().unwrap().next().unwrap().unwrap();
        let err = cache.renew().unwrap_err();
        assert!(matches!(
            err,
            CredentialsError::Renewing {
                phase: RenewalPhase::ObtainCredentials,
                ..
            }
        ));
    }

    #[test]
    fn unwatchable_collections_fail_to_watch() {
        let store = MemoryCredentialStore::builder().unwatchable().build();
        let collection = store.open_collection().unwrap();
        let err = collection
            .watch(CollectionChangeSink::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, CredentialsError::Monitoring { .. }));
    }

    #[test]
    fn destroy_removes_the_cache_from_the_collection() {
        let store = MemoryCredentialStore::default();
        let alice = Principal::user("alice", "EXAMPLE.COM");
        store.put_cache("krb5cc_a", alice, Vec::new());

        let collection = store.open_collection().unwrap();
        let cache = collection.enumerate().unwrap().next().unwrap().unwrap();
        cache.destroy().unwrap();
        assert!(!store.contains_cache("krb5cc_a"));
        assert_eq!(cache.principal().unwrap(), None);
    }
}
