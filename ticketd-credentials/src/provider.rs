/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! The credential store capability surface.
//!
//! Everything the identity tracking machinery knows about the backing credential
//! library is expressed through these traits: open the cache collection, enumerate
//! its caches, and watch it for changes. Inspection and mutation of individual
//! caches goes through [`CredentialCache`](crate::cache::CredentialCache).

use crate::cache::SharedCredentialCache;
use crate::error::CredentialsError;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// Callback invoked by a store whenever its cache collection changes.
#[derive(Clone)]
pub struct CollectionChangeSink(Arc<dyn Fn() + Send + Sync>);

impl CollectionChangeSink {
    /// Creates a sink from a callback.
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(callback))
    }

    /// Reports a change to the collection.
    pub fn notify(&self) {
        (self.0)()
    }
}

impl Debug for CollectionChangeSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionChangeSink").finish()
    }
}

/// An installed watch over a cache collection.
///
/// Dropping the watcher releases the watch; no further notifications are delivered.
pub trait CollectionWatcher: Send + Sync + Debug {}

/// Lazy, finite, non-restartable sequence of cache handles.
///
/// Individual steps may surface transient errors; callers log and skip those steps.
pub type CacheIter<'a> =
    Box<dyn Iterator<Item = Result<SharedCredentialCache, CredentialsError>> + Send + 'a>;

/// An open credential cache collection.
pub trait CacheCollection: Send + Sync + Debug {
    /// Enumerates the caches currently in the collection.
    ///
    /// An error here abandons the enumeration as a whole; per-step errors are
    /// reported through the iterator items instead.
    fn enumerate(&self) -> Result<CacheIter<'_>, CredentialsError>;

    /// Starts watching the collection, invoking `sink` on any change.
    ///
    /// Stores that cannot watch their collection kind fail with a
    /// [`CredentialsError::Monitoring`] error naming the kind.
    fn watch(&self, sink: CollectionChangeSink)
        -> Result<Box<dyn CollectionWatcher>, CredentialsError>;
}

/// Cache collection wrapper that may be shared.
#[derive(Clone, Debug)]
pub struct SharedCacheCollection(Arc<dyn CacheCollection>);

impl SharedCacheCollection {
    /// Create a new `SharedCacheCollection` from a [`CacheCollection`].
    pub fn new(collection: impl CacheCollection + 'static) -> Self {
        Self(Arc::new(collection))
    }
}

impl AsRef<dyn CacheCollection> for SharedCacheCollection {
    fn as_ref(&self) -> &(dyn CacheCollection + 'static) {
        self.0.as_ref()
    }
}

impl From<Arc<dyn CacheCollection>> for SharedCacheCollection {
    fn from(collection: Arc<dyn CacheCollection>) -> Self {
        SharedCacheCollection(collection)
    }
}

impl CacheCollection for SharedCacheCollection {
    fn enumerate(&self) -> Result<CacheIter<'_>, CredentialsError> {
        self.0.enumerate()
    }

    fn watch(
        &self,
        sink: CollectionChangeSink,
    ) -> Result<Box<dyn CollectionWatcher>, CredentialsError> {
        self.0.watch(sink)
    }
}

/// Credential store entry point: opens the cache collection.
pub trait ProvideCaches: Send + Sync + Debug {
    /// Opens the store's cache collection. Failure here is fatal for manager start.
    fn open_collection(&self) -> Result<SharedCacheCollection, CredentialsError>;
}

/// Credential store wrapper that may be shared.
#[derive(Clone, Debug)]
pub struct SharedCacheProvider(Arc<dyn ProvideCaches>);

impl SharedCacheProvider {
    /// Create a new `SharedCacheProvider` from a [`ProvideCaches`].
    pub fn new(provider: impl ProvideCaches + 'static) -> Self {
        Self(Arc::new(provider))
    }
}

impl AsRef<dyn ProvideCaches> for SharedCacheProvider {
    fn as_ref(&self) -> &(dyn ProvideCaches + 'static) {
        self.0.as_ref()
    }
}

impl From<Arc<dyn ProvideCaches>> for SharedCacheProvider {
    fn from(provider: Arc<dyn ProvideCaches>) -> Self {
        SharedCacheProvider(provider)
    }
}

impl ProvideCaches for SharedCacheProvider {
    fn open_collection(&self) -> Result<SharedCacheCollection, CredentialsError> {
        self.0.open_collection()
    }
}
