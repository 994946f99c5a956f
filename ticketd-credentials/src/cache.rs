/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Credential cache handles.

use crate::credential::Credential;
use crate::error::CredentialsError;
use crate::principal::Principal;
use std::fmt::Debug;
use std::sync::Arc;

/// A handle onto one credential cache within a store's collection.
///
/// Handles are cheap to clone through [`SharedCredentialCache`] and stay valid across
/// changes to the underlying cache; operations read whatever the cache currently holds.
pub trait CredentialCache: Send + Sync + Debug {
    /// Name of the underlying cache, when the store exposes one. Used for diagnostics.
    fn name(&self) -> Option<String>;

    /// The default principal associated with the cache, or `None` when the cache has none.
    fn principal(&self) -> Result<Option<Principal>, CredentialsError>;

    /// All credentials currently stored in the cache, configuration entries included.
    fn credentials(&self) -> Result<Vec<Credential>, CredentialsError>;

    /// Replaces the cache's contents with freshly renewed credentials, atomically from
    /// the caller's point of view.
    fn renew(&self) -> Result<(), CredentialsError>;

    /// Erases the cache from the collection.
    fn destroy(&self) -> Result<(), CredentialsError>;
}

/// Credential cache handle wrapper that may be shared.
///
/// Newtype wrapper around [`CredentialCache`] that implements `Clone` using an
/// internal `Arc`.
#[derive(Clone, Debug)]
pub struct SharedCredentialCache(Arc<dyn CredentialCache>);

impl SharedCredentialCache {
    /// Create a new `SharedCredentialCache` from a [`CredentialCache`].
    ///
    /// The given cache will be wrapped in an internal `Arc`. If your cache is already
    /// in an `Arc`, use `SharedCredentialCache::from(cache)` instead.
    pub fn new(cache: impl CredentialCache + 'static) -> Self {
        Self(Arc::new(cache))
    }
}

impl AsRef<dyn CredentialCache> for SharedCredentialCache {
    fn as_ref(&self) -> &(dyn CredentialCache + 'static) {
        self.0.as_ref()
    }
}

impl From<Arc<dyn CredentialCache>> for SharedCredentialCache {
    fn from(cache: Arc<dyn CredentialCache>) -> Self {
        SharedCredentialCache(cache)
    }
}

impl CredentialCache for SharedCredentialCache {
    fn name(&self) -> Option<String> {
        self.0.name()
    }

    fn principal(&self) -> Result<Option<Principal>, CredentialsError> {
        self.0.principal()
    }

    fn credentials(&self) -> Result<Vec<Credential>, CredentialsError> {
        self.0.credentials()
    }

    fn renew(&self) -> Result<(), CredentialsError> {
        self.0.renew()
    }

    fn destroy(&self) -> Result<(), CredentialsError> {
        self.0.destroy()
    }
}
