/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Signal kinds emitted by identities and the manager.

use crate::identity::KerberosIdentity;
use std::sync::{Arc, Weak};

/// Collection-level events delivered to [`IdentityManager`](crate::IdentityManager)
/// subscribers.
///
/// Events carry a reference-counted handle to the identity they concern. They are
/// delivered in the order the manager's worker emitted them.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum IdentityManagerEvent {
    /// An identity appeared in the credential cache collection.
    Added(Arc<KerberosIdentity>),
    /// An identity disappeared from the credential cache collection.
    Removed(Arc<KerberosIdentity>),
    /// A previously expired identity is signed in again after an update.
    Renewed(Arc<KerberosIdentity>),
    /// The identity's display name changed; query
    /// [`name_identity`](crate::IdentityManager::name_identity) for the new name.
    Renamed(Arc<KerberosIdentity>),
    /// An identity's credentials expired.
    Expired(Arc<KerberosIdentity>),
}

impl IdentityManagerEvent {
    /// The identity the event concerns.
    pub fn identity(&self) -> &Arc<KerberosIdentity> {
        match self {
            Self::Added(identity)
            | Self::Removed(identity)
            | Self::Renewed(identity)
            | Self::Renamed(identity)
            | Self::Expired(identity) => identity,
        }
    }
}

/// Per-identity signal kinds an identity reports to its manager.
///
/// Current policy emits only [`IdentitySignal::NeedsRefresh`] from alarm wakeups;
/// the finer-grained kinds are reserved for a policy that performs per-identity
/// verification at the alarm site. The manager handles all four.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IdentitySignal {
    /// The identity's credentials were verified as expired.
    Expired,
    /// The identity's credentials were verified as valid again after expiring.
    Unexpired,
    /// The identity is close enough to expiration that it should be renewed.
    NeedsRenewal,
    /// The identity's state may be stale and a collection refresh should run.
    NeedsRefresh,
}

/// A signal in flight from an identity to the manager's signal pump.
#[derive(Debug)]
pub(crate) struct SignalMessage {
    pub(crate) identity: Weak<KerberosIdentity>,
    pub(crate) signal: IdentitySignal,
}
