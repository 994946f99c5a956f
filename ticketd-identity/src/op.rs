/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Typed operation records consumed by the manager's worker, and the backpressure
//! gate that holds refreshes while a list result is still held by a caller.

use crate::identity::KerberosIdentity;
use std::fmt::{self, Debug, Formatter};
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use ticketd_credentials::CredentialsError;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// An operation's cancellation token together with its ownership.
///
/// Tokens the manager created itself are owned and get cancelled when the manager
/// shuts down with the operation still queued; caller-provided tokens are only ever
/// observed, never cancelled.
#[derive(Debug)]
pub(crate) struct OperationToken {
    token: CancellationToken,
    owned: bool,
}

impl OperationToken {
    /// A fresh, manager-owned token.
    pub(crate) fn fresh() -> Self {
        Self {
            token: CancellationToken::new(),
            owned: true,
        }
    }

    /// Wraps a caller-provided token, creating a fresh owned one when absent.
    pub(crate) fn from_caller(token: Option<CancellationToken>) -> Self {
        match token {
            Some(token) => Self {
                token,
                owned: false,
            },
            None => Self::fresh(),
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the token if the manager owns it.
    pub(crate) fn cancel_if_owned(&self) {
        if self.owned && !self.token.is_cancelled() {
            self.token.cancel();
        }
    }
}

/// One queued unit of work for the manager's worker.
#[derive(Debug)]
pub(crate) enum Operation {
    /// Re-enumerate the cache collection and diff it against the identity set.
    Refresh { cancel: OperationToken },
    /// Produce a sorted snapshot of the identity set.
    List {
        cancel: OperationToken,
        respond_to: oneshot::Sender<Result<IdentityList, CredentialsError>>,
    },
    /// Renew one identity's credentials.
    Renew {
        identity: Arc<KerberosIdentity>,
        cancel: OperationToken,
        respond_to: oneshot::Sender<Result<(), CredentialsError>>,
    },
    /// Erase one identity's credential cache.
    SignOut {
        identity: Arc<KerberosIdentity>,
        cancel: OperationToken,
        respond_to: oneshot::Sender<Result<(), CredentialsError>>,
    },
}

impl Operation {
    /// Renew and sign-out pass the list backpressure gate; refreshes and further
    /// lists are held behind it.
    pub(crate) fn bypasses_gate(&self) -> bool {
        matches!(self, Self::Renew { .. } | Self::SignOut { .. })
    }

    /// True if the operation's token tripped before the worker started it.
    pub(crate) fn cancelled_before_start(&self) -> bool {
        match self {
            Self::Refresh { .. } => false,
            Self::List { cancel, .. } | Self::Renew { cancel, .. } | Self::SignOut { cancel, .. } => {
                cancel.is_cancelled()
            }
        }
    }

    /// Completes the operation's sink, if any, with a cancellation error.
    pub(crate) fn complete_cancelled(self) {
        match self {
            Self::Refresh { .. } => {}
            Self::List { respond_to, .. } => {
                let _ = respond_to.send(Err(CredentialsError::Cancelled));
            }
            Self::Renew { respond_to, .. } | Self::SignOut { respond_to, .. } => {
                let _ = respond_to.send(Err(CredentialsError::Cancelled));
            }
        }
    }

    /// Shutdown-drain treatment: cancel owned tokens, then complete with a
    /// cancellation error.
    pub(crate) fn cancel_and_complete(self) {
        match &self {
            Self::Refresh { cancel }
            | Self::List { cancel, .. }
            | Self::Renew { cancel, .. }
            | Self::SignOut { cancel, .. } => cancel.cancel_if_owned(),
        }
        self.complete_cancelled();
    }
}

#[derive(Default)]
struct GateInner {
    blocked: Mutex<bool>,
    notify: Notify,
}

/// The worker-side wait that suspends refreshes while a list result is still held.
#[derive(Clone, Default)]
pub(crate) struct ListGate {
    inner: Arc<GateInner>,
}

impl ListGate {
    /// Blocks the gate, returning the guard whose drop reopens it.
    pub(crate) fn block(&self) -> ListGuard {
        *self.inner.blocked.lock().unwrap() = true;
        ListGuard {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn is_blocked(&self) -> bool {
        *self.inner.blocked.lock().unwrap()
    }

    /// Resolves once the gate is open.
    pub(crate) async fn unblocked(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if !self.is_blocked() {
                return;
            }
            notified.await;
        }
    }
}

impl Debug for ListGate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListGate")
            .field("blocked", &self.is_blocked())
            .finish()
    }
}

/// Reopens the gate when the list result holding it is released.
pub(crate) struct ListGuard {
    inner: Arc<GateInner>,
}

impl Drop for ListGuard {
    fn drop(&mut self) {
        *self.inner.blocked.lock().unwrap() = false;
        self.inner.notify.notify_waiters();
    }
}

/// Result of [`list_identities`](crate::IdentityManager::list_identities): identity
/// handles sorted by identifier.
///
/// While an `IdentityList` is alive, the manager's worker holds back refreshes so no
/// added/removed events race against the caller still reading the snapshot. Drop the
/// list to let refreshes resume.
pub struct IdentityList {
    identities: Vec<Arc<KerberosIdentity>>,
    _guard: ListGuard,
}

impl IdentityList {
    pub(crate) fn new(identities: Vec<Arc<KerberosIdentity>>, guard: ListGuard) -> Self {
        Self {
            identities,
            _guard: guard,
        }
    }
}

impl Deref for IdentityList {
    type Target = [Arc<KerberosIdentity>];

    fn deref(&self) -> &Self::Target {
        &self.identities
    }
}

impl Debug for IdentityList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.identities.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gate_reopens_when_guard_drops() {
        let gate = ListGate::default();
        assert!(!gate.is_blocked());
        gate.unblocked().await;

        let guard = gate.block();
        assert!(gate.is_blocked());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.unblocked().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        assert!(!gate.is_blocked());
    }

    #[test]
    fn only_self_created_tokens_are_cancelled() {
        let callers = CancellationToken::new();
        let provided = OperationToken::from_caller(Some(callers.clone()));
        provided.cancel_if_owned();
        assert!(!callers.is_cancelled());

        let owned = OperationToken::fresh();
        let watch = owned.token.clone();
        owned.cancel_if_owned();
        assert!(watch.is_cancelled());
    }
}
