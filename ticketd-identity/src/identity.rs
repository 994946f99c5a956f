/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! One tracked identity and its expiration/renewal alarms.

use crate::event::{IdentitySignal, SignalMessage};
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;
use ticketd_async::alarm::{Alarm, AlarmContext, AlarmEvent};
use ticketd_async::time::TimeSource;
use ticketd_credentials::cache::CredentialCache;
use ticketd_credentials::{CredentialsError, SharedCredentialCache};
use ticketd_credentials::error::RenewalPhase;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

pub(crate) type SignalSender = UnboundedSender<SignalMessage>;

/// Everything an identity needs from its manager: the alarm scheduling context and
/// the channel its signals are posted on.
#[derive(Clone, Debug)]
pub(crate) struct IdentityContext {
    pub(crate) alarm: AlarmContext,
    pub(crate) signals: SignalSender,
}

/// How far verification got with the credentials in the cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum VerificationLevel {
    /// No qualifying ticket-granting credentials exist.
    Unverified,
    /// Qualifying credentials exist but all of them are expired.
    Exists,
    /// At least one qualifying credential is unexpired.
    SignedIn,
}

struct IdentityState {
    cache: Option<SharedCredentialCache>,
    identifier: Option<String>,
    cached_principal_name: Option<String>,
    cached_realm_name: Option<String>,
    expiration_time: Option<SystemTime>,
    expiration_alarm_cancel: Option<CancellationToken>,
    renewal_alarm_cancel: Option<CancellationToken>,
}

/// One identity backed by a credential cache.
///
/// An identity wraps a cache handle, memoises the principal's canonical identifier and
/// display names, and tracks the expiration of the cache's ticket-granting credentials.
/// While its credentials exist, it keeps two alarms armed: one at the expiration
/// instant and one at the midpoint between now and expiration, for pre-expiration
/// renewal. Alarm wakeups are reported to the owning manager as signals.
///
/// Identities are handed to consumers as `Arc` handles. Their fields are only mutated
/// by the manager's worker, under an interior lock.
pub struct KerberosIdentity {
    context: IdentityContext,
    expiration_alarm: Alarm,
    renewal_alarm: Alarm,
    state: Mutex<IdentityState>,
}

impl Debug for KerberosIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("KerberosIdentity")
            .field("identifier", &state.identifier)
            .field("expiration_time", &state.expiration_time)
            .finish()
    }
}

enum AlarmRole {
    Expiration,
    Renewal,
}

impl KerberosIdentity {
    /// Builds an identity from a cache handle, verifying its credentials.
    ///
    /// Succeeds when the cache holds qualifying ticket-granting credentials, expired
    /// or not, and arms the expiration and renewal alarms. Fails when the cache has
    /// no usable identification or cannot be inspected.
    pub(crate) fn new(
        cache: SharedCredentialCache,
        context: IdentityContext,
    ) -> Result<Arc<Self>, CredentialsError> {
        let (expiration_alarm, expiration_events) = Alarm::new(context.alarm.clone());
        let (renewal_alarm, renewal_events) = Alarm::new(context.alarm.clone());
        let signals = context.signals.clone();

        let identity = Arc::new_cyclic(|weak: &Weak<KerberosIdentity>| {
            tokio::spawn(forward_alarm_events(
                weak.clone(),
                expiration_events,
                signals.clone(),
                AlarmRole::Expiration,
            ));
            tokio::spawn(forward_alarm_events(
                weak.clone(),
                renewal_events,
                signals,
                AlarmRole::Renewal,
            ));
            KerberosIdentity {
                context,
                expiration_alarm,
                renewal_alarm,
                state: Mutex::new(IdentityState {
                    cache: Some(cache),
                    identifier: None,
                    cached_principal_name: None,
                    cached_realm_name: None,
                    expiration_time: None,
                    expiration_alarm_cancel: None,
                    renewal_alarm_cancel: None,
                }),
            }
        });

        identity.initialize()?;
        Ok(identity)
    }

    fn initialize(&self) -> Result<(), CredentialsError> {
        let mut state = self.state.lock().unwrap();
        self.refresh_names(&mut state);
        let level = self.verify(&mut state)?;
        match level {
            VerificationLevel::SignedIn | VerificationLevel::Exists => {
                self.set_expiration_and_renewal_alarms(&mut state);
                Ok(())
            }
            VerificationLevel::Unverified => {
                let name = state.cache.as_ref().and_then(|cache| cache.name());
                Err(match name {
                    Some(name) => CredentialsError::verifying(format!(
                        "no associated identification found for credentials cache '{name}'"
                    )),
                    None => CredentialsError::verifying("no associated identification found"),
                })
            }
        }
    }

    /// Stable canonical principal string, or `None` when the cache has no principal.
    pub fn identifier(&self) -> Option<String> {
        self.state.lock().unwrap().identifier.clone()
    }

    /// Display form of the principal name.
    pub fn principal_name(&self) -> Option<String> {
        self.state.lock().unwrap().cached_principal_name.clone()
    }

    /// The principal's realm name.
    pub fn realm_name(&self) -> Option<String> {
        self.state.lock().unwrap().cached_realm_name.clone()
    }

    /// The latest end time seen among the cache's ticket-granting credentials.
    ///
    /// Monotonically non-decreasing across updates of the same identity handle.
    pub fn expiration_time(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().expiration_time
    }

    /// True iff the cache currently holds an unexpired qualifying ticket-granting
    /// credential. Runs verification against the clock.
    pub fn is_signed_in(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        matches!(self.verify(&mut state), Ok(VerificationLevel::SignedIn))
    }

    /// Scans the cache's credentials, advancing `expiration_time` over every
    /// qualifying ticket-granting credential seen.
    fn verify(&self, state: &mut IdentityState) -> Result<VerificationLevel, CredentialsError> {
        let Some(cache) = state.cache.clone() else {
            return Ok(VerificationLevel::Unverified);
        };
        let Some(principal) = cache.principal()? else {
            return Ok(VerificationLevel::Unverified);
        };
        let credentials = cache.credentials()?;
        let now = self.context.alarm.time_source().now();

        let mut level = VerificationLevel::Unverified;
        for credential in &credentials {
            if !credential.is_ticket_granting_for(&principal) {
                continue;
            }
            let end_time = credential.end_time();
            state.expiration_time = Some(match state.expiration_time {
                Some(current) => current.max(end_time),
                None => end_time,
            });
            if end_time > now {
                tracing::trace!("credentials good");
                level = VerificationLevel::SignedIn;
            } else if level != VerificationLevel::SignedIn {
                tracing::trace!("credentials expired");
                level = VerificationLevel::Exists;
            }
        }
        Ok(level)
    }

    /// Recomputes the memoised identifier and display names from the cache.
    fn refresh_names(&self, state: &mut IdentityState) {
        let principal = match state.cache.as_ref().map(|cache| cache.principal()) {
            Some(Ok(principal)) => principal,
            Some(Err(err)) => {
                tracing::warn!(
                    err = %err,
                    "error looking up principal identity in credential cache"
                );
                None
            }
            None => None,
        };
        let identifier = principal.as_ref().map(|principal| principal.name());
        if state.identifier != identifier {
            state.identifier = identifier;
        }
        state.cached_principal_name = principal.as_ref().map(|p| p.display_name());
        state.cached_realm_name = principal.as_ref().map(|p| p.realm().to_string());
    }

    /// Replaces the underlying cache with `new_identity`'s, cancels both alarms,
    /// recomputes names, re-verifies, and re-arms the alarms when credentials exist.
    pub(crate) fn update(&self, new_identity: &KerberosIdentity) {
        let new_cache = new_identity.state.lock().unwrap().cache.clone();

        let mut state = self.state.lock().unwrap();
        state.cache = new_cache;

        if let Some(token) = state.renewal_alarm_cancel.take() {
            if !token.is_cancelled() {
                token.cancel();
            }
        }
        if let Some(token) = state.expiration_alarm_cancel.take() {
            if !token.is_cancelled() {
                token.cancel();
            }
        }

        self.refresh_names(&mut state);

        let level = self.verify(&mut state).unwrap_or(VerificationLevel::Unverified);
        if matches!(
            level,
            VerificationLevel::SignedIn | VerificationLevel::Exists
        ) {
            self.set_expiration_and_renewal_alarms(&mut state);
        }
    }

    /// Arms the expiration alarm at `expiration_time` and the renewal alarm at the
    /// midpoint between now and expiration. Both alarms get fresh cancellation
    /// tokens, so arming is idempotent and race-free against the worker.
    fn set_expiration_and_renewal_alarms(&self, state: &mut IdentityState) {
        let Some(expiration_time) = state.expiration_time else {
            return;
        };
        let now = self.context.alarm.time_source().now();
        let renewal_time = match expiration_time.duration_since(now) {
            Ok(until_expiration) => expiration_time - until_expiration / 2,
            Err(elapsed) => expiration_time + elapsed.duration() / 2,
        };

        let expiration_cancel = CancellationToken::new();
        self.expiration_alarm
            .set(expiration_time, expiration_cancel.clone());
        state.expiration_alarm_cancel = Some(expiration_cancel);

        let renewal_cancel = CancellationToken::new();
        self.renewal_alarm.set(renewal_time, renewal_cancel.clone());
        state.renewal_alarm_cancel = Some(renewal_cancel);
    }

    /// Renews the cache's credentials through the store.
    pub(crate) fn renew(&self) -> Result<(), CredentialsError> {
        let (cache, name) = {
            let state = self.state.lock().unwrap();
            (state.cache.clone(), state.cached_principal_name.clone())
        };
        let Some(cache) = cache else {
            return Err(CredentialsError::renewing(
                RenewalPhase::LookupPrincipal,
                "not signed in",
            ));
        };
        match cache.renew() {
            Ok(()) => {
                tracing::debug!(identity = name.as_deref().unwrap_or("<unnamed>"), "identity renewed");
                Ok(())
            }
            Err(err) => Err(match name {
                Some(name) => err.with_principal(name),
                None => err,
            }),
        }
    }

    /// Erases the cache, signing the identity out.
    pub(crate) fn erase(&self) -> Result<(), CredentialsError> {
        let cache = self.state.lock().unwrap().cache.take();
        match cache {
            None => Ok(()),
            Some(cache) => cache.destroy(),
        }
    }
}

/// Translates alarm wakeups into per-identity signals.
///
/// Current policy reports every wakeup as a refresh request; the expired/unexpired/
/// needs-renewal kinds stay reserved for per-identity verification at the alarm site.
async fn forward_alarm_events(
    identity: Weak<KerberosIdentity>,
    mut events: UnboundedReceiver<AlarmEvent>,
    signals: SignalSender,
    role: AlarmRole,
) {
    while let Some(event) = events.recv().await {
        if identity.strong_count() == 0 {
            break;
        }
        let signal = match (&role, event) {
            (AlarmRole::Expiration, AlarmEvent::Fired)
            | (AlarmRole::Expiration, AlarmEvent::Rearmed) => Some(IdentitySignal::NeedsRefresh),
            (AlarmRole::Renewal, AlarmEvent::Fired) => {
                tracing::debug!("renewal alarm fired");
                Some(IdentitySignal::NeedsRefresh)
            }
            (AlarmRole::Renewal, AlarmEvent::Rearmed) => None,
        };
        if let Some(signal) = signal {
            let message = SignalMessage {
                identity: identity.clone(),
                signal,
            };
            if signals.send(message).is_err() {
                break;
            }
        }
    }
}
