/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Stored credentials.

use crate::principal::{Principal, TICKET_GRANTING_SERVICE};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::SystemTime;
use zeroize::Zeroizing;

/// One credential held by a credential cache.
///
/// A credential binds a client principal to a server principal with a validity end
/// time and an opaque ticket payload. When a `Credential` is dropped its ticket bytes
/// are zeroed in memory; `Credential` uses an interior `Arc` so that even when cloned
/// the payload does not exist in multiple memory locations.
#[derive(Clone, Eq, PartialEq)]
pub struct Credential(Arc<Inner>);

#[derive(Eq, PartialEq)]
struct Inner {
    client: Principal,
    server: Principal,

    /// Wall-clock instant after which the credential is no longer valid.
    end_time: SystemTime,

    ticket: Zeroizing<Vec<u8>>,
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("client", &self.0.client.display_name())
            .field("server", &self.0.server.display_name())
            .field("end_time", &self.0.end_time)
            .field("ticket", &"** redacted **")
            .finish()
    }
}

impl Credential {
    /// Returns a builder for `Credential`.
    pub fn builder() -> CredentialBuilder {
        CredentialBuilder::default()
    }

    /// The client principal the credential was issued to.
    pub fn client(&self) -> &Principal {
        &self.0.client
    }

    /// The server principal the credential is for.
    pub fn server(&self) -> &Principal {
        &self.0.server
    }

    /// Wall-clock instant after which the credential is no longer valid.
    pub fn end_time(&self) -> SystemTime {
        self.0.end_time
    }

    /// True for cache configuration entries, which are not real credentials.
    pub fn is_config(&self) -> bool {
        self.0.server.is_config()
    }

    /// True if this credential is a ticket-granting ticket usable by `principal`
    /// in its own realm.
    ///
    /// The server must be the two-component `krbtgt/REALM` service of the principal's
    /// realm, in the principal's realm, and the entry must not be a configuration entry.
    pub fn is_ticket_granting_for(&self, principal: &Principal) -> bool {
        let server = &self.0.server;
        if self.is_config() {
            return false;
        }
        // Looking for the krbtgt / REALM pair, so it should be exactly 2 components.
        if server.components().len() != 2 {
            return false;
        }
        if !server.realm_matches(principal) {
            return false;
        }
        if server.components()[0] != TICKET_GRANTING_SERVICE {
            return false;
        }
        if server.components()[1] != principal.realm() {
            return false;
        }
        true
    }

    /// Returns a copy of this credential with a new validity end time, as produced
    /// by a renewal.
    pub fn with_end_time(&self, end_time: SystemTime) -> Credential {
        Credential(Arc::new(Inner {
            client: self.0.client.clone(),
            server: self.0.server.clone(),
            end_time,
            ticket: self.0.ticket.clone(),
        }))
    }
}

/// Builder for [`Credential`].
#[derive(Default)]
pub struct CredentialBuilder {
    client: Option<Principal>,
    server: Option<Principal>,
    end_time: Option<SystemTime>,
    ticket: Option<Vec<u8>>,
}

impl CredentialBuilder {
    /// Sets the client principal. Required.
    pub fn client(mut self, client: Principal) -> Self {
        self.client = Some(client);
        self
    }

    /// Sets the server principal. Required.
    pub fn server(mut self, server: Principal) -> Self {
        self.server = Some(server);
        self
    }

    /// Sets the validity end time. Required.
    pub fn end_time(mut self, end_time: SystemTime) -> Self {
        self.end_time = Some(end_time);
        self
    }

    /// Sets the opaque ticket payload.
    pub fn ticket(mut self, ticket: impl Into<Vec<u8>>) -> Self {
        self.ticket = Some(ticket.into());
        self
    }

    /// Builds the [`Credential`].
    ///
    /// # Panics
    ///
    /// Panics if `client`, `server`, or `end_time` were not set.
    pub fn build(self) -> Credential {
        Credential(Arc::new(Inner {
            client: self.client.expect("client is required"),
            server: self.server.expect("server is required"),
            end_time: self.end_time.expect("end_time is required"),
            ticket: Zeroizing::new(self.ticket.unwrap_or_default()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::CONFIG_REALM;
    use std::time::Duration;

    fn tgt(client: &Principal) -> Credential {
        Credential::builder()
            .client(client.clone())
            .server(Principal::ticket_granting_service(client.realm()))
            .end_time(SystemTime::UNIX_EPOCH + Duration::from_secs(1000))
            .build()
    }

    #[test]
    fn recognizes_ticket_granting_tickets() {
        let alice = Principal::user("alice", "EXAMPLE.COM");
        assert!(tgt(&alice).is_ticket_granting_for(&alice));
    }

    #[test]
    fn rejects_foreign_realm_tickets() {
        let alice = Principal::user("alice", "EXAMPLE.COM");
        let cross = Credential::builder()
            .client(alice.clone())
            .server(Principal::new(
                [TICKET_GRANTING_SERVICE, "OTHER.ORG"],
                "OTHER.ORG",
            ))
            .end_time(SystemTime::UNIX_EPOCH + Duration::from_secs(1000))
            .build();
        assert!(!cross.is_ticket_granting_for(&alice));

        // Referral-style entry: ticket for another realm stored under ours.
        let referral = Credential::builder()
            .client(alice.clone())
            .server(Principal::new(
                [TICKET_GRANTING_SERVICE, "OTHER.ORG"],
                "EXAMPLE.COM",
            ))
            .end_time(SystemTime::UNIX_EPOCH + Duration::from_secs(1000))
            .build();
        assert!(!referral.is_ticket_granting_for(&alice));
    }

    #[test]
    fn rejects_service_tickets_and_config_entries() {
        let alice = Principal::user("alice", "EXAMPLE.COM");
        let service = Credential::builder()
            .client(alice.clone())
            .server(Principal::new(["ldap", "host", "extra"], "EXAMPLE.COM"))
            .end_time(SystemTime::UNIX_EPOCH + Duration::from_secs(1000))
            .build();
        assert!(!service.is_ticket_granting_for(&alice));

        let config = Credential::builder()
            .client(alice.clone())
            .server(Principal::new(
                ["krb5_ccache_conf_data", "pa_type"],
                CONFIG_REALM,
            ))
            .end_time(SystemTime::UNIX_EPOCH)
            .build();
        assert!(!config.is_ticket_granting_for(&alice));
    }

    #[test]
    fn debug_redacts_ticket_payload() {
        let alice = Principal::user("alice", "EXAMPLE.COM");
        let credential = Credential::builder()
            .client(alice.clone())
            .server(Principal::ticket_granting_service("EXAMPLE.COM"))
            .end_time(SystemTime::UNIX_EPOCH)
            .ticket(b"super secret".to_vec())
            .build();
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("** redacted **"));
        assert!(!rendered.contains("super secret"));
    }
}
