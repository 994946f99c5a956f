/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Principal names.

use std::fmt;

/// First component of a ticket-granting service principal.
pub const TICKET_GRANTING_SERVICE: &str = "krbtgt";

/// Pseudo-realm used by caches to store configuration entries that are not credentials.
pub const CONFIG_REALM: &str = "X-CACHECONF:";

/// A named entity within a realm.
///
/// A principal has one or more name components and a realm. It renders to two string
/// forms: the canonical form ([`Principal::name`]), where separator characters occurring
/// inside components are escaped and which is therefore stable enough to use as an
/// identifier, and the display form ([`Principal::display_name`]), which leaves
/// components bare.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Principal {
    components: Vec<String>,
    realm: String,
}

impl Principal {
    /// Creates a principal from name components and a realm.
    pub fn new(
        components: impl IntoIterator<Item = impl Into<String>>,
        realm: impl Into<String>,
    ) -> Self {
        Self {
            components: components.into_iter().map(Into::into).collect(),
            realm: realm.into(),
        }
    }

    /// Creates a single-component user principal, `name@REALM`.
    pub fn user(name: impl Into<String>, realm: impl Into<String>) -> Self {
        Self::new([name.into()], realm)
    }

    /// Creates the ticket-granting service principal for `realm`, `krbtgt/REALM@REALM`.
    pub fn ticket_granting_service(realm: impl Into<String>) -> Self {
        let realm = realm.into();
        Self::new([TICKET_GRANTING_SERVICE.to_string(), realm.clone()], realm)
    }

    /// Returns the name components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Returns the realm.
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// True if this principal and `other` belong to the same realm.
    pub fn realm_matches(&self, other: &Principal) -> bool {
        self.realm == other.realm
    }

    /// True for configuration pseudo-principals, which are not credentials.
    pub fn is_config(&self) -> bool {
        self.realm == CONFIG_REALM
    }

    /// Canonical form: components joined with `/`, then `@` and the realm, with
    /// `\`, `/` and `@` occurring inside components escaped by a backslash.
    pub fn name(&self) -> String {
        let mut out = String::new();
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            escape_into(component, true, &mut out);
        }
        out.push('@');
        escape_into(&self.realm, false, &mut out);
        out
    }

    /// Display form: like [`Principal::name`] but without any escaping.
    pub fn display_name(&self) -> String {
        let mut out = self.components.join("/");
        out.push('@');
        out.push_str(&self.realm);
        out
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

fn escape_into(raw: &str, escape_slash: bool, out: &mut String) {
    for c in raw.chars() {
        match c {
            '\\' | '@' => {
                out.push('\\');
                out.push(c);
            }
            '/' if escape_slash => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_and_display_forms() {
        let principal = Principal::user("alice", "EXAMPLE.COM");
        assert_eq!(principal.name(), "alice@EXAMPLE.COM");
        assert_eq!(principal.display_name(), "alice@EXAMPLE.COM");

        let service = Principal::new(["ldap", "host.example.com"], "EXAMPLE.COM");
        assert_eq!(service.name(), "ldap/host.example.com@EXAMPLE.COM");
    }

    #[test]
    fn canonical_form_escapes_separators() {
        let odd = Principal::user("a@b/c", "EXAMPLE.COM");
        assert_eq!(odd.name(), r"a\@b\/c@EXAMPLE.COM");
        assert_eq!(odd.display_name(), "a@b/c@EXAMPLE.COM");
    }

    #[test]
    fn ticket_granting_service_shape() {
        let tgs = Principal::ticket_granting_service("EXAMPLE.COM");
        assert_eq!(tgs.components(), ["krbtgt", "EXAMPLE.COM"]);
        assert_eq!(tgs.realm(), "EXAMPLE.COM");
        assert_eq!(tgs.name(), "krbtgt/EXAMPLE.COM@EXAMPLE.COM");
    }

    #[test]
    fn config_pseudo_principals() {
        let config = Principal::new(["krb5_ccache_conf_data", "pa_type"], CONFIG_REALM);
        assert!(config.is_config());
        assert!(!Principal::user("alice", "EXAMPLE.COM").is_config());
    }
}
