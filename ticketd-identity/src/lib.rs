/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

#![allow(clippy::derive_partial_eq_without_eq)]
#![warn(
    missing_docs,
    rustdoc::missing_crate_level_docs,
    unreachable_pub,
    rust_2018_idioms
)]

//! Kerberos-style identity tracking for the ticketd session service.
//!
//! The [`IdentityManager`] keeps a session's view of network-credential identities
//! consistent with an underlying credential store: it discovers identities from the
//! store's cache collection, tracks their validity against a clock, arms per-identity
//! alarms for expiration and pre-expiration renewal, serializes identity operations
//! through a single background worker, and emits structured change events.
//!
//! The concrete credential store is abstracted behind the capability surface in
//! [`ticketd_credentials`]; tests (and embedders that fabricate credentials) drive the
//! manager with the in-memory store from that crate's `test-util` feature.

pub mod event;
pub mod identity;
pub mod manager;
mod op;

pub use event::{IdentityManagerEvent, IdentitySignal};
pub use identity::KerberosIdentity;
pub use manager::{IdentityManager, IdentityManagerBuilder};
pub use op::IdentityList;
