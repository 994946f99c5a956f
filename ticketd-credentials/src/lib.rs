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

//! Credential cache types for the ticketd session service.
//!
//! This crate defines the data model shared by identity tracking components (principals,
//! stored credentials, and credential caches) together with the narrow capability surface
//! a credential store has to provide: enumerating the cache collection, inspecting,
//! renewing and destroying individual caches, and watching the collection for changes.
//!
//! A concrete store backed by a real credential library lives outside this crate; the
//! [`MemoryCredentialStore`](crate::memory::MemoryCredentialStore) provided behind the
//! `test-util` feature implements the full surface in memory and drives the test suites
//! of everything downstream.

pub mod cache;
pub mod credential;
pub mod error;
#[cfg(any(feature = "test-util", test))]
pub mod memory;
pub mod principal;
pub mod provider;

pub use cache::{CredentialCache, SharedCredentialCache};
pub use credential::Credential;
pub use error::CredentialsError;
pub use principal::Principal;
