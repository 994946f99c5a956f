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

//! Clocks, sleeping, and wall-clock alarms for ticketd.
//!
//! Runtime and clock specifics live behind small traits so the identity tracking
//! machinery can be driven by substitute time in tests; tokio implementations are
//! gated behind the `rt-tokio` feature.
//!
//! This crate also hosts the wall-clock [`Alarm`](crate::alarm::Alarm) used by the
//! identity tracking machinery: a one-shot timer pinned to an absolute wall-clock
//! instant that detects backward clock jumps and re-arms.

#[cfg(feature = "rt-tokio")]
pub mod alarm;
pub mod sleep;
#[cfg(any(feature = "test-util", test))]
pub mod test_util;
pub mod time;
