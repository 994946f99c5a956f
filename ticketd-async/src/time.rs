/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Wall-clock readings, abstracted so identity validity and alarm scheduling can be
//! judged against substitute clocks in tests.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::SystemTime;

/// Produces the current wall-clock time.
pub trait TimeSource: Debug + Send + Sync {
    /// Returns the current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// The system clock.
#[non_exhaustive]
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Shareable handle to a [`TimeSource`] implementation.
#[derive(Clone, Debug)]
pub struct SharedTimeSource(Arc<dyn TimeSource>);

impl SharedTimeSource {
    /// Wraps `time_source` in a shareable handle.
    pub fn new(time_source: impl TimeSource + 'static) -> Self {
        Self(Arc::new(time_source))
    }
}

impl Default for SharedTimeSource {
    fn default() -> Self {
        Self::new(SystemTimeSource)
    }
}

impl TimeSource for SharedTimeSource {
    fn now(&self) -> SystemTime {
        self.0.now()
    }
}
