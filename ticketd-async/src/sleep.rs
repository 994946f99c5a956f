/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! Sleeping, abstracted so alarm polling can run against substitute clocks.
//!
//! The polled mode of [`Alarm`](crate::alarm::Alarm) waits out its intervals through
//! an [`AsyncSleep`], letting tests pair it with a matching test time source.
//! [`TokioSleep`] is the production implementation.

use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Produces futures that resolve after a span of time.
pub trait AsyncSleep: Debug + Send + Sync {
    /// Returns a future that resolves once `duration` has elapsed.
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// Future returned by [`AsyncSleep::sleep`].
#[must_use]
pub struct Sleep(Pin<Box<dyn Future<Output = ()> + Send>>);

impl Sleep {
    /// Boxes `future` up as a sleep.
    pub fn new(future: impl Future<Output = ()> + Send + 'static) -> Self {
        Self(Box::pin(future))
    }
}

impl Debug for Sleep {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("Sleep")
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.as_mut().poll(cx)
    }
}

/// Shareable handle to an [`AsyncSleep`] implementation.
#[derive(Clone, Debug)]
pub struct SharedAsyncSleep(Arc<dyn AsyncSleep>);

impl SharedAsyncSleep {
    /// Wraps `sleep` in a shareable handle.
    pub fn new(sleep: impl AsyncSleep + 'static) -> Self {
        Self(Arc::new(sleep))
    }
}

impl AsyncSleep for SharedAsyncSleep {
    fn sleep(&self, duration: Duration) -> Sleep {
        self.0.sleep(duration)
    }
}

/// [`AsyncSleep`] backed by the tokio timer wheel.
#[cfg(feature = "rt-tokio")]
#[non_exhaustive]
#[derive(Debug, Default)]
pub struct TokioSleep;

#[cfg(feature = "rt-tokio")]
impl AsyncSleep for TokioSleep {
    fn sleep(&self, duration: Duration) -> Sleep {
        Sleep::new(tokio::time::sleep(duration))
    }
}

/// The sleep implementation alarms fall back to when none is configured.
#[cfg(feature = "rt-tokio")]
pub fn default_async_sleep() -> SharedAsyncSleep {
    SharedAsyncSleep::new(TokioSleep)
}
