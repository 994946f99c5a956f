/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! One-shot alarms pinned to an absolute wall-clock instant.
//!
//! An [`Alarm`] emits [`AlarmEvent::Fired`] the first time a wakeup observes that the
//! wall clock has reached or passed the target, and [`AlarmEvent::Rearmed`] when a later
//! wakeup observes that the clock has jumped backward across the target again.
//!
//! On Linux the alarm is driven by a kernel timer bound to the realtime clock with
//! cancel-on-clock-set semantics, so clock discontinuities wake the alarm immediately.
//! Everywhere else (or when kernel timers are unavailable) the alarm degrades to polling
//! the time source at most every ten seconds, which bounds the latency of skew detection.

use crate::sleep::SharedAsyncSleep;
use crate::time::{SharedTimeSource, TimeSource};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// Upper bound on the polled wakeup interval, to catch time skew reasonably promptly.
const MAX_TIMEOUT_INTERVAL: Duration = Duration::from_secs(10);

/// Lower bound on the polled wakeup interval.
const MIN_TIMEOUT_INTERVAL: Duration = Duration::from_secs(1);

/// Events emitted by an [`Alarm`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlarmEvent {
    /// The wall clock reached or passed the alarm's target.
    Fired,
    /// The wall clock jumped backward across the target after a prior firing.
    Rearmed,
}

/// Clock and sleep implementations an [`Alarm`] schedules against.
#[derive(Clone, Debug)]
pub struct AlarmContext {
    time_source: SharedTimeSource,
    sleep: SharedAsyncSleep,
    kernel_timers: bool,
}

impl AlarmContext {
    /// Creates a new `AlarmContext` from a time source and a sleep implementation.
    ///
    /// Kernel timers are enabled by default where the platform supports them.
    pub fn new(time_source: SharedTimeSource, sleep: SharedAsyncSleep) -> Self {
        Self {
            time_source,
            sleep,
            kernel_timers: true,
        }
    }

    /// Enables or disables the kernel timer mode.
    ///
    /// Disable this when scheduling against a substitute time source: kernel timers
    /// follow the real wall clock, not the configured [`SharedTimeSource`].
    pub fn with_kernel_timers(mut self, enabled: bool) -> Self {
        self.kernel_timers = enabled;
        self
    }

    /// Returns the configured time source.
    pub fn time_source(&self) -> &SharedTimeSource {
        &self.time_source
    }

    /// Returns the configured sleep implementation.
    pub fn sleep(&self) -> &SharedAsyncSleep {
        &self.sleep
    }
}

/// A one-shot wall-clock alarm.
///
/// Created with [`Alarm::new`], which also returns the receiving side of the alarm's
/// event stream. The alarm may be re-armed any number of times with [`Alarm::set`];
/// events from every schedule arrive on the same receiver.
#[derive(Debug)]
pub struct Alarm {
    context: AlarmContext,
    events: UnboundedSender<AlarmEvent>,
    scheduled: Mutex<Option<CancellationToken>>,
}

impl Alarm {
    /// Creates an unscheduled alarm and the receiver its events are delivered on.
    pub fn new(context: AlarmContext) -> (Self, UnboundedReceiver<AlarmEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                context,
                events,
                scheduled: Mutex::new(None),
            },
            rx,
        )
    }

    /// Schedules a one-shot firing at `target`.
    ///
    /// A previously scheduled firing is cancelled first, so re-arming is idempotent.
    /// Cancelling `cancel` stops all wakeups for this schedule. Calling `set` with an
    /// already-cancelled token does nothing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set(&self, target: SystemTime, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            return;
        }
        let mut scheduled = self.scheduled.lock().unwrap();
        if let Some(previous) = scheduled.take() {
            if !previous.is_cancelled() {
                previous.cancel();
            }
        }
        *scheduled = Some(cancel.clone());
        drop(scheduled);

        tokio::spawn(drive(self.context.clone(), target, cancel, self.events.clone()));
    }

    /// Cancels the current schedule, if any, returning the alarm to the unscheduled state.
    pub fn cancel(&self) {
        if let Some(token) = self.scheduled.lock().unwrap().take() {
            if !token.is_cancelled() {
                token.cancel();
            }
        }
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Runs the wakeup loop for one schedule of the alarm.
async fn drive(
    context: AlarmContext,
    target: SystemTime,
    cancel: CancellationToken,
    events: UnboundedSender<AlarmEvent>,
) {
    let mut prev_wakeup = None;

    // Wake up right away, in case the target already passed leaving the gate.
    if cancel.is_cancelled() {
        return;
    }
    if !fire_or_rearm(&context, target, &mut prev_wakeup, &events) {
        return;
    }

    #[cfg(target_os = "linux")]
    if context.kernel_timers {
        match kernel::KernelTimer::new()
            .and_then(|timer| timer.arm(timer_expiration(target)).map(|_| timer))
        {
            Ok(timer) => {
                tracing::debug!("using kernel timer");
                match run_kernel_timer(&timer, &context, target, &cancel, &events, &mut prev_wakeup)
                    .await
                {
                    Ok(()) => return,
                    Err(err) => {
                        tracing::warn!(err = %err, "kernel timer failed, falling back to polling");
                    }
                }
            }
            Err(err) => {
                tracing::debug!(err = %err, "could not create kernel timer, falling back to polling");
            }
        }
    }

    run_timeouts(&context, target, &cancel, &events, &mut prev_wakeup).await;
}

/// Decision rule executed on every wakeup.
///
/// Returns `false` once the event receiver has gone away and the schedule should stop.
fn fire_or_rearm(
    context: &AlarmContext,
    target: SystemTime,
    prev_wakeup: &mut Option<SystemTime>,
    events: &UnboundedSender<AlarmEvent>,
) -> bool {
    let now = context.time_source.now();
    let due = now >= target;
    let event = match *prev_wakeup {
        // If, according to the clock, we're past when we should have fired,
        // then fire the alarm.
        None => due.then_some(AlarmEvent::Fired),
        Some(previous) => {
            let was_due = previous >= target;
            if due && !was_due {
                // First wakeup where the target has been crossed.
                Some(AlarmEvent::Fired)
            } else if !due && was_due {
                // The clock jumped back across the target after a prior firing.
                Some(AlarmEvent::Rearmed)
            } else {
                None
            }
        }
    };
    *prev_wakeup = Some(now);

    match event {
        Some(event) => events.send(event).is_ok(),
        None => !events.is_closed(),
    }
}

/// Polled fallback: sleep in bounded intervals and re-run the decision rule.
async fn run_timeouts(
    context: &AlarmContext,
    target: SystemTime,
    cancel: &CancellationToken,
    events: &UnboundedSender<AlarmEvent>,
    prev_wakeup: &mut Option<SystemTime>,
) {
    use crate::sleep::AsyncSleep;

    loop {
        let now = context.time_source.now();
        let until = target.duration_since(now).unwrap_or_default();
        let interval = until.clamp(MIN_TIMEOUT_INTERVAL, MAX_TIMEOUT_INTERVAL);

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = context.sleep.sleep(interval) => {}
        }
        if cancel.is_cancelled() {
            return;
        }
        if !fire_or_rearm(context, target, prev_wakeup, events) {
            return;
        }
    }
}

/// The instant the kernel timer is armed at: the first whole second after `target`,
/// so the wall clock has fully crossed the target second when the timer reports.
#[cfg(target_os = "linux")]
fn timer_expiration(target: SystemTime) -> SystemTime {
    let since_epoch = target
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    SystemTime::UNIX_EPOCH + Duration::from_secs(since_epoch.as_secs() + 1)
}

/// How far out the kernel timer is re-armed once the target has passed. The kernel only
/// reports clock discontinuities for an armed cancelable timer, so one must stay armed
/// for backward-jump detection to keep working after the alarm fires.
#[cfg(target_os = "linux")]
const CLOCK_CHANGE_HORIZON: Duration = Duration::from_secs(60 * 60 * 24 * 365);

#[cfg(target_os = "linux")]
async fn run_kernel_timer(
    timer: &kernel::KernelTimer,
    context: &AlarmContext,
    target: SystemTime,
    cancel: &CancellationToken,
    events: &UnboundedSender<AlarmEvent>,
    prev_wakeup: &mut Option<SystemTime>,
) -> std::io::Result<()> {
    loop {
        let wake = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            wake = timer.ready() => wake?,
        };
        if cancel.is_cancelled() {
            return Ok(());
        }
        if let kernel::TimerWake::Expired { count } = wake {
            if count != 1 {
                tracing::warn!(
                    count,
                    "expected kernel timer to report firing once, but it reported more"
                );
            }
        }
        if !fire_or_rearm(context, target, prev_wakeup, events) {
            return Ok(());
        }

        let now = context.time_source.now();
        let at = if now < target {
            timer_expiration(target)
        } else {
            now + CLOCK_CHANGE_HORIZON
        };
        timer.arm(at)?;
    }
}

#[cfg(target_os = "linux")]
mod kernel {
    //! Kernel absolute-time timers bound to the realtime clock.

    use nix::errno::Errno;
    use nix::sys::time::TimeSpec;
    use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
    use std::fs::File;
    use std::io::{self, Read};
    use std::os::fd::AsFd;
    use std::time::SystemTime;
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;

    /// What woke the timer fd up.
    pub(super) enum TimerWake {
        /// The armed expiration was reached; `count` is the kernel's fire count.
        Expired { count: u64 },
        /// The realtime clock underwent a discontinuous change.
        ClockSet,
    }

    pub(super) struct KernelTimer {
        timer: TimerFd,
        async_fd: AsyncFd<File>,
    }

    impl KernelTimer {
        pub(super) fn new() -> io::Result<Self> {
            let timer = TimerFd::new(
                ClockId::CLOCK_REALTIME,
                TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
            )
            .map_err(io::Error::from)?;
            let file = File::from(timer.as_fd().try_clone_to_owned()?);
            let async_fd = AsyncFd::with_interest(file, Interest::READABLE)?;
            Ok(Self { timer, async_fd })
        }

        /// (Re-)arms the timer to expire at the absolute wall-clock instant `at`.
        ///
        /// Arming clears a pending clock-set cancellation, so the timer keeps
        /// reporting future discontinuities.
        pub(super) fn arm(&self, at: SystemTime) -> io::Result<()> {
            let since_epoch = at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default();
            self.timer
                .set(
                    Expiration::OneShot(TimeSpec::from_duration(since_epoch)),
                    TimerSetTimeFlags::TFD_TIMER_ABSTIME | TimerSetTimeFlags::TFD_TIMER_CANCEL_ON_SET,
                )
                .map_err(io::Error::from)
        }

        /// Waits until the timer expires or the wall clock is changed.
        pub(super) async fn ready(&self) -> io::Result<TimerWake> {
            loop {
                let mut guard = self.async_fd.readable().await?;
                let mut buf = [0u8; 8];
                match guard.try_io(|fd| {
                    let mut file = fd.get_ref();
                    file.read(&mut buf)
                }) {
                    // Readiness was stale; wait again.
                    Err(_would_block) => continue,
                    Ok(Ok(_)) => {
                        return Ok(TimerWake::Expired {
                            count: u64::from_ne_bytes(buf),
                        })
                    }
                    Ok(Err(err)) if err.raw_os_error() == Some(Errno::ECANCELED as i32) => {
                        return Ok(TimerWake::ClockSet)
                    }
                    Ok(Err(err)) => return Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleep::SharedAsyncSleep;
    use crate::test_util::TestClock;
    use std::time::{Duration, SystemTime};

    fn polling_context(clock: &TestClock) -> AlarmContext {
        AlarmContext::new(
            SharedTimeSource::new(clock.clone()),
            SharedAsyncSleep::new(clock.clone()),
        )
        .with_kernel_timers(false)
    }

    fn at(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[test]
    fn decision_rule_fires_once_per_crossing() {
        let clock = TestClock::new(at(100));
        let context = polling_context(&clock);
        let (events, mut rx) = mpsc::unbounded_channel();
        let target = at(105);
        let mut prev = None;

        // Not yet due: silent.
        assert!(fire_or_rearm(&context, target, &mut prev, &events));
        assert!(rx.try_recv().is_err());

        // First wakeup past the target fires.
        clock.set_time(at(106));
        assert!(fire_or_rearm(&context, target, &mut prev, &events));
        assert_eq!(rx.try_recv().ok(), Some(AlarmEvent::Fired));

        // Still past: silent.
        clock.set_time(at(107));
        assert!(fire_or_rearm(&context, target, &mut prev, &events));
        assert!(rx.try_recv().is_err());

        // Jumped back across the target: rearm.
        clock.set_time(at(101));
        assert!(fire_or_rearm(&context, target, &mut prev, &events));
        assert_eq!(rx.try_recv().ok(), Some(AlarmEvent::Rearmed));

        // Crossed again: second fire.
        clock.set_time(at(110));
        assert!(fire_or_rearm(&context, target, &mut prev, &events));
        assert_eq!(rx.try_recv().ok(), Some(AlarmEvent::Fired));
    }

    #[test]
    fn decision_rule_fires_immediately_for_past_target() {
        let clock = TestClock::new(at(100));
        let context = polling_context(&clock);
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut prev = None;

        assert!(fire_or_rearm(&context, at(50), &mut prev, &events));
        assert_eq!(rx.try_recv().ok(), Some(AlarmEvent::Fired));
    }

    #[tokio::test]
    async fn alarm_detects_backward_clock_jumps() {
        let clock = TestClock::new(at(1000));
        let (alarm, mut events) = Alarm::new(polling_context(&clock));

        alarm.set(at(1005), CancellationToken::new());
        tokio::task::yield_now().await;

        clock.advance(Duration::from_secs(6)).await;
        assert_eq!(events.recv().await, Some(AlarmEvent::Fired));

        clock.set_time(at(1001));
        clock.advance(Duration::from_secs(2)).await;
        assert_eq!(events.recv().await, Some(AlarmEvent::Rearmed));

        clock.set_time(at(1007));
        clock.advance(Duration::from_secs(2)).await;
        assert_eq!(events.recv().await, Some(AlarmEvent::Fired));
    }

    #[tokio::test]
    async fn alarm_fires_immediately_for_past_target() {
        let clock = TestClock::new(at(1000));
        let (alarm, mut events) = Alarm::new(polling_context(&clock));

        alarm.set(at(900), CancellationToken::new());
        assert_eq!(events.recv().await, Some(AlarmEvent::Fired));
    }

    #[tokio::test]
    async fn set_with_cancelled_token_is_a_no_op() {
        let clock = TestClock::new(at(1000));
        let (alarm, mut events) = Alarm::new(polling_context(&clock));

        let cancel = CancellationToken::new();
        cancel.cancel();
        alarm.set(at(900), cancel);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn rearming_cancels_the_previous_schedule() {
        let clock = TestClock::new(at(1000));
        let (alarm, mut events) = Alarm::new(polling_context(&clock));

        let first = CancellationToken::new();
        alarm.set(at(1005), first.clone());
        alarm.set(at(2000), CancellationToken::new());
        assert!(first.is_cancelled());
        tokio::task::yield_now().await;

        // The first schedule is dead: crossing its target produces nothing.
        clock.advance(Duration::from_secs(10)).await;
        assert!(events.try_recv().is_err());

        clock.set_time(at(2001));
        clock.advance(Duration::from_secs(10)).await;
        assert_eq!(events.recv().await, Some(AlarmEvent::Fired));
    }

    #[tokio::test]
    async fn polled_alarm_fires_within_the_polling_interval() {
        let clock = TestClock::new(at(0));
        let (alarm, mut events) = Alarm::new(polling_context(&clock));

        // Target is 35s out; the alarm polls at most every 10s.
        alarm.set(at(35), CancellationToken::new());
        tokio::task::yield_now().await;

        clock.advance(Duration::from_secs(30)).await;
        assert!(events.try_recv().is_err());

        clock.advance(Duration::from_secs(10)).await;
        assert_eq!(events.recv().await, Some(AlarmEvent::Fired));
    }
}
