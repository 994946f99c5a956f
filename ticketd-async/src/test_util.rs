/*
 * Copyright (c) The ticketd Authors.
 * SPDX-License-Identifier: Apache-2.0
 */

//! A manually driven clock for exercising alarms and identity expiration.
//!
//! [`TestClock`] serves as both the time source and the sleep implementation of the
//! code under test, over one shared timeline. Sleeps elapse on a monotonic axis that
//! only moves through [`advance`](TestClock::advance); the wall-clock reading moves
//! with it, and can additionally be repositioned in either direction with
//! [`set_time`](TestClock::set_time) without waking any sleeper.
//!
//! That split is what makes wall-clock discontinuities reproducible: a backward
//! `set_time` rewinds what `now()` reports while pending alarm polls stay scheduled,
//! so the next `advance` wakes a poll that then observes the rewound clock and can
//! re-arm the alarm.

use crate::sleep::{AsyncSleep, Sleep};
use crate::time::TimeSource;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;

#[derive(Debug)]
struct Sleeper {
    /// Monotonic instant the sleep comes due at.
    due: Duration,
    wake: oneshot::Sender<()>,
}

#[derive(Debug)]
struct ClockState {
    wall: SystemTime,
    monotonic: Duration,
    sleepers: Vec<Sleeper>,
}

/// Manually driven wall clock plus sleep implementation for tests.
///
/// Cloning yields another handle onto the same timeline.
#[derive(Clone, Debug)]
pub struct TestClock {
    state: Arc<Mutex<ClockState>>,
}

impl TestClock {
    /// Creates a clock whose wall time reads `start`.
    pub fn new(start: SystemTime) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState {
                wall: start,
                monotonic: Duration::ZERO,
                sleepers: Vec::new(),
            })),
        }
    }

    /// Repositions the wall clock, forward or backward, with no time elapsing.
    ///
    /// No sleeper wakes; pending alarm polls observe the new reading on their
    /// next wakeup.
    pub fn set_time(&self, to: SystemTime) {
        self.state.lock().unwrap().wall = to;
    }

    /// Elapses `delta` of real time, moving the wall clock along with it.
    ///
    /// Sleepers coming due within the window wake in order, and the runtime is
    /// yielded after each wakeup so a woken task can queue its next sleep and still
    /// be served within the same window. That keeps a 10-second alarm polling loop
    /// running to the end of an arbitrarily long window.
    pub async fn advance(&self, delta: Duration) {
        let end = self.state.lock().unwrap().monotonic + delta;
        loop {
            let woken = {
                let mut state = self.state.lock().unwrap();
                let next = state
                    .sleepers
                    .iter()
                    .enumerate()
                    .filter(|(_, sleeper)| sleeper.due <= end)
                    .min_by_key(|(_, sleeper)| sleeper.due)
                    .map(|(index, _)| index);
                match next {
                    Some(index) => {
                        let sleeper = state.sleepers.swap_remove(index);
                        let due = sleeper.due.max(state.monotonic);
                        let delta = due - state.monotonic;
                        state.wall += delta;
                        state.monotonic = due;
                        Some(sleeper)
                    }
                    None => None,
                }
            };
            match woken {
                Some(sleeper) => {
                    let _ = sleeper.wake.send(());
                    tokio::task::yield_now().await;
                }
                None => break,
            }
        }

        let mut state = self.state.lock().unwrap();
        let delta = end - state.monotonic;
        state.wall += delta;
        state.monotonic = end;
    }
}

impl TimeSource for TestClock {
    fn now(&self) -> SystemTime {
        self.state.lock().unwrap().wall
    }
}

impl AsyncSleep for TestClock {
    fn sleep(&self, duration: Duration) -> Sleep {
        let (wake, slept) = oneshot::channel();
        let mut state = self.state.lock().unwrap();
        let due = state.monotonic + duration;
        state.sleepers.push(Sleeper { due, wake });
        Sleep::new(async move {
            let _ = slept.await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(seconds: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(seconds)
    }

    #[tokio::test]
    async fn advance_drives_a_polling_loop_through_its_window() {
        let clock = TestClock::new(at(0));
        let polls = Arc::new(AtomicUsize::new(0));
        let task = {
            let clock = clock.clone();
            let polls = polls.clone();
            // A 10-second cadence, the way alarms wait out their polling interval.
            tokio::spawn(async move {
                loop {
                    clock.sleep(Duration::from_secs(10)).await;
                    if polls.fetch_add(1, Ordering::SeqCst) + 1 == 5 {
                        break;
                    }
                }
            })
        };
        tokio::task::yield_now().await;

        clock.advance(Duration::from_secs(49)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert_eq!(clock.now(), at(49));

        clock.advance(Duration::from_secs(1)).await;
        assert_eq!(polls.load(Ordering::SeqCst), 5);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn backward_set_time_rewinds_the_reading_without_waking_sleepers() {
        let clock = TestClock::new(at(100));
        let slept = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.sleep(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        clock.set_time(at(40));
        tokio::task::yield_now().await;
        assert!(!slept.is_finished());
        assert_eq!(clock.now(), at(40));

        // The pending sleep still represents five seconds of real time.
        clock.advance(Duration::from_secs(5)).await;
        slept.await.unwrap();
        assert_eq!(clock.now(), at(45));
    }
}
