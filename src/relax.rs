// Modified version of relax.rs from spin-rs to support Loom yielding,
// exponential backoff and escalation to sleeping.
//
// Original file at its most recent change (at the time of writing):
// https://github.com/mvdnes/spin-rs/blob/5860ee114094cf200b97348ff332155fbd7159b4/src/relax.rs
//
// Copyright (c) 2014 Mathijs van de Nes
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Strategies a [`SpinFlag`] waiter follows between two polls of a busy lock.
//!
//! The allocator lock may be held for a handful of instructions or for a
//! whole collection pass. Pure spinning is right for the former and wasteful
//! for the latter, so the default strategy, [`SleepBackoff`], starts by
//! spinning and escalates to yielding and then to sleeping.
//!
//! [`SpinFlag`]: crate::backend::SpinFlag

use core::time::Duration;

use crate::cfg::{hint, thread};

/// A trait implemented by waiting strategies.
///
/// A fresh value is created for every wait, and [`relax`] is called once per
/// failed poll.
///
/// # Example
///
/// ```
/// use alloclock::relax::Relax;
///
/// struct Pause;
///
/// impl Relax for Pause {
///     #[inline(always)]
///     fn new() -> Self {
///         Self
///     }
///
///     #[inline(always)]
///     fn relax(&mut self) {
///         core::hint::spin_loop();
///     }
/// }
/// ```
///
/// [`relax`]: Relax::relax
pub trait Relax {
    /// Returns the initial value for this relaxing strategy.
    fn new() -> Self;

    /// Performs the relaxing operation during a period of contention.
    fn relax(&mut self);
}

/// Busy-waits, hinting the processor through [`core::hint::spin_loop`].
///
/// Only suitable when the lock is known to be held for very short periods.
/// Spinning threads look like useful work to the scheduler, which can starve
/// the lock holder itself.
pub struct Spin;

impl Relax for Spin {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        hint::spin_loop();
    }
}

/// Busy-waits without any hint at all.
///
/// Almost never the right choice for the allocation lock. It exists to
/// measure the other strategies against, and for targets where even the
/// spin hint is unwanted. Not suitable for Loom models, which need every
/// waiting loop to yield.
pub struct Loop;

impl Relax for Loop {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {}
}

/// Gives up the current time slice through [`std::thread::yield_now`].
pub struct Yield;

impl Relax for Yield {
    #[inline(always)]
    fn new() -> Self {
        Self
    }

    #[inline(always)]
    fn relax(&mut self) {
        thread::yield_now();
    }
}

// Exponential backoff is based on the crossbeam-utils implementation.
// link to most recent change (as the time of writing):
// https://github.com/crossbeam-rs/crossbeam/blob/371de8c2d304db07662450995848f3dc9598ac99/crossbeam-utils/src/backoff.rs
//
// Copyright (c) 2019 The Crossbeam Project Developers
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

/// An unsigned integer type use as the inner type for [`Backoff`].
type Uint = u32;

/// Busy-waits like [`Spin`], doubling the number of spin hints after every
/// failed poll up to `1 << SpinBackoff::MAX`.
pub struct SpinBackoff {
    inner: Backoff<{ Self::MAX }>,
}

impl SpinBackoff {
    /// The largest value the inner backoff counter can reach.
    const MAX: Uint = 6;
}

// The maximum inner value **must** be smaller than Uint::BITS, or else the
// bitshift operation will overflow.
const _: () = assert!(SpinBackoff::MAX < Uint::BITS);

impl Relax for SpinBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { inner: Backoff::default() }
    }

    #[inline(always)]
    fn relax(&mut self) {
        self.inner.spin();
        self.inner.step();
    }
}

/// Spins with exponential backoff like [`SpinBackoff`], then yields the time
/// slice on every poll once the spin budget is exhausted.
pub struct YieldBackoff {
    inner: Backoff<{ Self::MAX }>,
}

impl YieldBackoff {
    /// The largest value the inner backoff counter can reach.
    const MAX: Uint = SpinBackoff::MAX;
}

const _: () = assert!(YieldBackoff::MAX < Uint::BITS);

impl Relax for YieldBackoff {
    #[inline(always)]
    fn new() -> Self {
        Self { inner: Backoff::default() }
    }

    #[inline(always)]
    fn relax(&mut self) {
        if self.inner.is_completed() {
            thread::yield_now();
        } else {
            self.inner.spin();
            self.inner.step();
        }
    }
}

/// Spins with exponential backoff, then yields, then sleeps.
///
/// Once the spin budget is exhausted the waiter yields for a bounded number
/// of polls. After that it sleeps, starting at [`SleepBackoff::MIN_SLEEP`]
/// and doubling on each poll up to [`SleepBackoff::MAX_SLEEP`]. A waiter
/// behind a long critical section therefore costs almost no CPU time.
///
/// This is the default strategy of [`SpinFlag`].
///
/// [`SpinFlag`]: crate::backend::SpinFlag
pub struct SleepBackoff {
    spin: Backoff<{ Self::SPIN_MAX }>,
    yields: Uint,
    sleep: Duration,
}

impl SleepBackoff {
    /// The largest value the inner spin backoff counter can reach.
    const SPIN_MAX: Uint = SpinBackoff::MAX;

    /// Number of polls that yield before the waiter starts sleeping.
    const YIELDS: Uint = 8;

    /// First sleep interval.
    pub const MIN_SLEEP: Duration = Duration::from_micros(1);

    /// Upper bound of the sleep interval.
    pub const MAX_SLEEP: Duration = Duration::from_millis(2);
}

const _: () = assert!(SleepBackoff::SPIN_MAX < Uint::BITS);

impl Relax for SleepBackoff {
    #[inline(always)]
    fn new() -> Self {
        let spin = Backoff::default();
        Self { spin, yields: 0, sleep: Self::MIN_SLEEP }
    }

    fn relax(&mut self) {
        if !self.spin.is_completed() {
            self.spin.spin();
            self.spin.step();
        } else if self.yields < Self::YIELDS {
            self.yields += 1;
            thread::yield_now();
        } else {
            thread::sleep(self.sleep);
            self.sleep = (self.sleep * 2).min(Self::MAX_SLEEP);
        }
    }
}

/// Inner backoff counter that keeps track of the number of shifts applied.
#[derive(Default)]
struct Backoff<const MAX: Uint>(Uint);

impl<const MAX: Uint> Backoff<MAX> {
    /// Runs a bounded spin loop `1 << self.0` times, with `self.0` capped at
    /// `MAX`.
    fn spin(&self) {
        let shifts = self.0.min(MAX);
        for _ in 0..(1 << shifts) {
            hint::spin_loop();
        }
    }

    /// Increments the inner counter, saturating at `MAX`.
    fn step(&mut self) {
        (self.0 < MAX).then(|| self.0 += 1);
    }

    /// Whether the counter reached `MAX`.
    fn is_completed(&self) -> bool {
        self.0 >= MAX
    }
}

#[cfg(all(not(loom), test))]
mod test {
    use super::{Backoff, Relax, SleepBackoff, Uint};

    fn returns<R: Relax, const MAX: Uint>() {
        let mut relax = R::new();
        for _ in 0..=MAX.saturating_mul(10) {
            relax.relax();
        }
    }

    #[test]
    fn spins() {
        returns::<super::Spin, 10>();
    }

    #[test]
    fn spins_backoff() {
        returns::<super::SpinBackoff, { super::SpinBackoff::MAX }>();
    }

    #[test]
    fn yields() {
        returns::<super::Yield, 10>();
    }

    #[test]
    fn yields_backoff() {
        returns::<super::YieldBackoff, { super::YieldBackoff::MAX }>();
    }

    #[test]
    fn loops() {
        returns::<super::Loop, 10>();
    }

    #[test]
    fn yield_backoff_stops_spinning() {
        let mut relax = super::YieldBackoff::new();
        for _ in 0..super::YieldBackoff::MAX {
            assert!(!relax.inner.is_completed());
            relax.relax();
        }
        assert!(relax.inner.is_completed());
        relax.relax();
        assert_eq!(relax.inner.0, super::YieldBackoff::MAX);
    }

    #[test]
    fn sleeps_backoff() {
        returns::<SleepBackoff, { SleepBackoff::SPIN_MAX }>();
    }

    #[test]
    fn backoff_saturates() {
        let mut backoff = Backoff::<3>::default();
        for _ in 0..10 {
            backoff.step();
        }
        assert!(backoff.is_completed());
        assert_eq!(backoff.0, 3);
    }

    #[test]
    fn sleep_interval_is_capped() {
        let mut relax = SleepBackoff::new();
        let polls = SleepBackoff::SPIN_MAX + SleepBackoff::YIELDS;
        for _ in 0..polls {
            relax.relax();
        }
        assert_eq!(relax.sleep, SleepBackoff::MIN_SLEEP);
        // 1us doubled 11 times is past 2ms.
        for _ in 0..12 {
            relax.relax();
        }
        assert_eq!(relax.sleep, SleepBackoff::MAX_SLEEP);
    }
}
