// Copyright 2026 The Stratum Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The token bucket that turns a requested byte count into a sleep duration.
//!
//! This is the ~55% of the controller's core logic: a byte balance that refills once per
//! millisecond at the currently active delay rate, and goes negative ("sleep debt") when a
//! caller asks for more bytes than the balance currently holds.

use crate::clock::Clock;

/// Length of one refill interval, in microseconds.
pub(crate) const REFILL_INTERVAL_US: u64 = 1_000;

/// Number of refill intervals per second (`1_000_000 / REFILL_INTERVAL_US`).
const REFILLS_PER_SEC: u64 = 1_000_000 / REFILL_INTERVAL_US;

/// Longest sleep duration a single `get_delay` call will return.
///
/// Any shortfall beyond this is left as debt for the caller's next call to pay down, rather
/// than making one caller block indefinitely.
pub const MAX_SLEEP_US: u64 = 2_000_000;

/// The byte-balance half of the controller.
///
/// `Bucket` holds no opinion about whether delaying is currently in effect - that is the vote
/// registry's job (see [`crate::Inner`]). It only knows how to refill and drain a balance given
/// a rate and the passage of time.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bucket {
    /// Time the balance was last refilled, or `None` if no call has established a baseline yet.
    last_refill_time_us: Option<u64>,
    /// Signed byte balance. Negative values are sleep debt.
    bytes_left_in_interval: i64,
    /// Sub-refill-interval remainder carried from a prior call, in microseconds.
    ///
    /// Each slow-path call catches `last_refill_time_us` fully up to the clock it just read,
    /// which would otherwise truncate away whatever time didn't add up to a whole refill
    /// interval. `credit_us` banks that remainder so the next call's elapsed-time computation
    /// folds it back in instead of losing it - see [`Bucket::get_delay`].
    credit_us: u64,
}

impl Bucket {
    /// A fresh bucket: no balance, no credit, no refill baseline.
    ///
    /// This is also the state a [`crate::DelayToken`] reset produces (§3, invariant 6): the
    /// bucket never carries a surplus or a debt across a rate change.
    pub(crate) const fn new() -> Self {
        Bucket {
            last_refill_time_us: None,
            bytes_left_in_interval: 0,
            credit_us: 0,
        }
    }

    /// Resets the bucket to its fresh state, discarding any balance, credit, or refill baseline.
    pub(crate) fn reset(&mut self) {
        *self = Bucket::new();
    }

    /// Computes the number of microseconds the caller must sleep before issuing `num_bytes` of
    /// writes at `rate_bytes_per_sec`.
    ///
    /// `rate_bytes_per_sec` must be positive; callers only reach this path while a delay vote
    /// is active, and [`crate::Controller::new_delay_token`] rejects non-positive rates.
    pub(crate) fn get_delay(&mut self, clock: &dyn Clock, num_bytes: u64, rate_bytes_per_sec: u64) -> u64 {
        debug_assert!(rate_bytes_per_sec > 0, "delay rate must be positive");

        if num_bytes == 0 {
            return 0;
        }

        // Fast path: no time is read if the existing balance already covers the request.
        if let Ok(num_bytes) = i64::try_from(num_bytes) {
            if num_bytes <= self.bytes_left_in_interval {
                self.bytes_left_in_interval -= num_bytes;
                return 0;
            }
        }

        let now_us = clock.now_micros();
        match self.last_refill_time_us {
            None => {
                // First call ever (or first call since a reset): establish the baseline but
                // don't refill against it - there is nothing to catch up on yet.
                self.last_refill_time_us = Some(now_us);
            }
            Some(last_refill_time_us) => {
                debug_assert!(
                    now_us >= last_refill_time_us,
                    "clock went backwards: {now_us} < {last_refill_time_us}"
                );
                let elapsed_us = now_us.saturating_sub(last_refill_time_us);
                // Fold in unused time from a prior call's sub-interval remainder before
                // computing whole intervals, so fractional progress is never lost.
                let elapsed_us = elapsed_us.saturating_add(std::mem::take(&mut self.credit_us));

                let whole_intervals = elapsed_us / REFILL_INTERVAL_US;
                let refill_per_interval = rate_bytes_per_sec / REFILLS_PER_SEC;
                let refilled = whole_intervals.saturating_mul(refill_per_interval);
                self.bytes_left_in_interval = self
                    .bytes_left_in_interval
                    .saturating_add(refilled as i64);

                // Catch the refill clock fully up to now, carrying the sub-interval remainder
                // forward as credit rather than losing it to truncation.
                self.last_refill_time_us = Some(now_us);
                self.credit_us = elapsed_us % REFILL_INTERVAL_US;
            }
        }

        self.bytes_left_in_interval -= num_bytes as i64;

        if self.bytes_left_in_interval >= 0 {
            return 0;
        }

        let shortfall = (-self.bytes_left_in_interval) as u64;
        let needed_us = shortfall.saturating_mul(1_000_000) / rate_bytes_per_sec;

        if needed_us > MAX_SLEEP_US {
            MAX_SLEEP_US
        } else {
            needed_us
        }
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Bucket::new()
    }
}
