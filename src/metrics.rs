// Copyright 2026 The Stratum Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-local metrics: vote gauges and a wait-duration histogram for `get_delay`, in the
//! same shape of data this corpus's storage-engine rate limiter reports (a per-request wait
//! duration histogram; see `file_system::rate_limiter::RATE_LIMITER_REQUEST_WAIT_DURATION` in
//! the teacher pack's `tabokie-tikv` example).
//!
//! Unlike that example's globally-registered static, the controller never registers these into
//! a global registry on its own - that would force every host engine embedding it to share one.
//! [`WriteControllerMetrics::new`] constructs a fresh, unregistered set directly from the
//! `prometheus` crate's own constructors; [`WriteControllerMetrics::collectors`] hands back
//! everything the host should register into its own [`prometheus::Registry`].

use prometheus::core::Collector;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts};

/// Metrics describing one [`crate::Controller`] instance's vote state and throttling behavior.
#[derive(Clone)]
pub struct WriteControllerMetrics {
    /// Number of outstanding stop votes.
    pub stop_votes: IntGauge,
    /// Number of outstanding delay votes.
    pub delay_votes: IntGauge,
    /// The delay rate currently in effect, or 0 if no delay vote exists.
    pub current_delay_rate_bytes_per_sec: IntGauge,
    /// Distribution of `get_delay` return values, in microseconds.
    pub get_delay_wait_duration_us: Histogram,
    /// Count of `get_delay` calls whose computed sleep was clamped to `MAX_SLEEP_US`.
    pub clamped_sleeps_total: IntCounter,
    /// Count of bucket resets caused by minting a new delay token at a different rate.
    pub bucket_resets_total: IntCounter,
}

impl WriteControllerMetrics {
    /// Builds a fresh, unregistered metric set.
    ///
    /// Fails only if `prometheus` rejects the metric descriptors, which does not happen for
    /// the fixed names and help strings used here; the `Result` exists because the
    /// constructors this wraps are fallible in general.
    pub fn new() -> prometheus::Result<Self> {
        Ok(WriteControllerMetrics {
            stop_votes: IntGauge::with_opts(Opts::new(
                "write_controller_stop_votes",
                "Outstanding stop votes against the write controller.",
            ))?,
            delay_votes: IntGauge::with_opts(Opts::new(
                "write_controller_delay_votes",
                "Outstanding delay votes against the write controller.",
            ))?,
            current_delay_rate_bytes_per_sec: IntGauge::with_opts(Opts::new(
                "write_controller_current_delay_rate_bytes_per_sec",
                "Delay rate currently in effect, or 0 if writers are not being paced.",
            ))?,
            get_delay_wait_duration_us: Histogram::with_opts(
                HistogramOpts::new(
                    "write_controller_get_delay_wait_duration_us",
                    "Distribution of sleep durations returned by get_delay, in microseconds.",
                )
                .buckets(vec![
                    0.0, 100.0, 500.0, 1_000.0, 5_000.0, 10_000.0, 50_000.0, 100_000.0,
                    500_000.0, 1_000_000.0, 2_000_000.0,
                ]),
            )?,
            clamped_sleeps_total: IntCounter::with_opts(Opts::new(
                "write_controller_clamped_sleeps_total",
                "Number of get_delay calls whose sleep was clamped to the maximum.",
            ))?,
            bucket_resets_total: IntCounter::with_opts(Opts::new(
                "write_controller_bucket_resets_total",
                "Number of bucket resets caused by minting a new delay token.",
            ))?,
        })
    }

    /// Every collector the host engine should register into its own [`prometheus::Registry`].
    pub fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.stop_votes.clone()),
            Box::new(self.delay_votes.clone()),
            Box::new(self.current_delay_rate_bytes_per_sec.clone()),
            Box::new(self.get_delay_wait_duration_us.clone()),
            Box::new(self.clamped_sleeps_total.clone()),
            Box::new(self.bucket_resets_total.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_metrics_start_at_zero() {
        let metrics = WriteControllerMetrics::new().expect("valid metric descriptors");
        assert_eq!(metrics.stop_votes.get(), 0);
        assert_eq!(metrics.delay_votes.get(), 0);
        assert_eq!(metrics.current_delay_rate_bytes_per_sec.get(), 0);
        assert_eq!(metrics.clamped_sleeps_total.get(), 0);
        assert_eq!(metrics.bucket_resets_total.get(), 0);
        assert_eq!(metrics.get_delay_wait_duration_us.get_sample_count(), 0);
    }

    #[test]
    fn collectors_exposes_every_metric() {
        let metrics = WriteControllerMetrics::new().expect("valid metric descriptors");
        assert_eq!(metrics.collectors().len(), 6);
    }
}
