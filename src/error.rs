// Copyright 2026 The Stratum Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the write controller.
//!
//! The controller has no recoverable error conditions at its public boundary (see the crate
//! docs). This type exists for the one validated construction path,
//! [`crate::Controller::try_new_delay_token`], so that path has a typed, testable shape instead
//! of an ad-hoc `assert!`.

/// Errors produced while constructing controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WriteControllerError {
    /// A delay vote was requested at a non-positive rate.
    ///
    /// A rate of zero carries no meaning for a token bucket (refills of zero bytes per
    /// interval would never clear any debt), so it is rejected rather than silently
    /// disabling rate limiting.
    #[error("delay token rate must be positive, got {0} bytes/sec")]
    NonPositiveRate(u64),
}
