// Copyright 2026 The Stratum Authors. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The serializable, stateless front-end for constructing a [`Controller`].
//!
//! Mirrors the `Config`/`ProxyConfig` structs this corpus's `tor-memtrack`/`tor-hsrproxy`
//! crates expose: a plain, `serde`-(de)serializable struct that a larger config surface can
//! nest, paired with a `build()` that turns it into the live object. Those crates pull in
//! `derive_builder` to validate multiple interdependent fields against each other; this struct
//! has a single field with no cross-field invariant to enforce, so it is hand-written instead
//! of pulling in a builder-derive crate for a precondition that doesn't exist here. It is sugar
//! over [`Controller::new`], not a replacement for it - there is no file/CLI/env loading here or
//! anywhere else in this crate.

use serde::{Deserialize, Serialize};

use crate::Controller;

/// A public-facing, stateless structure holding the data needed to build a [`Controller`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WriteControllerConfig {
    /// See [`Controller::new`]. A rate of `0` disables the default-rate convenience
    /// ([`Controller::delayed_write_rate`] then reports `0`); it does not itself prevent a
    /// caller from later minting a delay token at a different, positive rate.
    pub configured_rate_bytes_per_sec: u64,
}

impl WriteControllerConfig {
    /// Builds the live [`Controller`] this configuration describes.
    pub fn build(self) -> Controller {
        Controller::new(self.configured_rate_bytes_per_sec)
    }
}
