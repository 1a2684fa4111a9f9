// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Useful constants.
//!
//! All constants *must* be double precision.

/// Speed of light in vacuum \[m/s\]
pub const VEL_C: f64 = 299_792_458.0;

/// The name given to the threads of the resampler pool. The worklet index is
/// appended.
pub const WORKLET_THREAD_PREFIX: &str = "resampler-worklet";

/// Number of visibility rows the command line driver puts in each chunk unless
/// told otherwise.
pub const DEFAULT_ROWS_PER_CHUNK: usize = 8192;
