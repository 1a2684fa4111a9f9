#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! visresample moves radio interferometric visibilities onto, and back off, a
//! regular grid of spatial frequencies, by convolution with a precomputed
//! kernel.
//!
//! Gridding ([`VisResampler::data_to_grid`]) is the step before an FFT makes
//! an image. Degridding ([`VisResampler::grid_to_data`]) predicts visibilities
//! from a model grid, and [`VisResampler::compute_residuals`] subtracts that
//! prediction from the data. Every row uses one kernel, or one picked for it
//! by a [`RowCfMap`].
//!
//! [`MultiThreadedResampler`] does the same work with a fixed pool of worker
//! threads, each with a private grid which is summed back once every thread
//! is done.
//!
//! # Examples
//!
//! Grid one visibility with a single-tap kernel, and predict it again.
//!
//! ```rust
//! use std::sync::Arc;
//! use visresample::{
//!     ndarray::{Array1, Array2, Array4},
//!     CfTable, ChannelMap, Complex, PolMap, ResamplerConfigBuilder, VisBuffer, VisResampler,
//! };
//!
//! // one row, one channel, one polarization
//! let mut rows = VisBuffer::new_blank(1, Array1::from(vec![150e6]), 1);
//! rows.vis.fill(Complex::new(3.0, 0.0));
//!
//! let config = ResamplerConfigBuilder::default()
//!     .uvw_scale([1.0, 1.0, 0.0])
//!     .offset([2.0, 2.0, 0.0])
//!     .chan_map(ChannelMap::identity(1))
//!     .pol_map(PolMap::identity(1))
//!     .build()
//!     .unwrap();
//! let resampler = VisResampler::new(Arc::new(config));
//! let cf = CfTable::single_tap(150e6, 1, 1);
//!
//! let mut grid = Array4::<Complex<f32>>::zeros((4, 4, 1, 1));
//! let mut sumwt = Array2::zeros((1, 1));
//! resampler
//!     .data_to_grid(grid.view_mut(), &rows.view(), sumwt.view_mut(), false, &cf)
//!     .unwrap();
//! assert_eq!(grid[(2, 2, 0, 0)], Complex::new(3.0, 0.0));
//! assert_eq!(sumwt[(0, 0)], 1.0);
//!
//! rows.vis.fill(Complex::new(0.0, 0.0));
//! resampler.grid_to_data(rows.view_mut(), grid.view(), &cf).unwrap();
//! assert_eq!(rows.vis[(0, 0, 0)], Complex::new(3.0, 0.0));
//! ```

use cfg_if::cfg_if;

pub use ndarray;
pub use num_complex::Complex;
pub use num_traits;
pub use rayon;

pub mod constants;

pub mod error;
pub use error::ResamplerError;

pub mod types;
pub use types::{Grid, GridFloat, SumWeights};

pub mod vis_buffer;
pub use vis_buffer::{VisBuffer, VisBufferView, VisBufferViewMut};

pub mod conv_func;
pub use conv_func::{CfSource, CfTable, ConvFunc, RowCfMap, ScaledCf};

pub mod config;
pub use config::{ChannelMap, PolMap, ResamplerConfig, ResamplerConfigBuilder};

pub mod geometry;

pub mod resampler;
pub use resampler::VisResampler;

pub mod workers;

pub mod multi_threaded;
pub use multi_threaded::{DispatchState, MultiThreadedResampler};

pub mod sim;

cfg_if! {
    if #[cfg(feature = "cli")] {
        pub mod cli;
        pub use cli::{main_with_args, ResamplerContext};
    }
}

/// Evaluate `$body`, adding the time it took to the entry `$name` in the
/// `HashMap<String, Duration>` `$durations`.
#[macro_export]
macro_rules! with_increment_duration {
    ($durations:expr, $name:expr, $body:expr) => {{
        let _now = std::time::Instant::now();
        let _res = $body;
        *$durations
            .entry($name.into())
            .or_insert_with(std::time::Duration::default) += _now.elapsed();
        _res
    }};
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, time::Duration};

    #[test]
    fn test_with_increment_duration_accumulates() {
        let mut durations = HashMap::<String, Duration>::new();
        let first = with_increment_duration!(durations, "work", 1 + 1);
        let second = with_increment_duration!(durations, "work", {
            std::thread::sleep(Duration::from_millis(2));
            first * 2
        });
        assert_eq!(second, 4);
        assert_eq!(durations.len(), 1);
        assert!(durations["work"] >= Duration::from_millis(2));
    }
}
