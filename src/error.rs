//! Errors that can occur while resampling visibilities.
//!
//! Only configuration and shape problems are errors. Individual samples that
//! can't be resampled (flagged, zero-weight, unmapped or off the grid) are
//! skipped, and never surface here.

use thiserror::Error;

use crate::config::ResamplerConfigBuilderError;

#[derive(Error, Debug)]
/// All the errors that can occur in visresample
pub enum ResamplerError {
    /// Error for an array whose shape doesn't agree with its companions.
    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    BadArrayShape {
        /// The argument name within the function
        argument: String,
        /// The function name
        function: String,
        /// The expected shape
        expected: String,
        /// The shape that was received instead
        received: String,
    },

    /// Error for a convolution function table that can't serve lookups.
    #[error("bad convolution function {name}: {reason}")]
    BadConvFunc {
        /// The name of the convolution function
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// Error for a channel map that doesn't match the data.
    #[error("bad channel map: expected {expected} input channels, found {found}")]
    BadChannelMap {
        /// The number of data channels
        expected: usize,
        /// The length of the map
        found: usize,
    },

    /// Error for a channel frequency which can't place samples on the grid.
    #[error("bad frequency {freq_hz} Hz for channel {chan}, frequencies must be finite and positive")]
    BadFrequency {
        /// The data channel
        chan: usize,
        /// Its frequency
        freq_hz: f64,
    },

    /// Error for a polarization map that doesn't match the data or the kernel.
    #[error("bad polarization map: {reason}")]
    BadPolMap {
        /// What is wrong with it
        reason: String,
    },

    /// Error building the worker thread pool.
    #[error("could not build worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Work was dispatched to a pool which has been terminated.
    #[error("the worker pool has been terminated, no more work can be dispatched")]
    PoolTerminated,

    /// Error building a [`crate::ResamplerConfig`].
    #[error("{0}")]
    ConfigBuilder(#[from] ResamplerConfigBuilderError),

    /// The command line asked for a summary only, and no work was done.
    #[error("Dry run")]
    DryRun {},

    /// Error to describe some kind of invalid command line argument.
    #[error(transparent)]
    CLIError(#[from] CLIError),

    #[cfg(feature = "cli")]
    /// Error derived from [`clap::Error`]
    #[error(transparent)]
    ClapError(#[from] clap::Error),
}

#[derive(Error, Debug)]
/// Errors that can occur while parsing command line arguments
pub enum CLIError {
    /// The value provided for an option couldn't be used.
    #[error("Invalid Command Line Argument {option}\nexpected {expected}, received {received}")]
    InvalidCommandLineArgument {
        /// The option that was parsed
        option: String,
        /// What it should have been
        expected: String,
        /// What it actually was
        received: String,
    },
}
