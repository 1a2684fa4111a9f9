//! Configuration shared by every resampler in a session.
//!
//! A [`ResamplerConfig`] is immutable while work is in flight: the
//! multi-threaded resampler hands each worklet an [`std::sync::Arc`] to the
//! same configuration, and only swaps it out between calls.

use std::fmt::Display;

use derive_builder::Builder;
use itertools::Itertools;

use crate::ResamplerError;

/// Maps each data channel to a grid channel, or drops it.
///
/// Several data channels may land on the same grid channel (e.g. for
/// multi-frequency synthesis).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap(Vec<Option<usize>>);

impl ChannelMap {
    /// Create a channel map from an explicit list, one entry per data channel.
    pub fn new(map: Vec<Option<usize>>) -> Self {
        Self(map)
    }

    /// Data channel `i` goes to grid channel `i`.
    pub fn identity(num_chans: usize) -> Self {
        Self((0..num_chans).map(Some).collect())
    }

    /// Fold `num_data_chans` contiguous data channels onto `num_grid_chans`
    /// grid channels of (near) equal width. `num_grid_chans = 1` grids every
    /// channel together.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use visresample::ChannelMap;
    ///
    /// let map = ChannelMap::folding(6, 2);
    /// assert_eq!(map.get(2), Some(0));
    /// assert_eq!(map.get(3), Some(1));
    /// ```
    pub fn folding(num_data_chans: usize, num_grid_chans: usize) -> Self {
        Self(
            (0..num_data_chans)
                .map(|chan| {
                    if num_grid_chans == 0 {
                        None
                    } else {
                        Some(chan * num_grid_chans / num_data_chans)
                    }
                })
                .collect(),
        )
    }

    /// The grid channel for a data channel, if it has one.
    #[inline]
    pub fn get(&self, data_chan: usize) -> Option<usize> {
        self.0.get(data_chan).copied().flatten()
    }

    /// The number of data channels this maps
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if this maps no channels
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Maps each data polarization to a grid polarization, and to the kernel
/// plane it should be convolved with.
///
/// `conj_cf_planes` is used in place of `cf_planes` for samples gridded with
/// the conjugate kernel (positive w). For cross-hand kernels this is where the
/// conjugate plane differs from the plane itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolMap {
    grid_pols: Vec<Option<usize>>,
    cf_planes: Vec<usize>,
    conj_cf_planes: Vec<usize>,
}

impl PolMap {
    /// Create a polarization map, one entry per data polarization in each
    /// list.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadPolMap`] if the lists differ in
    /// length.
    pub fn new(
        grid_pols: Vec<Option<usize>>,
        cf_planes: Vec<usize>,
        conj_cf_planes: Vec<usize>,
    ) -> Result<Self, ResamplerError> {
        if grid_pols.len() != cf_planes.len() || grid_pols.len() != conj_cf_planes.len() {
            return Err(ResamplerError::BadPolMap {
                reason: format!(
                    "grid pols ({}), cf planes ({}) and conjugate cf planes ({}) must have the same length",
                    grid_pols.len(),
                    cf_planes.len(),
                    conj_cf_planes.len()
                ),
            });
        }
        Ok(Self {
            grid_pols,
            cf_planes,
            conj_cf_planes,
        })
    }

    /// Data pol `i` goes to grid pol `i`, and every pol uses kernel plane 0.
    pub fn identity(num_pols: usize) -> Self {
        Self {
            grid_pols: (0..num_pols).map(Some).collect(),
            cf_planes: vec![0; num_pols],
            conj_cf_planes: vec![0; num_pols],
        }
    }

    /// The grid polarization for a data polarization, if it has one.
    #[inline]
    pub fn grid_pol(&self, data_pol: usize) -> Option<usize> {
        self.grid_pols.get(data_pol).copied().flatten()
    }

    /// The kernel plane for a data polarization.
    #[inline]
    pub fn cf_plane(&self, data_pol: usize, conjugate: bool) -> usize {
        if conjugate {
            self.conj_cf_planes[data_pol]
        } else {
            self.cf_planes[data_pol]
        }
    }

    /// The number of data polarizations this maps
    pub fn len(&self) -> usize {
        self.grid_pols.len()
    }

    /// True if this maps no polarizations
    pub fn is_empty(&self) -> bool {
        self.grid_pols.is_empty()
    }

    fn max_cf_plane(&self) -> Option<usize> {
        self.cf_planes
            .iter()
            .chain(self.conj_cf_planes.iter())
            .copied()
            .max()
    }
}

/// Options for resampling visibilities onto a grid
#[derive(Builder, Debug, Clone)]
pub struct ResamplerConfig {
    /// Converts `[u, v, w]` in wavelengths to grid units. For an `nx` × `ny`
    /// image with cells of `cell_rad` radians, this is
    /// `[nx * cell_rad, ny * cell_rad, w_scale]`.
    pub uvw_scale: [f64; 3],
    /// Added after scaling; the grid position of zero spacing, usually
    /// `[nx / 2, ny / 2, 0]`.
    #[builder(default = "[0.0; 3]")]
    pub offset: [f64; 3],
    /// Maps data channels to grid channels
    pub chan_map: ChannelMap,
    /// Maps data polarizations to grid polarizations and kernel planes
    pub pol_map: PolMap,
    /// Kernel offsets are only rotated when the parallactic angle of the data
    /// and the kernel differ by more than this \[radians\]
    #[builder(default = "0.0")]
    pub pa_tolerance_rad: f64,
}

impl ResamplerConfig {
    /// Check that the maps in this configuration fit the data and the kernel.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadChannelMap`] or
    /// [`ResamplerError::BadPolMap`] describing the mismatch.
    pub fn check(
        &self,
        num_chans: usize,
        num_pols: usize,
        num_cf_pol_planes: usize,
    ) -> Result<(), ResamplerError> {
        if self.chan_map.len() != num_chans {
            return Err(ResamplerError::BadChannelMap {
                expected: num_chans,
                found: self.chan_map.len(),
            });
        }
        if self.pol_map.len() != num_pols {
            return Err(ResamplerError::BadPolMap {
                reason: format!(
                    "expected {} data polarizations, found {}",
                    num_pols,
                    self.pol_map.len()
                ),
            });
        }
        if let Some(max_plane) = self.pol_map.max_cf_plane() {
            if max_plane >= num_cf_pol_planes {
                return Err(ResamplerError::BadPolMap {
                    reason: format!(
                        "kernel plane {} requested, but the convolution function only has {}",
                        max_plane, num_cf_pol_planes
                    ),
                });
            }
        }
        Ok(())
    }
}

impl Display for ResamplerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "uvw scale [{}], offset [{}].",
            self.uvw_scale.iter().join(", "),
            self.offset.iter().join(", ")
        )?;
        let num_mapped_chans = (0..self.chan_map.len())
            .filter(|&chan| self.chan_map.get(chan).is_some())
            .count();
        writeln!(
            f,
            "Will grid {} of {} channels.",
            num_mapped_chans,
            self.chan_map.len()
        )?;
        writeln!(
            f,
            "Will grid polarizations to [{}].",
            (0..self.pol_map.len())
                .map(|pol| match self.pol_map.grid_pol(pol) {
                    Some(grid_pol) => grid_pol.to_string(),
                    None => "-".to_string(),
                })
                .join(", ")
        )?;
        writeln!(
            f,
            "Will rotate kernels when the parallactic angle changes by more than {} rad.",
            self.pa_tolerance_rad
        )?;
        Ok(())
    }
}
