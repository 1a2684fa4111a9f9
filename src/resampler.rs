//! The single-threaded convolutional resampler.
//!
//! [`VisResampler`] moves visibilities between a [`VisBufferView`] and a grid
//! using the kernels of a [`CfSource`], which may be a single [`ConvFunc`]. Gridding convolves each visibility with the kernel and
//! adds it into the grid, degridding convolves the grid with the kernel to
//! predict a visibility. Both share the same geometry, so a sample which
//! grids into a set of cells degrids from exactly the same cells.

use std::sync::Arc;

use log::trace;

use crate::{
    config::ResamplerConfig,
    conv_func::{scale_for_channels, CfSource, ConvFunc, ScaledCf},
    geometry::{locate, on_grid, GridPoint, Rotation},
    ndarray::{ArrayView4, ArrayViewMut2, ArrayViewMut4},
    types::{complex_from_f64, complex_to_f64, GridFloat},
    vis_buffer::{RowMeta, VisBufferView, VisBufferViewMut},
    Complex, ResamplerError,
};

/// One unflagged (row, channel, polarization) sample which lands on the grid,
/// and the kernel it is resampled with.
struct Sample<'c, C: ConvFunc + ?Sized> {
    cf: &'c C,
    rotation: Option<Rotation>,
    row: usize,
    chan: usize,
    pol: usize,
    grid_pol: usize,
    grid_chan: usize,
    imaging_weight: f32,
    point: GridPoint,
    scaled: ScaledCf,
    w_plane: usize,
    cf_plane: usize,
    conjugate: bool,
}

impl<'c, C: ConvFunc + ?Sized> Sample<'c, C> {
    /// Call `visit` with the grid cell `(x, y)` and kernel weight of every tap
    /// in the scaled support window. Taps outside the kernel table are
    /// skipped.
    #[inline]
    fn for_each_tap<V>(&self, mut visit: V)
    where
        V: FnMut(usize, usize, Complex<f64>),
    {
        let [support_x, support_y] = self.scaled.support.map(|s| s as isize);
        let sampling = self.scaled.sampling as isize;
        for iy in -support_y..=support_y {
            for ix in -support_x..=support_x {
                let mut kernel_idx = (ix * sampling + self.point.off[0], iy * sampling + self.point.off[1]);
                if let Some(rotation) = self.rotation {
                    kernel_idx = rotation.apply(kernel_idx.0, kernel_idx.1);
                }
                let weight = match self.cf.weight(kernel_idx.0, kernel_idx.1, self.w_plane, self.cf_plane) {
                    Some(weight) => complex_to_f64(weight),
                    None => continue,
                };
                visit(
                    (self.point.loc[0] + ix) as usize,
                    (self.point.loc[1] + iy) as usize,
                    if self.conjugate { weight.conj() } else { weight },
                );
            }
        }
    }
}

/// What degridding does with its prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prediction {
    Replace,
    Subtract,
}

/// Grids and degrids visibilities on the calling thread.
#[derive(Debug, Clone)]
pub struct VisResampler {
    config: Arc<ResamplerConfig>,
}

impl VisResampler {
    /// Create a new resampler sharing `config`.
    pub fn new(config: Arc<ResamplerConfig>) -> Self {
        Self { config }
    }

    /// The configuration in use
    pub fn config(&self) -> &ResamplerConfig {
        &self.config
    }

    /// Replace the configuration used by later calls.
    pub fn set_config(&mut self, config: Arc<ResamplerConfig>) {
        self.config = config;
    }

    /// Convolve every unflagged visibility in `rows` onto `grid`, and add its
    /// imaging weight into `sumwt`. Each row is convolved with the kernel
    /// `cfs` picks for it.
    ///
    /// With `do_psf`, each sample deposits its imaging weight instead of its
    /// visibility, which grids the point spread function.
    ///
    /// `grid` is `[nx, ny, pol, chan]` and `sumwt` is `[pol, chan]` for the
    /// same grid polarizations and channels.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadArrayShape`] if `rows` is internally
    /// inconsistent or `sumwt` doesn't match `grid`, and
    /// [`ResamplerError::BadChannelMap`] or [`ResamplerError::BadPolMap`] if
    /// the maps don't fit the data or the kernels,
    /// [`ResamplerError::BadFrequency`] if a channel frequency isn't finite and
    /// positive, and [`ResamplerError::BadConvFunc`] if a row has no kernel.
    /// Nothing is written when an error is returned.
    pub fn data_to_grid<F, S>(
        &self,
        mut grid: ArrayViewMut4<Complex<F>>,
        rows: &VisBufferView,
        mut sumwt: ArrayViewMut2<f64>,
        do_psf: bool,
        cfs: &S,
    ) -> Result<(), ResamplerError>
    where
        F: GridFloat,
        S: CfSource + ?Sized,
    {
        trace!("start data_to_grid");
        rows.check_shapes("data_to_grid")?;
        self.check_config(&rows.meta, cfs)?;
        let (_, _, num_grid_pols, num_grid_chans) = grid.dim();
        if sumwt.dim() != (num_grid_pols, num_grid_chans) {
            return Err(ResamplerError::BadArrayShape {
                argument: "sumwt".to_string(),
                function: "data_to_grid".to_string(),
                expected: format!("{:?}", (num_grid_pols, num_grid_chans)),
                received: format!("{:?}", sumwt.dim()),
            });
        }

        let grid_dim = grid.dim();
        self.for_each_sample(&rows.meta, grid_dim, cfs, true, |sample| {
            let value = if do_psf {
                Complex::new(sample.imaging_weight as f64, 0.0)
            } else {
                complex_to_f64(rows.vis[(sample.pol, sample.chan, sample.row)])
                    * sample.imaging_weight as f64
                    * sample.point.phasor
            };
            sample.for_each_tap(|x, y, weight| {
                grid[(x, y, sample.grid_pol, sample.grid_chan)] +=
                    complex_from_f64::<F>(value * weight);
            });
            sumwt[(sample.grid_pol, sample.grid_chan)] += sample.imaging_weight as f64;
        });
        trace!("end data_to_grid");
        Ok(())
    }

    /// Overwrite every unflagged visibility in `rows` with its prediction from
    /// `grid`.
    ///
    /// The prediction is the kernel-weighted mean of the grid cells under the
    /// kernel, with the phase correction undone. Samples which land off the
    /// grid, or whose kernel weights sum to zero, are left untouched.
    ///
    /// # Errors
    ///
    /// See [`VisResampler::data_to_grid`].
    pub fn grid_to_data<F, S>(
        &self,
        rows: VisBufferViewMut,
        grid: ArrayView4<Complex<F>>,
        cfs: &S,
    ) -> Result<(), ResamplerError>
    where
        F: GridFloat,
        S: CfSource + ?Sized,
    {
        trace!("start grid_to_data");
        self.degrid(rows, grid, cfs, Prediction::Replace, "grid_to_data")?;
        trace!("end grid_to_data");
        Ok(())
    }

    /// Subtract the prediction from the model `grid` from every unflagged
    /// visibility in `rows`, leaving the residual. Uses the same prediction as
    /// [`VisResampler::grid_to_data`].
    ///
    /// # Errors
    ///
    /// See [`VisResampler::data_to_grid`].
    pub fn compute_residuals<F, S>(
        &self,
        rows: VisBufferViewMut,
        grid: ArrayView4<Complex<F>>,
        cfs: &S,
    ) -> Result<(), ResamplerError>
    where
        F: GridFloat,
        S: CfSource + ?Sized,
    {
        trace!("start compute_residuals");
        self.degrid(rows, grid, cfs, Prediction::Subtract, "compute_residuals")?;
        trace!("end compute_residuals");
        Ok(())
    }

    /// Check the configuration against a block of rows and every kernel
    /// they could use.
    pub(crate) fn check_config<S: CfSource + ?Sized>(
        &self,
        meta: &RowMeta,
        cfs: &S,
    ) -> Result<(), ResamplerError> {
        meta.check_freqs()?;
        for idx in 0..cfs.num_cfs() {
            self.config
                .check(meta.num_chans(), meta.num_pols(), cfs.cf(idx).num_pol_planes())?;
        }
        cfs.check_rows(meta)
    }

    fn degrid<F, S>(
        &self,
        rows: VisBufferViewMut,
        grid: ArrayView4<Complex<F>>,
        cfs: &S,
        prediction: Prediction,
        function: &str,
    ) -> Result<(), ResamplerError>
    where
        F: GridFloat,
        S: CfSource + ?Sized,
    {
        rows.check_shapes(function)?;
        self.check_config(&rows.meta, cfs)?;

        let VisBufferViewMut { meta, mut vis } = rows;
        self.for_each_sample(&meta, grid.dim(), cfs, false, |sample| {
            let mut sum = Complex::new(0.0, 0.0);
            let mut norm = Complex::new(0.0, 0.0);
            sample.for_each_tap(|x, y, weight| {
                sum += weight * complex_to_f64(grid[(x, y, sample.grid_pol, sample.grid_chan)]);
                norm += weight;
            });
            if norm.norm_sqr() == 0.0 {
                return;
            }
            let predicted: Complex<f32> = complex_from_f64(sum / norm * sample.point.phasor.conj());
            let vis = &mut vis[(sample.pol, sample.chan, sample.row)];
            match prediction {
                Prediction::Replace => *vis = predicted,
                Prediction::Subtract => *vis -= predicted,
            }
        });
        Ok(())
    }

    fn rotation<C: ConvFunc + ?Sized>(&self, meta: &RowMeta, cf: &C) -> Option<Rotation> {
        Rotation::between(meta.pa_rad, cf.pa_rad(), self.config.pa_tolerance_rad)
    }

    /// Visit every sample in `meta` which is unflagged, mapped to a grid
    /// channel and polarization within `grid_dim`, and whose kernel footprint
    /// fits on the grid. With `skip_unweighted`, samples with zero imaging
    /// weight are skipped too.
    fn for_each_sample<S, V>(
        &self,
        meta: &RowMeta,
        grid_dim: (usize, usize, usize, usize),
        cfs: &S,
        skip_unweighted: bool,
        mut visit: V,
    ) where
        S: CfSource + ?Sized,
        V: FnMut(&Sample<S::Cf>),
    {
        let (nx, ny, num_grid_pols, num_grid_chans) = grid_dim;
        let config = &self.config;
        // every kernel, rescaled to every channel, and rotated to the chunk
        let kernels: Vec<(Vec<ScaledCf>, Option<Rotation>)> = (0..cfs.num_cfs())
            .map(|idx| {
                let cf = cfs.cf(idx);
                (scale_for_channels(cf, meta.freqs_hz), self.rotation(meta, cf))
            })
            .collect();

        for row in 0..meta.num_rows() {
            if meta.row_flags[row] {
                continue;
            }
            let (cf, (scaled_cfs, rotation)) = match cfs
                .cf_idx(meta, row)
                .and_then(|idx| kernels.get(idx).map(|kernel| (cfs.cf(idx), kernel)))
            {
                Some(kernel) => kernel,
                None => continue,
            };
            let num_w_planes = cf.num_w_planes();
            let uvw_m = meta.uvw_m(row);
            let conjugate = uvw_m[2] > 0.0;
            for (chan, scaled) in scaled_cfs.iter().enumerate() {
                let imaging_weight = meta.imaging_weights[(chan, row)];
                if skip_unweighted && imaging_weight == 0.0 {
                    continue;
                }
                let grid_chan = match config.chan_map.get(chan) {
                    Some(grid_chan) if grid_chan < num_grid_chans => grid_chan,
                    _ => continue,
                };
                let point = match locate(
                    uvw_m,
                    meta.freqs_hz[chan],
                    meta.phase_corrections[row],
                    &config.uvw_scale,
                    &config.offset,
                    scaled.sampling,
                ) {
                    Some(point) => point,
                    None => continue,
                };
                if !on_grid(nx, ny, num_w_planes, &point.loc, scaled.support) {
                    continue;
                }
                for pol in 0..meta.num_pols() {
                    if meta.flags[(pol, chan, row)] {
                        continue;
                    }
                    let grid_pol = match config.pol_map.grid_pol(pol) {
                        Some(grid_pol) if grid_pol < num_grid_pols => grid_pol,
                        _ => continue,
                    };
                    visit(&Sample {
                        cf,
                        rotation: *rotation,
                        row,
                        chan,
                        pol,
                        grid_pol,
                        grid_chan,
                        imaging_weight,
                        point,
                        scaled: *scaled,
                        w_plane: point.loc[2] as usize,
                        cf_plane: config.pol_map.cf_plane(pol, conjugate),
                        conjugate,
                    });
                }
            }
        }
    }
}
