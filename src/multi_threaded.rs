//! Resampling spread over a fixed pool of worker threads.
//!
//! Rows are split into one contiguous, non-overlapping range per worklet.
//! Kernel footprints of different rows overlap on the grid, so each worklet
//! grids into its own private grid and weights, and these are summed back into
//! the caller's once every worklet is done. Degridding only reads the grid,
//! and every worklet writes a disjoint range of rows, so it needs no private
//! copies.
//!
//! # Examples
//!
//! ```rust
//! use visresample::{
//!     ndarray::{Array1, Array2, Array4},
//!     sim::{gaussian_cf, imaging_config, spiral_rows},
//!     Complex, MultiThreadedResampler,
//! };
//!
//! let freqs_hz = Array1::from(vec![150e6, 151e6]);
//! let rows = spiral_rows(1000, 1, freqs_hz, 50.0, [0.0, 0.0]);
//! let config = imaging_config(64, 5e-3, 2, 1, 1, 0.0).unwrap();
//! let cf = gaussian_cf(3, 8, 1, 150e6).unwrap();
//!
//! let grid_shape = (64, 64, 1, 2);
//! let mut resampler = MultiThreadedResampler::<f32>::new(config, 4, grid_shape).unwrap();
//! let mut grid = Array4::<Complex<f32>>::zeros(grid_shape);
//! let mut sumwt = Array2::zeros((1, 2));
//! resampler
//!     .data_to_grid(grid.view_mut(), &rows.view(), sumwt.view_mut(), false, &cf)
//!     .unwrap();
//! assert!(sumwt.sum() > 0.0);
//! ```

use std::{collections::HashMap, fmt::Display, sync::Arc, time::Duration};

use log::{debug, trace};
use rayon::prelude::*;

use crate::{
    config::{ChannelMap, PolMap, ResamplerConfig},
    conv_func::CfSource,
    ndarray::{ArrayView2, ArrayView4, ArrayViewMut2, ArrayViewMut4, Zip},
    resampler::VisResampler,
    types::GridFloat,
    vis_buffer::{VisBufferView, VisBufferViewMut},
    with_increment_duration,
    workers::{ResamplerWorklet, ThreadCoordinator, WorkUnit, WorkletReport},
    Complex, ResamplerError,
};

/// Where a [`MultiThreadedResampler`] is in a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// between calls
    Idle,
    /// checking inputs, resetting buffers and splitting rows
    Dispatching,
    /// blocked until every worklet reports
    AwaitingWorkers,
    /// summing private grids into the caller's
    Gathering,
}

impl Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DispatchState::Idle => "idle",
                DispatchState::Dispatching => "dispatching",
                DispatchState::AwaitingWorkers => "awaiting workers",
                DispatchState::Gathering => "gathering",
            }
        )
    }
}

/// Grids and degrids visibilities with a fixed pool of worker threads.
///
/// With a single thread, no pool is built and every call runs directly on the
/// caller's thread.
#[derive(Debug)]
pub struct MultiThreadedResampler<F: GridFloat> {
    config: Arc<ResamplerConfig>,
    resampler: VisResampler,
    num_threads: usize,
    grid_shape: (usize, usize, usize, usize),
    coordinator: Option<ThreadCoordinator>,
    worklets: Vec<ResamplerWorklet<F>>,
    state: DispatchState,
    terminated: bool,
    durations: HashMap<String, Duration>,
}

impl<F: GridFloat> MultiThreadedResampler<F> {
    /// Create a resampler which uses `num_threads` threads, gridding onto grids
    /// of `grid_shape` (`[nx, ny, pol, chan]`).
    ///
    /// With more than one thread, this builds the pool, and allocates a
    /// private grid of `grid_shape` for every thread.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::ThreadPool`] if the pool can't be built.
    pub fn new(
        config: ResamplerConfig,
        num_threads: usize,
        grid_shape: (usize, usize, usize, usize),
    ) -> Result<Self, ResamplerError> {
        trace!("start MultiThreadedResampler::new");
        let num_threads = num_threads.max(1);
        let config = Arc::new(config);
        let (coordinator, worklets) = if num_threads > 1 {
            let coordinator = ThreadCoordinator::new(num_threads)?;
            let worklets = (0..num_threads)
                .map(|idx| ResamplerWorklet::new(idx, config.clone(), grid_shape))
                .collect();
            (Some(coordinator), worklets)
        } else {
            (None, vec![])
        };
        debug!(
            "resampling with {} threads onto grids of {:?}",
            num_threads, grid_shape
        );
        trace!("end MultiThreadedResampler::new");
        Ok(Self {
            resampler: VisResampler::new(config.clone()),
            config,
            num_threads,
            grid_shape,
            coordinator,
            worklets,
            state: DispatchState::Idle,
            terminated: false,
            durations: HashMap::new(),
        })
    }

    /// The number of threads work is spread over
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// The shape of grid this resampler grids onto, `[nx, ny, pol, chan]`
    pub fn grid_shape(&self) -> (usize, usize, usize, usize) {
        self.grid_shape
    }

    /// The configuration in use
    pub fn config(&self) -> &ResamplerConfig {
        &self.config
    }

    /// Where this resampler is in a call. Always [`DispatchState::Idle`]
    /// between calls.
    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Time spent in each phase of every call so far.
    pub fn durations(&self) -> &HashMap<String, Duration> {
        &self.durations
    }

    /// Use `config` for all later calls, on every thread.
    pub fn set_config(&mut self, config: ResamplerConfig) {
        trace!("set_config");
        let config = Arc::new(config);
        self.resampler.set_config(config.clone());
        for worklet in &mut self.worklets {
            worklet.set_config(config.clone());
        }
        self.config = config;
    }

    /// Change how `[u, v, w]` is scaled and offset onto the grid.
    pub fn set_params(&mut self, uvw_scale: [f64; 3], offset: [f64; 3]) {
        let mut config = (*self.config).clone();
        config.uvw_scale = uvw_scale;
        config.offset = offset;
        self.set_config(config);
    }

    /// Change which grid channels and polarizations the data lands on.
    pub fn set_maps(&mut self, chan_map: ChannelMap, pol_map: PolMap) {
        let mut config = (*self.config).clone();
        config.chan_map = chan_map;
        config.pol_map = pol_map;
        self.set_config(config);
    }

    /// Split `rows` into one contiguous sub-view per thread, without copying.
    pub fn scatter<'a>(&mut self, rows: &VisBufferView<'a>) -> Vec<VisBufferView<'a>> {
        let num_threads = self.num_threads;
        with_increment_duration!(self.durations, "scatter", rows.scatter(num_threads))
    }

    /// Reset every worklet's private accumulators before gridding.
    ///
    /// The first worklet starts from the caller's `grid` and `sumwt`, and the
    /// rest start from zero, so [`MultiThreadedResampler::gather_grids`] can
    /// overwrite the caller's buffers with the sum of the private ones.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::PoolTerminated`] after
    /// [`MultiThreadedResampler::terminate`].
    pub fn initialize_put_buffers(
        &mut self,
        grid: ArrayView4<Complex<F>>,
        sumwt: ArrayView2<f64>,
    ) -> Result<(), ResamplerError> {
        let coordinator = match self.coordinator.as_ref() {
            Some(coordinator) => coordinator,
            None => return Ok(()),
        };
        let worklets = &mut self.worklets;
        with_increment_duration!(
            self.durations,
            "initialize",
            coordinator.install(|| {
                worklets.par_iter_mut().for_each(|worklet| {
                    let seed = (worklet.idx() == 0).then(|| (grid, sumwt));
                    worklet.reset_buffers(seed);
                });
            })?
        );
        Ok(())
    }

    /// Overwrite `grid` and `sumwt` with the sum of every worklet's private
    /// accumulators.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::PoolTerminated`] after
    /// [`MultiThreadedResampler::terminate`].
    pub fn gather_grids(
        &mut self,
        mut grid: ArrayViewMut4<Complex<F>>,
        mut sumwt: ArrayViewMut2<f64>,
    ) -> Result<(), ResamplerError> {
        let coordinator = match self.coordinator.as_ref() {
            Some(coordinator) => coordinator,
            None => return Ok(()),
        };
        let worklets = &self.worklets;
        with_increment_duration!(
            self.durations,
            "gather",
            coordinator.install(|| {
                grid.fill(Complex::new(F::zero(), F::zero()));
                sumwt.fill(0.0);
                for worklet in worklets {
                    Zip::from(&mut grid)
                        .and(worklet.grid())
                        .par_for_each(|total, &partial| *total += partial);
                    sumwt += worklet.sumwt();
                }
            })?
        );
        Ok(())
    }

    /// Grid every unflagged visibility in `rows` onto `grid`, adding imaging
    /// weights into `sumwt`. See [`VisResampler::data_to_grid`].
    ///
    /// `grid` must have the shape given to [`MultiThreadedResampler::new`].
    /// Its existing contents are kept, and the new contributions added.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadArrayShape`] if `grid` or `sumwt`
    /// don't match the shape given to [`MultiThreadedResampler::new`], any
    /// error [`VisResampler::data_to_grid`] would return, and
    /// [`ResamplerError::PoolTerminated`] after
    /// [`MultiThreadedResampler::terminate`]. Nothing is written when an error
    /// is returned.
    pub fn data_to_grid<S: CfSource + ?Sized>(
        &mut self,
        mut grid: ArrayViewMut4<Complex<F>>,
        rows: &VisBufferView,
        mut sumwt: ArrayViewMut2<f64>,
        do_psf: bool,
        cfs: &S,
    ) -> Result<(), ResamplerError> {
        trace!("start MultiThreadedResampler::data_to_grid");
        self.check_not_terminated()?;
        self.check_grid_shapes(&grid.view(), &sumwt.view())?;
        if self.coordinator.is_none() {
            return self
                .resampler
                .data_to_grid(grid, rows, sumwt, do_psf, cfs);
        }

        self.state = DispatchState::Dispatching;
        let result = self.grid_with_workers(grid.view_mut(), rows, sumwt.view_mut(), do_psf, cfs);
        self.state = DispatchState::Idle;
        result?;
        trace!("end MultiThreadedResampler::data_to_grid");
        Ok(())
    }

    /// Overwrite every unflagged visibility in `rows` with its prediction from
    /// `grid`. See [`VisResampler::grid_to_data`].
    ///
    /// # Errors
    ///
    /// Will return any error [`VisResampler::grid_to_data`] would return, and
    /// [`ResamplerError::PoolTerminated`] after
    /// [`MultiThreadedResampler::terminate`].
    pub fn grid_to_data<'a, S: CfSource + ?Sized>(
        &mut self,
        rows: VisBufferViewMut<'a>,
        grid: ArrayView4<'a, Complex<F>>,
        cfs: &S,
    ) -> Result<(), ResamplerError> {
        trace!("start MultiThreadedResampler::grid_to_data");
        self.check_not_terminated()?;
        if self.coordinator.is_none() {
            return self.resampler.grid_to_data(rows, grid, cfs);
        }
        self.degrid_with_workers(rows, grid, cfs, false)?;
        trace!("end MultiThreadedResampler::grid_to_data");
        Ok(())
    }

    /// Subtract the prediction from the model `grid` from every unflagged
    /// visibility in `rows`. See [`VisResampler::compute_residuals`].
    ///
    /// # Errors
    ///
    /// See [`MultiThreadedResampler::grid_to_data`].
    pub fn compute_residuals<'a, S: CfSource + ?Sized>(
        &mut self,
        rows: VisBufferViewMut<'a>,
        grid: ArrayView4<'a, Complex<F>>,
        cfs: &S,
    ) -> Result<(), ResamplerError> {
        trace!("start MultiThreadedResampler::compute_residuals");
        self.check_not_terminated()?;
        if self.coordinator.is_none() {
            return self.resampler.compute_residuals(rows, grid, cfs);
        }
        self.degrid_with_workers(rows, grid, cfs, true)?;
        trace!("end MultiThreadedResampler::compute_residuals");
        Ok(())
    }

    /// Tell every worker to quit, and shut the pool down. Every later call
    /// returns [`ResamplerError::PoolTerminated`].
    ///
    /// # Errors
    ///
    /// Will return an error if a worker couldn't be told to quit.
    pub fn terminate(&mut self) -> Result<(), ResamplerError> {
        trace!("terminate");
        self.terminated = true;
        match self.coordinator.as_mut() {
            Some(coordinator) => coordinator.terminate(&mut self.worklets),
            None => Ok(()),
        }
    }

    fn check_not_terminated(&self) -> Result<(), ResamplerError> {
        if self.terminated {
            Err(ResamplerError::PoolTerminated)
        } else {
            Ok(())
        }
    }

    /// Check everything the worklets would check, so that a bad call fails
    /// before any buffer is touched.
    fn check_inputs<S: CfSource + ?Sized>(
        &self,
        rows: &VisBufferView,
        cfs: &S,
        function: &str,
    ) -> Result<(), ResamplerError> {
        rows.check_shapes(function)?;
        self.resampler.check_config(&rows.meta, cfs)
    }

    /// The caller's grid and weights must match the private ones, whatever
    /// the number of threads.
    fn check_grid_shapes(
        &self,
        grid: &ArrayView4<Complex<F>>,
        sumwt: &ArrayView2<f64>,
    ) -> Result<(), ResamplerError> {
        let (_, _, num_pols, num_chans) = self.grid_shape;
        for (argument, expected, received) in [
            ("grid", format!("{:?}", self.grid_shape), format!("{:?}", grid.dim())),
            ("sumwt", format!("{:?}", (num_pols, num_chans)), format!("{:?}", sumwt.dim())),
        ] {
            if expected != received {
                return Err(ResamplerError::BadArrayShape {
                    argument: argument.to_string(),
                    function: "MultiThreadedResampler::data_to_grid".to_string(),
                    expected,
                    received,
                });
            }
        }
        Ok(())
    }

    fn grid_with_workers<S: CfSource + ?Sized>(
        &mut self,
        grid: ArrayViewMut4<Complex<F>>,
        rows: &VisBufferView,
        sumwt: ArrayViewMut2<f64>,
        do_psf: bool,
        cfs: &S,
    ) -> Result<(), ResamplerError> {
        self.check_inputs(rows, cfs, "data_to_grid")?;

        self.initialize_put_buffers(grid.view(), sumwt.view())?;
        let units = self
            .scatter(rows)
            .into_iter()
            .map(|rows| WorkUnit::Grid { rows, do_psf })
            .collect();

        self.state = DispatchState::AwaitingWorkers;
        self.dispatch(units, cfs)?;

        self.state = DispatchState::Gathering;
        self.gather_grids(grid, sumwt)
    }

    fn degrid_with_workers<'a, S: CfSource + ?Sized>(
        &mut self,
        rows: VisBufferViewMut<'a>,
        grid: ArrayView4<'a, Complex<F>>,
        cfs: &S,
        subtract: bool,
    ) -> Result<(), ResamplerError> {
        let function = if subtract { "compute_residuals" } else { "grid_to_data" };
        self.state = DispatchState::Dispatching;
        let result = self.check_inputs(&rows.view(), cfs, function).and_then(|()| {
            let num_threads = self.num_threads;
            let units = with_increment_duration!(
                self.durations,
                "scatter",
                rows.scatter(num_threads)
            )
            .into_iter()
            .map(|rows| {
                if subtract {
                    WorkUnit::ComputeResiduals { rows, grid }
                } else {
                    WorkUnit::Degrid { rows, grid }
                }
            })
            .collect();
            self.state = DispatchState::AwaitingWorkers;
            self.dispatch(units, cfs).map(|_| ())
        });
        self.state = DispatchState::Idle;
        result
    }

    fn dispatch<S: CfSource + ?Sized>(
        &mut self,
        units: Vec<WorkUnit<F>>,
        cfs: &S,
    ) -> Result<Vec<WorkletReport>, ResamplerError> {
        let coordinator = self
            .coordinator
            .as_ref()
            .ok_or(ResamplerError::PoolTerminated)?;
        let worklets = &mut self.worklets;
        Ok(with_increment_duration!(
            self.durations,
            "dispatch",
            coordinator.dispatch(worklets, units, cfs)?
        ))
    }
}

impl<F: GridFloat> Drop for MultiThreadedResampler<F> {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            debug!("error terminating worker pool: {}", err);
        }
    }
}
