//! One worker's share of a multi-threaded resampling session.

use std::{
    fmt::Display,
    sync::Arc,
    time::{Duration, Instant},
};

use log::trace;

use crate::{
    config::ResamplerConfig,
    conv_func::CfSource,
    ndarray::{ArrayView2, ArrayView4},
    resampler::VisResampler,
    types::{Grid, GridFloat, SumWeights},
    vis_buffer::{VisBufferView, VisBufferViewMut},
    Complex, ResamplerError,
};

/// What a worklet is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkletState {
    /// parked, ready for the next unit of work
    WaitingForWork,
    /// gridding its rows into its private grid
    Gridding,
    /// predicting its rows from the shared grid
    Degridding,
    /// subtracting predictions from its rows
    ComputingResiduals,
    /// told to quit, will never work again
    Terminated,
}

/// The kind of work dispatched to every worklet at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkTag {
    /// grid rows into private accumulators
    Grid,
    /// overwrite rows with predictions from a shared grid
    Degrid,
    /// subtract predictions from a shared grid from rows
    ComputeResiduals,
    /// stop working
    Quit,
}

impl Display for WorkTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                WorkTag::Grid => "grid",
                WorkTag::Degrid => "degrid",
                WorkTag::ComputeResiduals => "residuals",
                WorkTag::Quit => "quit",
            }
        )
    }
}

/// One worklet's unit of work: a tag, and the rows to do it to.
#[derive(Debug)]
pub enum WorkUnit<'a, F: GridFloat> {
    /// Grid `rows` into the worklet's private accumulators.
    Grid {
        /// rows to grid
        rows: VisBufferView<'a>,
        /// deposit imaging weights instead of visibilities
        do_psf: bool,
    },
    /// Overwrite `rows` with predictions from `grid`.
    Degrid {
        /// rows to predict
        rows: VisBufferViewMut<'a>,
        /// the shared model grid
        grid: ArrayView4<'a, Complex<F>>,
    },
    /// Subtract predictions from `grid` from `rows`.
    ComputeResiduals {
        /// rows to subtract from
        rows: VisBufferViewMut<'a>,
        /// the shared model grid
        grid: ArrayView4<'a, Complex<F>>,
    },
    /// Stop working.
    Quit,
}

impl<'a, F: GridFloat> WorkUnit<'a, F> {
    /// The tag for this unit
    pub fn tag(&self) -> WorkTag {
        match self {
            WorkUnit::Grid { .. } => WorkTag::Grid,
            WorkUnit::Degrid { .. } => WorkTag::Degrid,
            WorkUnit::ComputeResiduals { .. } => WorkTag::ComputeResiduals,
            WorkUnit::Quit => WorkTag::Quit,
        }
    }

    /// The number of rows in this unit
    pub fn num_rows(&self) -> usize {
        match self {
            WorkUnit::Grid { rows, .. } => rows.meta.num_rows(),
            WorkUnit::Degrid { rows, .. } | WorkUnit::ComputeResiduals { rows, .. } => {
                rows.meta.num_rows()
            }
            WorkUnit::Quit => 0,
        }
    }
}

/// What a worklet sends back when it finishes a unit of work.
#[derive(Debug, Clone)]
pub struct WorkletReport {
    /// which worklet this came from
    pub worklet_idx: usize,
    /// the work that was done
    pub tag: WorkTag,
    /// how many rows were processed
    pub num_rows: usize,
    /// how long it took
    pub duration: Duration,
}

/// A private [`VisResampler`], and the private grid and weights it grids into.
///
/// These are allocated once, when the pool is built, and reused for every
/// unit of work.
#[derive(Debug)]
pub struct ResamplerWorklet<F: GridFloat> {
    idx: usize,
    state: WorkletState,
    resampler: VisResampler,
    grid: Grid<F>,
    sumwt: SumWeights,
}

impl<F: GridFloat> ResamplerWorklet<F> {
    /// Create worklet `idx`, with private accumulators for a grid of
    /// `grid_shape` (`[nx, ny, pol, chan]`).
    pub fn new(
        idx: usize,
        config: Arc<ResamplerConfig>,
        grid_shape: (usize, usize, usize, usize),
    ) -> Self {
        let (_, _, num_pols, num_chans) = grid_shape;
        Self {
            idx,
            state: WorkletState::WaitingForWork,
            resampler: VisResampler::new(config),
            grid: Grid::zeros(grid_shape),
            sumwt: SumWeights::zeros((num_pols, num_chans)),
        }
    }

    /// This worklet's index in the pool
    pub fn idx(&self) -> usize {
        self.idx
    }

    /// What this worklet is doing
    pub fn state(&self) -> WorkletState {
        self.state
    }

    /// The private grid
    pub fn grid(&self) -> &Grid<F> {
        &self.grid
    }

    /// The private sum of weights
    pub fn sumwt(&self) -> &SumWeights {
        &self.sumwt
    }

    /// Use `config` for all later work.
    pub fn set_config(&mut self, config: Arc<ResamplerConfig>) {
        self.resampler.set_config(config);
    }

    /// Reset the private accumulators before gridding: copy in `seed` if
    /// given, otherwise zero them.
    pub fn reset_buffers(&mut self, seed: Option<(ArrayView4<Complex<F>>, ArrayView2<f64>)>) {
        match seed {
            Some((grid, sumwt)) => {
                self.grid.assign(&grid);
                self.sumwt.assign(&sumwt);
            }
            None => {
                self.grid.fill(Complex::new(F::zero(), F::zero()));
                self.sumwt.fill(0.0);
            }
        }
    }

    /// Do one unit of work, taking every row's kernel from `cfs`.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::PoolTerminated`] if this worklet has been
    /// told to quit, and otherwise any error from the underlying
    /// [`VisResampler`] call.
    pub fn run<S: CfSource + ?Sized>(
        &mut self,
        unit: WorkUnit<F>,
        cfs: &S,
    ) -> Result<WorkletReport, ResamplerError> {
        if self.state == WorkletState::Terminated {
            return Err(ResamplerError::PoolTerminated);
        }
        let start = Instant::now();
        let tag = unit.tag();
        let num_rows = unit.num_rows();
        trace!("worklet {} start {} of {} rows", self.idx, tag, num_rows);

        let result = match unit {
            WorkUnit::Grid { rows, do_psf } => {
                self.state = WorkletState::Gridding;
                self.resampler.data_to_grid(
                    self.grid.view_mut(),
                    &rows,
                    self.sumwt.view_mut(),
                    do_psf,
                    cfs,
                )
            }
            WorkUnit::Degrid { rows, grid } => {
                self.state = WorkletState::Degridding;
                self.resampler.grid_to_data(rows, grid, cfs)
            }
            WorkUnit::ComputeResiduals { rows, grid } => {
                self.state = WorkletState::ComputingResiduals;
                self.resampler.compute_residuals(rows, grid, cfs)
            }
            WorkUnit::Quit => return Ok(self.quit()),
        };
        self.state = WorkletState::WaitingForWork;
        result?;

        trace!("worklet {} end {}", self.idx, tag);
        Ok(WorkletReport {
            worklet_idx: self.idx,
            tag,
            num_rows,
            duration: start.elapsed(),
        })
    }

    /// Stop working. Every later [`ResamplerWorklet::run`] fails.
    pub fn quit(&mut self) -> WorkletReport {
        trace!("worklet {} quit", self.idx);
        self.state = WorkletState::Terminated;
        WorkletReport {
            worklet_idx: self.idx,
            tag: WorkTag::Quit,
            num_rows: 0,
            duration: Duration::default(),
        }
    }
}
