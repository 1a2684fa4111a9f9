//! Command Line Interface for visresample
//!
//! The binary is a synthetic driver: it simulates a block of rows, grids it
//! in chunks with a pool of worker threads, predicts the rows back from the
//! grid, and subtracts the prediction. Nothing is read from or written to
//! disk, so it doubles as a quick benchmark of the resampler.

use std::{
    cmp::Ordering,
    collections::HashMap,
    convert::Into,
    ffi::OsString,
    fmt::{Debug, Display},
    iter,
    str::FromStr,
    time::Duration,
};

use clap::{
    arg, command, ArgMatches,
    ErrorKind::{ArgumentNotFound, DisplayHelp, DisplayVersion},
};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use log::{debug, info, trace};
use prettytable::{format as prettyformat, row, table, Cell, Row, Table};

use crate::{
    config::ChannelMap,
    constants::{DEFAULT_ROWS_PER_CHUNK, VEL_C},
    error::{CLIError::InvalidCommandLineArgument, ResamplerError, ResamplerError::DryRun},
    ndarray::{Array1, ArrayView3},
    sim::{gaussian_cf, imaging_config, max_baseline_m, spiral_rows},
    types::{Grid, GridFloat, SumWeights},
    with_increment_duration, Complex, MultiThreadedResampler,
};

/// Where the simulated point source sits, in direction cosines.
const SOURCE_LM: [f64; 2] = [0.01, -0.005];

/// Radians per arcsecond
const ARCSEC_RAD: f64 = std::f64::consts::PI / (180.0 * 3600.0);

/// Args for a synthetic resampling run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResamplerContext {
    /// number of worker threads
    pub num_threads: usize,
    /// number of simulated rows
    pub num_rows: usize,
    /// number of data channels
    pub num_chans: usize,
    /// number of grid channels the data channels are folded onto
    pub num_grid_chans: usize,
    /// number of polarizations
    pub num_pols: usize,
    /// width and height of the grid in cells
    pub image_size: usize,
    /// image cell size \[radians\]
    pub cell_rad: f64,
    /// kernel half-width in grid cells
    pub support: usize,
    /// kernel oversampling factor
    pub sampling: usize,
    /// number of w planes in the kernel
    pub num_w_planes: usize,
    /// frequency of the first channel \[Hz\]
    pub freq_hz: f64,
    /// channel width \[Hz\]
    pub chan_width_hz: f64,
    /// rows handed to the resampler per call
    pub rows_per_chunk: usize,
    /// accumulate grids in double precision
    pub double_precision: bool,
    /// grid imaging weights instead of visibilities
    pub do_psf: bool,
    /// show progress bars
    pub draw_progress: bool,
}

impl Display for ResamplerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Will simulate {} rows * {} channels * {} polarizations, from {:.3} MHz in steps of {:.3} kHz.",
            self.num_rows,
            self.num_chans,
            self.num_pols,
            self.freq_hz / 1e6,
            self.chan_width_hz / 1e3,
        )?;
        writeln!(
            f,
            "Will grid onto {} x {} cells of {:.3} arcsec, {} grid channels, in {} precision.",
            self.image_size,
            self.image_size,
            self.cell_rad / ARCSEC_RAD,
            self.num_grid_chans,
            if self.double_precision {
                "double"
            } else {
                "single"
            },
        )?;
        writeln!(
            f,
            "Will convolve with a Gaussian kernel of support {}, oversampled {}x, with {} w planes.",
            self.support, self.sampling, self.num_w_planes,
        )?;
        writeln!(
            f,
            "Will {} with {} threads, {} rows at a time.",
            if self.do_psf {
                "grid the psf"
            } else {
                "grid visibilities"
            },
            self.num_threads,
            self.rows_per_chunk,
        )?;
        Ok(())
    }
}

/// Parse `name` as a strictly positive value. NaN is not positive.
fn parse_positive<T>(matches: &ArgMatches, name: &str) -> Result<T, ResamplerError>
where
    T: FromStr + PartialOrd + Default + Display,
    <T as FromStr>::Err: Display,
{
    let value = matches.value_of_t::<T>(name)?;
    if value.partial_cmp(&T::default()) != Some(Ordering::Greater) {
        return Err(ResamplerError::CLIError(InvalidCommandLineArgument {
            option: format!("--{}", name),
            expected: "a positive, non-zero number".into(),
            received: format!("{}", value),
        }));
    }
    Ok(value)
}

/// Parse `name` as a strictly positive value, or use `default` if it wasn't
/// given.
fn parse_positive_or<T>(matches: &ArgMatches, name: &str, default: T) -> Result<T, ResamplerError>
where
    T: FromStr + PartialOrd + Default + Display,
    <T as FromStr>::Err: Display,
{
    match parse_positive(matches, name) {
        Err(ResamplerError::ClapError(err)) if err.kind() == ArgumentNotFound => Ok(default),
        result => result,
    }
}

/// Root mean square amplitude of every visibility in `vis`.
fn rms(vis: ArrayView3<Complex<f32>>) -> f64 {
    if vis.is_empty() {
        return 0.0;
    }
    let sum_sqr: f64 = vis.iter().map(|v| v.norm_sqr() as f64).sum();
    (sum_sqr / vis.len() as f64).sqrt()
}

impl ResamplerContext {
    fn get_matches<I, T>(args: I) -> Result<ArgMatches, ResamplerError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        let mut app = command!()
            .next_line_help(false)
            .about(
                "Grid and degrid a simulated block of interferometric visibilities \
                 with a pool of worker threads.",
            )
            .args(&[
                // simulation options
                arg!(--rows <NUM> "Number of rows to simulate")
                    .required(false)
                    .default_value("10000")
                    .help_heading("SIMULATION"),
                arg!(--chans <NUM> "Number of channels to simulate")
                    .required(false)
                    .default_value("4")
                    .help_heading("SIMULATION"),
                arg!(--pols <NUM> "Number of polarizations to simulate")
                    .required(false)
                    .default_value("2")
                    .help_heading("SIMULATION"),
                arg!(--freq <MHZ> "Centre frequency of the first channel [MHz]")
                    .required(false)
                    .default_value("150")
                    .help_heading("SIMULATION"),
                arg!(--"chan-width" <KHZ> "Channel width [kHz]")
                    .required(false)
                    .default_value("1000")
                    .help_heading("SIMULATION"),
                // gridding options
                arg!(--"image-size" <CELLS> "Width and height of the grid")
                    .required(false)
                    .default_value("256")
                    .help_heading("GRIDDING"),
                arg!(--cell <ARCSEC> "Image cell size [arcsec]")
                    .required(false)
                    .default_value("60")
                    .help_heading("GRIDDING"),
                arg!(--"grid-chans" <NUM> "Fold the channels onto this many grid channels [default: --chans]")
                    .required(false)
                    .help_heading("GRIDDING"),
                arg!(--support <CELLS> "Kernel half-width in grid cells")
                    .required(false)
                    .default_value("3")
                    .help_heading("GRIDDING"),
                arg!(--sampling <FACTOR> "Kernel oversampling factor")
                    .required(false)
                    .default_value("8")
                    .help_heading("GRIDDING"),
                arg!(--"w-planes" <NUM> "Number of w planes in the kernel")
                    .required(false)
                    .default_value("1")
                    .help_heading("GRIDDING"),
                arg!(--f64 "Accumulate grids in double precision")
                    .help_heading("GRIDDING"),
                arg!(--psf "Grid imaging weights instead of visibilities")
                    .help_heading("GRIDDING"),
                // resource options
                arg!(--threads <NUM> "Number of worker threads [default: all cores]")
                    .required(false)
                    .help_heading("RESOURCES"),
                arg!(--"chunk-rows" <NUM> "Rows handed to the resampler per call [default: 8192]")
                    .required(false)
                    .help_heading("RESOURCES"),
                // misc
                arg!(--"dry-run" "Just print the summary and exit"),
                arg!(--"no-draw-progress" "do not show progress bars"),
            ]);
        let matches = app.try_get_matches_from_mut(args)?;
        Ok(matches)
    }

    /// Parse an iterator of arguments, `args` into a `ResamplerContext`.
    ///
    /// # Errors
    ///
    /// Can throw `ResamplerError` if the arguments could not be parsed, or
    /// describe an impossible run. `DryRun` is returned if the summary is all
    /// that was asked for.
    pub fn from_args<I, T>(args: I) -> Result<Self, ResamplerError>
    where
        I: IntoIterator<Item = T> + Debug,
        T: Into<OsString> + Clone,
    {
        debug!("args:\n{:?}", &args);

        let matches = Self::get_matches(args)?;
        trace!("arg matches:\n{:?}", &matches);

        let num_chans = parse_positive::<usize>(&matches, "chans")?;
        let num_grid_chans = match matches.value_of_t::<usize>("grid-chans") {
            // filter any errors other than ArgumentNotFound
            Err(err) if err.kind() != ArgumentNotFound => return Err(err.into()),
            Err(_) => num_chans,
            Ok(num_grid_chans) if num_grid_chans == 0 || num_grid_chans > num_chans => {
                return Err(ResamplerError::CLIError(InvalidCommandLineArgument {
                    option: "--grid-chans <NUM>".into(),
                    expected: format!("between 1 and the number of channels, {}", num_chans),
                    received: format!("{}", num_grid_chans),
                }));
            }
            Ok(num_grid_chans) => num_grid_chans,
        };
        let num_threads = parse_positive_or(
            &matches,
            "threads",
            std::thread::available_parallelism().map_or(1, |n| n.get()),
        )?;
        let chan_width_khz = matches.value_of_t::<f64>("chan-width")?;
        if !(chan_width_khz.is_finite() && chan_width_khz >= 0.0) {
            return Err(ResamplerError::CLIError(InvalidCommandLineArgument {
                option: "--chan-width <KHZ>".into(),
                expected: "a finite width of zero or more".into(),
                received: format!("{}", chan_width_khz),
            }));
        }
        let image_size = parse_positive::<usize>(&matches, "image-size")?;
        let support = matches.value_of_t::<usize>("support")?;
        if image_size <= 2 * (support + 1) {
            return Err(ResamplerError::CLIError(InvalidCommandLineArgument {
                option: "--image-size <CELLS>".into(),
                expected: format!("more than {} cells to fit the kernel", 2 * (support + 1)),
                received: format!("{}", image_size),
            }));
        }

        let result = Self {
            num_threads,
            num_rows: parse_positive(&matches, "rows")?,
            num_chans,
            num_grid_chans,
            num_pols: parse_positive(&matches, "pols")?,
            image_size,
            cell_rad: parse_positive::<f64>(&matches, "cell")? * ARCSEC_RAD,
            support,
            sampling: parse_positive(&matches, "sampling")?,
            num_w_planes: parse_positive(&matches, "w-planes")?,
            freq_hz: parse_positive::<f64>(&matches, "freq")? * 1e6,
            chan_width_hz: chan_width_khz * 1e3,
            rows_per_chunk: parse_positive_or(&matches, "chunk-rows", DEFAULT_ROWS_PER_CHUNK)?,
            double_precision: matches.is_present("f64"),
            do_psf: matches.is_present("psf"),
            draw_progress: !matches.is_present("no-draw-progress"),
        };

        info!("{}", &result);

        if matches.is_present("dry-run") {
            return Err(DryRun {});
        }

        Ok(result)
    }

    /// Simulate, grid, degrid and compute residuals, logging a summary.
    ///
    /// Returns how long each stage took, along with the resampler's own
    /// breakdown of where the time went.
    ///
    /// # Errors
    ///
    /// Can throw `ResamplerError` if the resampler can't be built or rejects
    /// the simulated rows.
    pub fn run(&self) -> Result<HashMap<String, Duration>, ResamplerError> {
        if self.double_precision {
            self.run_with::<f64>()
        } else {
            self.run_with::<f32>()
        }
    }

    fn run_with<F: GridFloat>(&self) -> Result<HashMap<String, Duration>, ResamplerError> {
        trace!("start ResamplerContext::run");
        let mut durations = HashMap::<String, Duration>::new();

        let freqs_hz = Array1::from_shape_fn(self.num_chans, |chan| {
            self.freq_hz + chan as f64 * self.chan_width_hz
        });
        let max_freq_hz = freqs_hz.fold(0.0_f64, |acc, &freq_hz| acc.max(freq_hz));
        let max_uv_m = max_baseline_m(self.image_size, self.cell_rad, self.support, max_freq_hz);
        // spiral_rows puts |w| at no more than a tenth of the baseline
        let max_w_lambda = 0.1 * max_uv_m * max_freq_hz / VEL_C;

        let (mut rows, cf) = with_increment_duration!(durations, "simulate", {
            let rows = spiral_rows(self.num_rows, self.num_pols, freqs_hz, max_uv_m, SOURCE_LM);
            let cf = gaussian_cf(self.support, self.sampling, self.num_w_planes, self.freq_hz)?;
            (rows, cf)
        });

        let mut config = imaging_config(
            self.image_size,
            self.cell_rad,
            self.num_chans,
            self.num_pols,
            self.num_w_planes,
            max_w_lambda,
        )?;
        config.chan_map = ChannelMap::folding(self.num_chans, self.num_grid_chans);
        info!("Resampler configuration:\n{}", &config);

        let grid_shape = (
            self.image_size,
            self.image_size,
            self.num_pols,
            self.num_grid_chans,
        );
        let mut resampler = MultiThreadedResampler::<F>::new(config, self.num_threads, grid_shape)?;
        let mut grid = Grid::<F>::zeros(grid_shape);
        let mut sumwt = SumWeights::zeros((self.num_pols, self.num_grid_chans));

        let draw_target = if self.draw_progress {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        let grid_progress = ProgressBar::with_draw_target(Some(self.num_rows as u64), draw_target);
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:3}% ({eta:5})",
        ) {
            grid_progress.set_style(style.progress_chars("=> "));
        }
        grid_progress.set_message("gridding");

        for start in (0..self.num_rows).step_by(self.rows_per_chunk) {
            let end = (start + self.rows_per_chunk).min(self.num_rows);
            let chunk = rows.view_rows(start..end)?;
            with_increment_duration!(
                durations,
                "grid",
                resampler.data_to_grid(
                    grid.view_mut(),
                    &chunk,
                    sumwt.view_mut(),
                    self.do_psf,
                    &cf
                )
            )?;
            grid_progress.inc((end - start) as u64);
        }
        grid_progress.finish();

        let mut model_rows = rows.clone();
        with_increment_duration!(
            durations,
            "degrid",
            resampler.grid_to_data(model_rows.view_mut(), grid.view(), &cf)
        )?;
        with_increment_duration!(
            durations,
            "residuals",
            resampler.compute_residuals(rows.view_mut(), grid.view(), &cf)
        )?;
        resampler.terminate()?;

        for (name, duration) in resampler.durations() {
            *durations.entry(name.clone()).or_default() += *duration;
        }

        info!("Sum of weights per polarization and grid channel:\n{}", weight_table(&sumwt));
        info!(
            "rms of model {:.6}, rms of residuals {:.6}",
            rms(model_rows.vis.view()),
            rms(rows.vis.view())
        );
        info!("Durations:\n{}", duration_table(&durations));

        trace!("end ResamplerContext::run");
        Ok(durations)
    }
}

fn weight_table(sumwt: &SumWeights) -> Table {
    let (num_pols, num_chans) = sumwt.dim();
    let mut weight_table = Table::new();
    weight_table.set_titles(Row::new(
        iter::once(Cell::new(""))
            .chain((0..num_chans).map(|chan| Cell::new(&format!("ch{}", chan))))
            .collect(),
    ));
    for pol in 0..num_pols {
        weight_table.add_row(Row::new(
            iter::once(Cell::new(&format!("pol{}:", pol)))
                .chain((0..num_chans).map(|chan| Cell::new(&format!("{:.3}", sumwt[(pol, chan)]))))
                .collect(),
        ));
    }
    weight_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    weight_table
}

fn duration_table(durations: &HashMap<String, Duration>) -> Table {
    let mut duration_table = table!(["stage", "duration"]);
    for name in durations.keys().sorted() {
        duration_table.add_row(row![r => name, format!("{:?}", durations[name])]);
    }
    duration_table.set_format(*prettyformat::consts::FORMAT_CLEAN);
    duration_table
}

/// Parse `args`, and run the resampler. Returns a process exit code.
pub fn main_with_args<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T> + Debug,
    T: Into<OsString> + Clone,
{
    let resampler_ctx = match ResamplerContext::from_args(args) {
        Ok(resampler_ctx) => resampler_ctx,
        Err(DryRun {}) => {
            info!("Dry run. Nothing will be resampled.");
            return 0;
        }
        Err(ResamplerError::ClapError(inner)) => {
            // Swallow broken pipe errors
            trace!("clap error: {:?}", inner.kind());
            let _ = inner.print();
            match inner.kind() {
                DisplayHelp | DisplayVersion => return 0,
                _ => return 1,
            }
        }
        Err(e) => {
            eprintln!("error parsing args: {e}");
            return 1;
        }
    };

    match resampler_ctx.run() {
        Ok(durations) => {
            info!(
                "total duration: {:?}",
                durations
                    .iter()
                    .filter(|(name, _)| ["simulate", "grid", "degrid", "residuals"]
                        .contains(&name.as_str()))
                    .map(|(_, duration)| *duration)
                    .sum::<Duration>()
            );
            0
        }
        Err(e) => {
            eprintln!("resampling error: {e}");
            1
        }
    }
}
