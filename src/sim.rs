//! Synthetic visibilities and kernels, for exercising the resampler without a
//! telescope.
//!
//! Everything here is deterministic, so runs can be compared exactly.

use std::f64::consts::PI;

use crate::{
    config::{ChannelMap, PolMap, ResamplerConfig, ResamplerConfigBuilder},
    constants::VEL_C,
    conv_func::CfTable,
    ndarray::{Array1, Array4},
    Complex, ResamplerError, VisBuffer,
};

/// Radians between consecutive rows on the spiral (the golden angle).
const SPIRAL_STEP_RAD: f64 = 2.399_963_229_728_653;

/// The visibility of a unit point source at direction cosines `lm`, seen on a
/// baseline `uvw_m` at `freq_hz`.
pub fn point_source_vis(uvw_m: [f64; 3], freq_hz: f64, lm: [f64; 2]) -> Complex<f32> {
    let n = (1.0 - lm[0] * lm[0] - lm[1] * lm[1]).max(0.0).sqrt();
    let phase = -2.0 * PI * freq_hz / VEL_C
        * (uvw_m[0] * lm[0] + uvw_m[1] * lm[1] + uvw_m[2] * (n - 1.0));
    let (sin, cos) = phase.sin_cos();
    Complex::new(cos as f32, sin as f32)
}

/// `num_rows` unflagged rows of a unit point source at `source_lm`, with
/// baselines spiralling out to `max_uv_m` metres.
///
/// `w` is a tenth of the baseline length, with a sign that varies between
/// rows. Imaging weights cycle through `0.5, 0.75, 1.0, 1.25`. Every
/// polarization sees the same visibility.
pub fn spiral_rows(
    num_rows: usize,
    num_pols: usize,
    freqs_hz: Array1<f64>,
    max_uv_m: f64,
    source_lm: [f64; 2],
) -> VisBuffer {
    let mut rows = VisBuffer::new_blank(num_pols, freqs_hz, num_rows);
    for row in 0..num_rows {
        let radius = max_uv_m * (row + 1) as f64 / num_rows as f64;
        let angle = row as f64 * SPIRAL_STEP_RAD;
        let uvw_m = [
            radius * angle.cos(),
            radius * angle.sin(),
            0.1 * radius * (3.0 * angle).sin(),
        ];
        for (axis, &value) in uvw_m.iter().enumerate() {
            rows.uvw[(axis, row)] = value;
        }
        rows.phase_corrections[row] = 0.01 * angle.cos();
        for (chan, &freq_hz) in rows.freqs_hz.iter().enumerate() {
            let vis = point_source_vis(uvw_m, freq_hz, source_lm);
            for pol in 0..num_pols {
                rows.vis[(pol, chan, row)] = vis;
            }
            rows.imaging_weights[(chan, row)] = 0.5 + 0.25 * ((row + chan) % 4) as f32;
        }
    }
    rows
}

/// The longest baseline \[m\] whose kernel footprint still fits on a grid of
/// `image_size` cells at `max_freq_hz`, leaving a one cell margin.
pub fn max_baseline_m(image_size: usize, cell_rad: f64, support: usize, max_freq_hz: f64) -> f64 {
    let max_cells = (image_size / 2) as f64 - support as f64 - 1.0;
    max_cells.max(0.0) / (image_size as f64 * cell_rad) * VEL_C / max_freq_hz
}

/// A separable Gaussian kernel with `num_w_planes` planes, each a little wider
/// than the last, and a single polarization plane.
///
/// # Errors
///
/// Will return [`ResamplerError::BadConvFunc`] if `sampling` is zero or
/// `ref_freq_hz` is not positive.
pub fn gaussian_cf(
    support: usize,
    sampling: usize,
    num_w_planes: usize,
    ref_freq_hz: f64,
) -> Result<CfTable, ResamplerError> {
    let len = 2 * (support * sampling + sampling / 2) + 1;
    let centre = ((len - 1) / 2) as f64;
    let sigma = ((support * sampling) as f64 / 2.0).max(1.0);
    let mut data = Array4::zeros((len, len, num_w_planes.max(1), 1));
    for ((x, y, w_plane, _), value) in data.indexed_iter_mut() {
        let width = sigma * (1.0 + 0.25 * w_plane as f64);
        let r2 = (x as f64 - centre).powi(2) + (y as f64 - centre).powi(2);
        *value = Complex::new((-r2 / (2.0 * width * width)).exp() as f32, 0.0);
    }
    CfTable::new("gaussian", data, [support, support], sampling, ref_freq_hz)
}

/// A configuration for an `image_size` × `image_size` image of `cell_rad`
/// cells, with zero spacing at the grid centre, every data channel and
/// polarization gridded to its own plane, and `w` up to `max_w_lambda`
/// spread over `num_w_planes` planes.
///
/// # Errors
///
/// Will return [`ResamplerError::ConfigBuilder`] if the configuration can't be
/// built.
pub fn imaging_config(
    image_size: usize,
    cell_rad: f64,
    num_chans: usize,
    num_pols: usize,
    num_w_planes: usize,
    max_w_lambda: f64,
) -> Result<ResamplerConfig, ResamplerError> {
    let uv_scale = image_size as f64 * cell_rad;
    let w_scale = if num_w_planes > 1 && max_w_lambda > 0.0 {
        ((num_w_planes - 1) as f64).powi(2) / max_w_lambda
    } else {
        0.0
    };
    let centre = (image_size / 2) as f64;
    Ok(ResamplerConfigBuilder::default()
        .uvw_scale([uv_scale, uv_scale, w_scale])
        .offset([centre, centre, 0.0])
        .chan_map(ChannelMap::identity(num_chans))
        .pol_map(PolMap::identity(num_pols))
        .build()?)
}
