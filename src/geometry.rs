//! Where a visibility sample lands on the grid, and which cells its kernel
//! touches.

use std::f64::consts::PI;

use crate::{constants::VEL_C, Complex};

/// Grid coordinates beyond this are treated as off every grid.
const MAX_CELL_INDEX: f64 = i32::MAX as f64;

/// The grid location of one visibility sample at one frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    /// nearest grid cell in `[x, y]`, and the w plane
    pub loc: [isize; 3],
    /// sub-cell offset of the sample from `loc` in `[x, y]`, in kernel table
    /// entries
    pub off: [isize; 2],
    /// phase correction to apply to the sample when gridding (its conjugate
    /// when degridding)
    pub phasor: Complex<f64>,
}

/// Locate a sample on the grid.
///
/// `u` and `v` are scaled linearly, `pos = scale * uvw * freq / c + offset`.
/// The w plane is `sqrt(|scale_w * w * freq / c|) + offset_w`, which spaces
/// the planes more finely near zero w. `sampling` is the (already frequency
/// scaled) kernel oversampling, and limits the sub-cell offset to
/// `±sampling / 2`.
///
/// Returns `None` if any coordinate or the phase isn't finite, or a
/// coordinate is too far out to be on any grid.
#[inline]
pub fn locate(
    uvw_m: [f64; 3],
    freq_hz: f64,
    dphase_m: f64,
    scale: &[f64; 3],
    offset: &[f64; 3],
    sampling: usize,
) -> Option<GridPoint> {
    let wavelengths_per_m = freq_hz / VEL_C;
    let half = (sampling / 2) as isize;
    let mut loc = [0; 3];
    let mut off = [0; 2];
    for axis in 0..2 {
        let pos = scale[axis] * uvw_m[axis] * wavelengths_per_m + offset[axis];
        let nearest = pos.round();
        loc[axis] = cell_index(nearest)?;
        off[axis] = (((nearest - pos) * sampling as f64).round() as isize).clamp(-half, half);
    }
    loc[2] = cell_index(
        ((scale[2] * uvw_m[2] * wavelengths_per_m).abs().sqrt() + offset[2]).round(),
    )?;

    let phase = 2.0 * PI * dphase_m * wavelengths_per_m;
    if !phase.is_finite() {
        return None;
    }
    let (sin, cos) = phase.sin_cos();
    Some(GridPoint {
        loc,
        off,
        phasor: Complex::new(cos, sin),
    })
}

#[inline]
fn cell_index(value: f64) -> Option<isize> {
    (value.is_finite() && value.abs() <= MAX_CELL_INDEX).then(|| value as isize)
}

/// True if a kernel of `support` cells either side of `loc` lies entirely
/// inside an `nx` × `ny` grid, and `loc`'s w plane is one of `num_w_planes`.
#[inline]
pub fn on_grid(nx: usize, ny: usize, num_w_planes: usize, loc: &[isize; 3], support: [usize; 2]) -> bool {
    footprint_fits(loc[0], support[0], nx)
        && footprint_fits(loc[1], support[1], ny)
        && loc[2] >= 0
        && (loc[2] as usize) < num_w_planes
}

#[inline]
fn footprint_fits(centre: isize, support: usize, len: usize) -> bool {
    let support = match isize::try_from(support) {
        Ok(support) => support,
        Err(_) => return false,
    };
    match (centre.checked_sub(support), centre.checked_add(support)) {
        (Some(low), Some(high)) => low >= 0 && (high as usize) < len,
        _ => false,
    }
}

/// Rotation of kernel offsets to undo a change in parallactic angle between
/// when a kernel was computed and when the data was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotation {
    sin: f64,
    cos: f64,
}

impl Rotation {
    /// The rotation taking kernel offsets at `cf_pa_rad` to data at
    /// `data_pa_rad`, or `None` if the angles differ by no more than
    /// `tolerance_rad` and the kernel can be used unrotated.
    pub fn between(data_pa_rad: f64, cf_pa_rad: f64, tolerance_rad: f64) -> Option<Self> {
        let delta = data_pa_rad - cf_pa_rad;
        if delta == 0.0 || delta.abs() <= tolerance_rad {
            return None;
        }
        let (sin, cos) = (-delta).sin_cos();
        Some(Self { sin, cos })
    }

    /// Rotate an offset in kernel table entries, rounding to the nearest entry.
    #[inline]
    pub fn apply(&self, ix: isize, iy: isize) -> (isize, isize) {
        let (x, y) = (ix as f64, iy as f64);
        (
            (self.cos * x - self.sin * y).round() as isize,
            (self.sin * x + self.cos * y).round() as isize,
        )
    }
}
