//! Blocks of visibility rows, and cheap views onto contiguous ranges of them.
//!
//! A [`VisBuffer`] owns one chunk of visibility rows as it arrives from the
//! imaging pipeline. The resampler itself only ever sees views: a
//! [`VisBufferView`] when the visibilities are read (gridding), and a
//! [`VisBufferViewMut`] when they are written (degridding, residuals). Both
//! carry the absolute `[begin, end)` range of rows they cover, and both can be
//! split into contiguous, non-overlapping sub-views without copying.
//!
//! The row axis is the last axis of every per-row array:
//!
//! | array               | shape               |
//! |---------------------|---------------------|
//! | `uvw`               | `[3, row]`          |
//! | `freqs_hz`          | `[chan]`            |
//! | `vis`               | `[pol, chan, row]`  |
//! | `flags`             | `[pol, chan, row]`  |
//! | `row_flags`         | `[row]`             |
//! | `imaging_weights`   | `[chan, row]`       |
//! | `phase_corrections` | `[row]`             |
//! | `cf_keys`           | `[row]`             |
//!
//! # Examples
//!
//! ```rust
//! use visresample::{ndarray::Array1, VisBuffer};
//!
//! let freqs_hz = Array1::from(vec![150e6, 151e6]);
//! let mut vis_buffer = VisBuffer::new_blank(4, freqs_hz, 10);
//! assert_eq!(vis_buffer.vis.dim(), (4, 2, 10));
//!
//! let views = vis_buffer.view().scatter(3);
//! assert_eq!(views[0].meta.row_range, 0..3);
//! assert_eq!(views[2].meta.row_range, 6..10);
//!
//! let views = vis_buffer.view_mut().scatter(3);
//! assert_eq!(views[1].vis.dim(), (4, 2, 3));
//! ```

use std::ops::Range;

use crate::{
    ndarray::{
        s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut3, Axis,
    },
    Complex, ResamplerError,
};

/// One chunk of visibility rows.
#[derive(Debug, Clone)]
pub struct VisBuffer {
    /// baseline coordinates in metres, `[3, row]`
    pub uvw: Array2<f64>,
    /// channel centre frequencies in Hz, `[chan]`
    pub freqs_hz: Array1<f64>,
    /// complex visibilities, `[pol, chan, row]`
    pub vis: Array3<Complex<f32>>,
    /// per-sample flags, `[pol, chan, row]`
    pub flags: Array3<bool>,
    /// whole-row flags, `[row]`
    pub row_flags: Array1<bool>,
    /// imaging weights, `[chan, row]`
    pub imaging_weights: Array2<f32>,
    /// extra path length to phase each row by, in metres, `[row]`
    pub phase_corrections: Array1<f64>,
    /// which bank of convolution functions each row uses, `[row]`. See
    /// [`crate::RowCfMap`].
    pub cf_keys: Array1<usize>,
    /// parallactic angle of the chunk in radians
    pub pa_rad: f64,
}

impl VisBuffer {
    /// Create a new [`VisBuffer`], checking that all the arrays agree on the
    /// number of rows, channels and polarizations. Every row uses convolution
    /// function bank 0.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadArrayShape`] if the shapes disagree,
    /// and [`ResamplerError::BadFrequency`] if a channel frequency is not
    /// finite and positive.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uvw: Array2<f64>,
        freqs_hz: Array1<f64>,
        vis: Array3<Complex<f32>>,
        flags: Array3<bool>,
        row_flags: Array1<bool>,
        imaging_weights: Array2<f32>,
        phase_corrections: Array1<f64>,
        pa_rad: f64,
    ) -> Result<Self, ResamplerError> {
        let num_rows = row_flags.len();
        let vis_buffer = Self {
            uvw,
            freqs_hz,
            vis,
            flags,
            row_flags,
            imaging_weights,
            phase_corrections,
            cf_keys: Array1::zeros(num_rows),
            pa_rad,
        };
        let view = vis_buffer.view();
        view.check_shapes("VisBuffer::new")?;
        view.meta.check_freqs()?;
        Ok(vis_buffer)
    }

    /// Set which convolution function bank each row uses.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadArrayShape`] unless there is exactly
    /// one key per row.
    pub fn with_cf_keys(mut self, cf_keys: Array1<usize>) -> Result<Self, ResamplerError> {
        if cf_keys.len() != self.num_rows() {
            return Err(ResamplerError::BadArrayShape {
                argument: "cf_keys".to_string(),
                function: "VisBuffer::with_cf_keys".to_string(),
                expected: format!("{:?}", (self.num_rows(),)),
                received: format!("{:?}", cf_keys.dim()),
            });
        }
        self.cf_keys = cf_keys;
        Ok(self)
    }

    /// A buffer of `num_rows` unflagged rows at the origin, with zero
    /// visibilities, unit imaging weights and no phase corrections.
    pub fn new_blank(num_pols: usize, freqs_hz: Array1<f64>, num_rows: usize) -> Self {
        let num_chans = freqs_hz.len();
        Self {
            uvw: Array2::zeros((3, num_rows)),
            freqs_hz,
            vis: Array3::zeros((num_pols, num_chans, num_rows)),
            flags: Array3::from_elem((num_pols, num_chans, num_rows), false),
            row_flags: Array1::from_elem(num_rows, false),
            imaging_weights: Array2::ones((num_chans, num_rows)),
            phase_corrections: Array1::zeros(num_rows),
            cf_keys: Array1::zeros(num_rows),
            pa_rad: 0.0,
        }
    }

    /// The number of rows in the buffer
    pub fn num_rows(&self) -> usize {
        self.row_flags.len()
    }

    /// A read-only view of every row.
    pub fn view(&self) -> VisBufferView<'_> {
        VisBufferView {
            meta: self.meta(0..self.num_rows()),
            vis: self.vis.view(),
        }
    }

    /// A view of every row, with writable visibilities.
    pub fn view_mut(&mut self) -> VisBufferViewMut<'_> {
        let num_rows = self.num_rows();
        VisBufferViewMut {
            meta: RowMeta {
                uvw: self.uvw.view(),
                freqs_hz: self.freqs_hz.view(),
                flags: self.flags.view(),
                row_flags: self.row_flags.view(),
                imaging_weights: self.imaging_weights.view(),
                phase_corrections: self.phase_corrections.view(),
                cf_keys: self.cf_keys.view(),
                pa_rad: self.pa_rad,
                row_range: 0..num_rows,
            },
            vis: self.vis.view_mut(),
        }
    }

    /// A read-only view of the rows in `row_range`.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadArrayShape`] if the range extends past
    /// the end of the buffer.
    pub fn view_rows(&self, row_range: Range<usize>) -> Result<VisBufferView<'_>, ResamplerError> {
        if row_range.start > row_range.end || row_range.end > self.num_rows() {
            return Err(ResamplerError::BadArrayShape {
                argument: "row_range".to_string(),
                function: "VisBuffer::view_rows".to_string(),
                expected: format!("a range within 0..{}", self.num_rows()),
                received: format!("{:?}", row_range),
            });
        }
        Ok(self.view().slice_rows(row_range))
    }

    fn meta(&self, row_range: Range<usize>) -> RowMeta<'_> {
        RowMeta {
            uvw: self.uvw.view(),
            freqs_hz: self.freqs_hz.view(),
            flags: self.flags.view(),
            row_flags: self.row_flags.view(),
            imaging_weights: self.imaging_weights.view(),
            phase_corrections: self.phase_corrections.view(),
            cf_keys: self.cf_keys.view(),
            pa_rad: self.pa_rad,
            row_range,
        }
    }
}

/// Everything about a range of rows except the visibilities themselves.
///
/// These are never written by the resampler, so every sub-view of a row block
/// can share them freely.
#[derive(Debug, Clone)]
pub struct RowMeta<'a> {
    /// baseline coordinates in metres, `[3, row]`
    pub uvw: ArrayView2<'a, f64>,
    /// channel centre frequencies in Hz, `[chan]`
    pub freqs_hz: ArrayView1<'a, f64>,
    /// per-sample flags, `[pol, chan, row]`
    pub flags: ArrayView3<'a, bool>,
    /// whole-row flags, `[row]`
    pub row_flags: ArrayView1<'a, bool>,
    /// imaging weights, `[chan, row]`
    pub imaging_weights: ArrayView2<'a, f32>,
    /// path length corrections in metres, `[row]`
    pub phase_corrections: ArrayView1<'a, f64>,
    /// convolution function bank of each row, `[row]`
    pub cf_keys: ArrayView1<'a, usize>,
    /// parallactic angle of the chunk in radians
    pub pa_rad: f64,
    /// The absolute range of rows in the parent buffer that this covers.
    pub row_range: Range<usize>,
}

impl<'a> RowMeta<'a> {
    /// The number of rows covered
    pub fn num_rows(&self) -> usize {
        self.row_flags.len()
    }

    /// The number of channels
    pub fn num_chans(&self) -> usize {
        self.freqs_hz.len()
    }

    /// The number of polarizations
    pub fn num_pols(&self) -> usize {
        self.flags.len_of(Axis(0))
    }

    /// The `[u, v, w]` coordinate of a (local) row, in metres.
    #[inline]
    pub fn uvw_m(&self, row: usize) -> [f64; 3] {
        [self.uvw[(0, row)], self.uvw[(1, row)], self.uvw[(2, row)]]
    }

    /// The same rows, borrowed for the lifetime of `&self`.
    pub fn reborrow(&self) -> RowMeta<'_> {
        RowMeta {
            uvw: self.uvw.view(),
            freqs_hz: self.freqs_hz.view(),
            flags: self.flags.view(),
            row_flags: self.row_flags.view(),
            imaging_weights: self.imaging_weights.view(),
            phase_corrections: self.phase_corrections.view(),
            cf_keys: self.cf_keys.view(),
            pa_rad: self.pa_rad,
            row_range: self.row_range.clone(),
        }
    }

    /// Check that every channel frequency is finite and positive.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadFrequency`] for the first channel
    /// which isn't.
    pub fn check_freqs(&self) -> Result<(), ResamplerError> {
        match self
            .freqs_hz
            .iter()
            .position(|&freq_hz| !(freq_hz.is_finite() && freq_hz > 0.0))
        {
            Some(chan) => Err(ResamplerError::BadFrequency {
                chan,
                freq_hz: self.freqs_hz[chan],
            }),
            None => Ok(()),
        }
    }

    /// Narrow to a sub-range of rows, given relative to this range.
    fn slice_rows(&self, local: Range<usize>) -> RowMeta<'a> {
        let start = self.row_range.start + local.start;
        let end = self.row_range.start + local.end;
        RowMeta {
            uvw: self.uvw.slice_move(s![.., local.clone()]),
            freqs_hz: self.freqs_hz,
            flags: self.flags.slice_move(s![.., .., local.clone()]),
            row_flags: self.row_flags.slice_move(s![local.clone()]),
            imaging_weights: self.imaging_weights.slice_move(s![.., local.clone()]),
            phase_corrections: self.phase_corrections.slice_move(s![local.clone()]),
            cf_keys: self.cf_keys.slice_move(s![local]),
            pa_rad: self.pa_rad,
            row_range: start..end,
        }
    }

    fn check_shapes(
        &self,
        vis_dim: (usize, usize, usize),
        function: &str,
    ) -> Result<(), ResamplerError> {
        let num_rows = self.num_rows();
        let num_chans = self.num_chans();
        let num_pols = self.num_pols();
        let bad_shape = |argument: &str, expected: String, received: String| {
            Err(ResamplerError::BadArrayShape {
                argument: argument.to_string(),
                function: function.to_string(),
                expected,
                received,
            })
        };

        if self.uvw.dim() != (3, num_rows) {
            return bad_shape(
                "uvw",
                format!("{:?}", (3, num_rows)),
                format!("{:?}", self.uvw.dim()),
            );
        }
        if self.flags.dim() != (num_pols, num_chans, num_rows) {
            return bad_shape(
                "flags",
                format!("{:?}", (num_pols, num_chans, num_rows)),
                format!("{:?}", self.flags.dim()),
            );
        }
        if vis_dim != (num_pols, num_chans, num_rows) {
            return bad_shape(
                "vis",
                format!("{:?}", (num_pols, num_chans, num_rows)),
                format!("{:?}", vis_dim),
            );
        }
        if self.imaging_weights.dim() != (num_chans, num_rows) {
            return bad_shape(
                "imaging_weights",
                format!("{:?}", (num_chans, num_rows)),
                format!("{:?}", self.imaging_weights.dim()),
            );
        }
        if self.phase_corrections.len() != num_rows {
            return bad_shape(
                "phase_corrections",
                format!("{:?}", (num_rows,)),
                format!("{:?}", self.phase_corrections.dim()),
            );
        }
        if self.cf_keys.len() != num_rows {
            return bad_shape(
                "cf_keys",
                format!("{:?}", (num_rows,)),
                format!("{:?}", self.cf_keys.dim()),
            );
        }
        Ok(())
    }
}

/// Split `num_rows` rows into `num_parts` contiguous, non-overlapping ranges of
/// near-equal length. The last range absorbs the remainder.
///
/// # Examples
///
/// ```rust
/// use visresample::vis_buffer::partition_rows;
///
/// assert_eq!(partition_rows(10, 3), vec![0..3, 3..6, 6..10]);
/// assert_eq!(partition_rows(2, 4), vec![0..0, 0..0, 0..0, 0..2]);
/// ```
pub fn partition_rows(num_rows: usize, num_parts: usize) -> Vec<Range<usize>> {
    if num_parts == 0 {
        return vec![];
    }
    let chunk = num_rows / num_parts;
    (0..num_parts)
        .map(|part| {
            let start = part * chunk;
            let end = if part == num_parts - 1 {
                num_rows
            } else {
                start + chunk
            };
            start..end
        })
        .collect()
}

/// A read-only view of a contiguous range of visibility rows.
#[derive(Debug, Clone)]
pub struct VisBufferView<'a> {
    /// Everything but the visibilities
    pub meta: RowMeta<'a>,
    /// complex visibilities, `[pol, chan, row]`
    pub vis: ArrayView3<'a, Complex<f32>>,
}

impl<'a> VisBufferView<'a> {
    /// Check that all the arrays in this view agree with each other.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadArrayShape`] naming the first array
    /// which disagrees.
    pub fn check_shapes(&self, function: &str) -> Result<(), ResamplerError> {
        self.meta.check_shapes(self.vis.dim(), function)
    }

    /// Split into `num_parts` contiguous sub-views which share this view's
    /// storage. See [`partition_rows`].
    pub fn scatter(&self, num_parts: usize) -> Vec<VisBufferView<'a>> {
        partition_rows(self.meta.num_rows(), num_parts)
            .into_iter()
            .map(|local| self.slice_rows(local))
            .collect()
    }

    fn slice_rows(&self, local: Range<usize>) -> VisBufferView<'a> {
        VisBufferView {
            meta: self.meta.slice_rows(local.clone()),
            vis: self.vis.slice_move(s![.., .., local]),
        }
    }
}

/// A view of a contiguous range of visibility rows whose visibilities may be
/// overwritten.
#[derive(Debug)]
pub struct VisBufferViewMut<'a> {
    /// Everything but the visibilities
    pub meta: RowMeta<'a>,
    /// complex visibilities, `[pol, chan, row]`
    pub vis: ArrayViewMut3<'a, Complex<f32>>,
}

impl<'a> VisBufferViewMut<'a> {
    /// Check that all the arrays in this view agree with each other.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadArrayShape`] naming the first array
    /// which disagrees.
    pub fn check_shapes(&self, function: &str) -> Result<(), ResamplerError> {
        self.meta.check_shapes(self.vis.dim(), function)
    }

    /// Borrow as a read-only view.
    pub fn view(&self) -> VisBufferView<'_> {
        VisBufferView {
            meta: self.meta.reborrow(),
            vis: self.vis.view(),
        }
    }

    /// Reborrow for a shorter lifetime, leaving `self` usable afterwards.
    pub fn reborrow(&mut self) -> VisBufferViewMut<'_> {
        VisBufferViewMut {
            meta: self.meta.reborrow(),
            vis: self.vis.view_mut(),
        }
    }

    /// Split into `num_parts` contiguous sub-views with disjoint writable
    /// visibilities. See [`partition_rows`].
    pub fn scatter(self, num_parts: usize) -> Vec<VisBufferViewMut<'a>> {
        let ranges = partition_rows(self.meta.num_rows(), num_parts);
        let mut parts = Vec::with_capacity(ranges.len());
        let mut rest = self.vis;
        let mut consumed = 0;
        for local in ranges {
            let (head, tail) = rest.split_at(Axis(2), local.end - consumed);
            consumed = local.end;
            rest = tail;
            parts.push(VisBufferViewMut {
                meta: self.meta.slice_rows(local),
                vis: head,
            });
        }
        parts
    }
}

#[cfg(test)]
mod tests {
    use super::{partition_rows, VisBuffer};
    use crate::{
        ndarray::{Array1, Array2, Array3},
        Complex, ResamplerError,
    };

    fn get_test_buffer(num_rows: usize) -> VisBuffer {
        let mut vis_buffer = VisBuffer::new_blank(2, Array1::from(vec![100e6, 200e6]), num_rows);
        for (row, mut uvw) in vis_buffer.uvw.columns_mut().into_iter().enumerate() {
            uvw[0] = row as f64;
        }
        for ((_, _, row), vis) in vis_buffer.vis.indexed_iter_mut() {
            *vis = Complex::new(row as f32, 0.0);
        }
        vis_buffer
    }

    #[test]
    fn test_partition_rows_covers_everything_once() {
        for num_rows in [0, 1, 7, 64, 1001] {
            for num_parts in [1, 2, 4, 8] {
                let ranges = partition_rows(num_rows, num_parts);
                assert_eq!(ranges.len(), num_parts);
                assert_eq!(ranges[0].start, 0);
                assert_eq!(ranges.last().unwrap().end, num_rows);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }
                // all but the last are the same length
                let first_len = ranges[0].len();
                assert!(ranges[..num_parts - 1].iter().all(|r| r.len() == first_len));
                assert!(ranges[num_parts - 1].len() >= first_len);
            }
        }
        assert!(partition_rows(10, 0).is_empty());
    }

    #[test]
    fn test_scatter_views_share_storage() {
        let vis_buffer = get_test_buffer(10);
        let views = vis_buffer.view().scatter(3);
        assert_eq!(views.len(), 3);
        assert_eq!(views[1].meta.row_range, 3..6);
        assert_eq!(views[1].meta.uvw_m(0), [3.0, 0.0, 0.0]);
        assert_eq!(views[2].vis[(1, 1, 3)], Complex::new(9.0, 0.0));
        assert_eq!(
            views[2].vis.as_ptr(),
            vis_buffer.vis.slice(crate::ndarray::s![.., .., 6..]).as_ptr()
        );
        for view in &views {
            view.check_shapes("test").unwrap();
        }
    }

    #[test]
    fn test_scatter_mut_writes_land_in_parent() {
        let mut vis_buffer = get_test_buffer(9);
        for (idx, mut view) in vis_buffer.view_mut().scatter(4).into_iter().enumerate() {
            assert_eq!(view.vis.dim().2, view.meta.num_rows());
            view.vis.fill(Complex::new(idx as f32, 1.0));
        }
        // rows 0..2 went to part 0, rows 6..9 to the last part
        assert_eq!(vis_buffer.vis[(0, 0, 1)], Complex::new(0.0, 1.0));
        assert_eq!(vis_buffer.vis[(1, 1, 5)], Complex::new(2.0, 1.0));
        assert_eq!(vis_buffer.vis[(1, 0, 8)], Complex::new(3.0, 1.0));
    }

    #[test]
    fn test_view_rows() {
        let vis_buffer = get_test_buffer(10);
        let view = vis_buffer.view_rows(2..5).unwrap();
        assert_eq!(view.meta.row_range, 2..5);
        assert_eq!(view.meta.uvw_m(2), [4.0, 0.0, 0.0]);

        let sub_views = view.scatter(2);
        assert_eq!(sub_views[1].meta.row_range, 3..5);

        assert!(matches!(
            vis_buffer.view_rows(5..11),
            Err(ResamplerError::BadArrayShape { .. })
        ));
    }

    #[test]
    fn test_mut_view_can_be_read_and_reused() {
        let mut vis_buffer = get_test_buffer(6);
        let mut view = vis_buffer.view_mut();
        {
            let read = view.view();
            assert_eq!(read.meta.row_range, 0..6);
            assert_eq!(read.vis[(0, 1, 4)], Complex::new(4.0, 0.0));
        }
        for mut part in view.reborrow().scatter(2) {
            part.vis.fill(Complex::new(-1.0, 0.0));
        }
        // the reborrow has ended, so the original view works again
        view.vis[(0, 0, 0)] = Complex::new(7.0, 0.0);
        assert_eq!(view.meta.uvw_m(5), [5.0, 0.0, 0.0]);
        assert_eq!(vis_buffer.vis[(0, 0, 0)], Complex::new(7.0, 0.0));
        assert_eq!(vis_buffer.vis[(1, 1, 5)], Complex::new(-1.0, 0.0));
    }

    #[test]
    fn test_cf_keys_follow_row_slices() {
        let vis_buffer = get_test_buffer(5)
            .with_cf_keys(Array1::from(vec![0, 1, 2, 3, 4]))
            .unwrap();
        let view = vis_buffer.view_rows(1..4).unwrap();
        assert_eq!(view.meta.cf_keys.to_vec(), vec![1, 2, 3]);
        let parts = view.scatter(2);
        assert_eq!(parts[1].meta.cf_keys.to_vec(), vec![2, 3]);
        assert!(matches!(
            get_test_buffer(5).with_cf_keys(Array1::zeros(4)),
            Err(ResamplerError::BadArrayShape { argument, .. }) if argument == "cf_keys"
        ));
    }

    #[test]
    fn test_new_rejects_bad_frequencies() {
        let num_rows = 2;
        for freq_hz in [0.0, -150e6, f64::NAN, f64::INFINITY] {
            let result = VisBuffer::new(
                Array2::zeros((3, num_rows)),
                Array1::from(vec![150e6, freq_hz]),
                Array3::zeros((1, 2, num_rows)),
                Array3::from_elem((1, 2, num_rows), false),
                Array1::from_elem(num_rows, false),
                Array2::ones((2, num_rows)),
                Array1::zeros(num_rows),
                0.0,
            );
            assert!(matches!(result, Err(ResamplerError::BadFrequency { chan: 1, .. })));
        }
    }

    #[test]
    fn test_new_rejects_bad_shapes() {
        let num_rows = 4;
        let result = VisBuffer::new(
            Array2::zeros((3, num_rows)),
            Array1::from(vec![1e8]),
            Array3::zeros((1, 1, num_rows)),
            Array3::from_elem((1, 1, num_rows), false),
            Array1::from_elem(num_rows, false),
            // wrong number of channels
            Array2::ones((2, num_rows)),
            Array1::zeros(num_rows),
            0.0,
        );
        assert!(matches!(
            result,
            Err(ResamplerError::BadArrayShape { argument, .. }) if argument == "imaging_weights"
        ));

        let result = VisBuffer::new(
            Array2::zeros((3, num_rows)),
            Array1::from(vec![1e8]),
            Array3::zeros((1, 1, num_rows + 1)),
            Array3::from_elem((1, 1, num_rows), false),
            Array1::from_elem(num_rows, false),
            Array2::ones((1, num_rows)),
            Array1::zeros(num_rows),
            0.0,
        );
        assert!(matches!(
            result,
            Err(ResamplerError::BadArrayShape { argument, .. }) if argument == "vis"
        ));
    }
}
