//! Convolution function tables, and their rescaling to a channel's frequency.
//!
//! A convolution function (CF) is computed upstream, once, at a reference
//! frequency. It is stored oversampled: `sampling` table entries per grid cell,
//! out to `support` cells either side of the centre. Using the same table at a
//! different frequency `f` rescales both the support and the sampling by
//! `ref_freq / f` (see [`ScaledCf`]), so no per-channel kernels are needed.
//!
//! The resampler takes its kernels from a [`CfSource`]. Any single [`ConvFunc`]
//! is one, and every row uses it. A [`RowCfMap`] holds several banks of
//! kernels instead, and picks one for each row from the row's
//! [`crate::vis_buffer::RowMeta::cf_keys`] entry and the chunk's parallactic
//! angle.

use log::warn;

use crate::{
    ndarray::{Array4, ArrayView1, ArrayView4, Axis},
    vis_buffer::RowMeta,
    Complex, ResamplerError,
};

/// Anything the resampler can look convolution weights up in.
///
/// Implementations are shared by reference between all worker threads, and
/// must not change during a resampling call.
pub trait ConvFunc: Sync {
    /// A name for log messages
    fn name(&self) -> &str;

    /// The support radius in grid cells at the reference frequency, `[x, y]`
    fn support(&self) -> [usize; 2];

    /// The oversampling factor at the reference frequency
    fn sampling(&self) -> usize;

    /// The frequency the support and sampling are defined at \[Hz\]
    fn ref_freq_hz(&self) -> f64;

    /// The parallactic angle the function was computed for \[radians\]
    fn pa_rad(&self) -> f64;

    /// The number of w (or aperture) planes
    fn num_w_planes(&self) -> usize;

    /// The number of polarization planes
    fn num_pol_planes(&self) -> usize;

    /// The largest offset from the centre which [`ConvFunc::weight`] can serve
    /// along each of `[x, y]`, in table entries.
    fn max_index(&self) -> [usize; 2];

    /// The weight at an offset `(ix, iy)` from the centre of the table, in
    /// table entries. `None` when the offset falls outside the table.
    fn weight(&self, ix: isize, iy: isize, w_plane: usize, pol_plane: usize)
        -> Option<Complex<f32>>;
}

/// Where the resampler finds the kernel for each row.
///
/// Indices run over `0..num_cfs()`. Like a [`ConvFunc`], a source is shared by
/// reference between all worker threads.
pub trait CfSource: Sync {
    /// The kind of kernel served
    type Cf: ConvFunc + ?Sized;

    /// The number of kernels
    fn num_cfs(&self) -> usize;

    /// Kernel `idx`, for `idx` in `0..num_cfs()`
    fn cf(&self, idx: usize) -> &Self::Cf;

    /// The kernel to use for a (local) row of `meta`. Rows for which this is
    /// `None` are skipped.
    fn cf_idx(&self, meta: &RowMeta, row: usize) -> Option<usize>;

    /// Check that every row of `meta` can be given a kernel.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadConvFunc`] if a row can't.
    fn check_rows(&self, _meta: &RowMeta) -> Result<(), ResamplerError> {
        Ok(())
    }
}

impl<C: ConvFunc + ?Sized> CfSource for C {
    type Cf = C;

    fn num_cfs(&self) -> usize {
        1
    }

    fn cf(&self, _: usize) -> &C {
        self
    }

    #[inline]
    fn cf_idx(&self, _: &RowMeta, _: usize) -> Option<usize> {
        Some(0)
    }
}

/// Banks of kernels, one bank per row key.
///
/// A row with key `k` uses bank `k`. Within a bank, the kernel computed for
/// the parallactic angle nearest the chunk's is used, and any difference left
/// over is taken out by rotating the kernel as usual.
///
/// # Examples
///
/// ```rust
/// use visresample::{ndarray::Array1, CfTable, RowCfMap, VisBuffer};
///
/// let cfs = RowCfMap::new(vec![
///     vec![CfTable::single_tap(150e6, 1, 1)],
///     vec![
///         CfTable::single_tap(150e6, 1, 1).with_pa(0.0),
///         CfTable::single_tap(150e6, 1, 1).with_pa(0.5),
///     ],
/// ])
/// .unwrap();
/// assert_eq!(cfs.num_keys(), 2);
///
/// let rows = VisBuffer::new_blank(1, Array1::from(vec![150e6]), 3)
///     .with_cf_keys(Array1::from(vec![0, 1, 1]))
///     .unwrap();
/// assert_eq!(rows.cf_keys[2], 1);
/// ```
#[derive(Debug, Clone)]
pub struct RowCfMap<C: ConvFunc> {
    cfs: Vec<C>,
    banks: Vec<Vec<usize>>,
}

impl<C: ConvFunc> RowCfMap<C> {
    /// Create a new [`RowCfMap`] from one bank of kernels per row key.
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadConvFunc`] if there are no banks, or
    /// a bank is empty.
    pub fn new(banks: Vec<Vec<C>>) -> Result<Self, ResamplerError> {
        if banks.is_empty() {
            return Err(ResamplerError::BadConvFunc {
                name: "row map".to_string(),
                reason: "need at least one bank of kernels".to_string(),
            });
        }
        if let Some(key) = banks.iter().position(Vec::is_empty) {
            return Err(ResamplerError::BadConvFunc {
                name: "row map".to_string(),
                reason: format!("bank {key} has no kernels"),
            });
        }
        let mut cfs = vec![];
        let mut indices = Vec::with_capacity(banks.len());
        for bank in banks {
            let start = cfs.len();
            cfs.extend(bank);
            indices.push((start..cfs.len()).collect());
        }
        Ok(Self {
            cfs,
            banks: indices,
        })
    }

    /// The number of row keys served
    pub fn num_keys(&self) -> usize {
        self.banks.len()
    }

    /// The kernel in bank `key` computed nearest to `pa_rad`.
    pub fn nearest(&self, key: usize, pa_rad: f64) -> Option<usize> {
        self.banks.get(key)?.iter().copied().min_by(|&a, &b| {
            let distance = |idx: usize| (self.cfs[idx].pa_rad() - pa_rad).abs();
            distance(a).total_cmp(&distance(b))
        })
    }
}

impl<C: ConvFunc> CfSource for RowCfMap<C> {
    type Cf = C;

    fn num_cfs(&self) -> usize {
        self.cfs.len()
    }

    fn cf(&self, idx: usize) -> &C {
        &self.cfs[idx]
    }

    #[inline]
    fn cf_idx(&self, meta: &RowMeta, row: usize) -> Option<usize> {
        self.nearest(meta.cf_keys[row], meta.pa_rad)
    }

    fn check_rows(&self, meta: &RowMeta) -> Result<(), ResamplerError> {
        match meta.cf_keys.iter().find(|&&key| key >= self.num_keys()) {
            Some(key) => Err(ResamplerError::BadConvFunc {
                name: "row map".to_string(),
                reason: format!(
                    "row key {key} has no bank, there are only {}",
                    self.num_keys()
                ),
            }),
            None => Ok(()),
        }
    }
}

/// The support and sampling of a [`ConvFunc`], rescaled to one frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaledCf {
    /// `ref_freq / freq`
    pub cf_scale: f64,
    /// support radius in grid cells, `[x, y]`
    pub support: [usize; 2],
    /// table entries per grid cell
    pub sampling: usize,
}

impl ScaledCf {
    /// Rescale `cf` for use at `freq_hz`.
    ///
    /// Both quantities are rounded to the nearest integer. The sampling is
    /// never less than one. The support is capped at the largest radius the
    /// table can serve at the scaled sampling, which only matters below the
    /// reference frequency.
    pub fn for_freq<C: ConvFunc + ?Sized>(cf: &C, freq_hz: f64) -> Self {
        let cf_scale = cf.ref_freq_hz() / freq_hz;
        let sampling = ((cf.sampling() as f64 * cf_scale).round() as usize).max(1);
        let max_index = cf.max_index();
        let support = [0, 1].map(|axis| {
            let wanted = (cf.support()[axis] as f64 * cf_scale).round() as usize;
            let servable = max_index[axis].saturating_sub(sampling / 2) / sampling;
            wanted.min(servable)
        });
        Self {
            cf_scale,
            support,
            sampling,
        }
    }

    /// True if the support had to be capped to fit the table.
    pub fn is_capped<C: ConvFunc + ?Sized>(&self, cf: &C) -> bool {
        [0, 1].iter().any(|&axis| {
            self.support[axis] < (cf.support()[axis] as f64 * self.cf_scale).round() as usize
        })
    }
}

/// Rescale `cf` for every channel in `freqs_hz`, warning once if the table is
/// too small for any of them.
pub(crate) fn scale_for_channels<C: ConvFunc + ?Sized>(
    cf: &C,
    freqs_hz: ArrayView1<f64>,
) -> Vec<ScaledCf> {
    let scaled: Vec<ScaledCf> = freqs_hz
        .iter()
        .map(|&freq_hz| ScaledCf::for_freq(cf, freq_hz))
        .collect();
    if scaled.iter().any(|s| s.is_capped(cf)) {
        warn!(
            "convolution function {} is too small for some channels, its support has been capped",
            cf.name()
        );
    }
    scaled
}

/// A dense, precomputed convolution function table.
///
/// `data` has shape `[x_offset, y_offset, w_plane, pol_plane]`. Both offset
/// axes must have odd length, with the zero offset in the middle, and must
/// hold at least `support * sampling + sampling / 2` entries either side of the
/// centre.
#[derive(Debug, Clone)]
pub struct CfTable {
    name: String,
    data: Array4<Complex<f32>>,
    support: [usize; 2],
    sampling: usize,
    ref_freq_hz: f64,
    pa_rad: f64,
}

impl CfTable {
    /// Create a new [`CfTable`].
    ///
    /// # Errors
    ///
    /// Will return [`ResamplerError::BadConvFunc`] if the sampling is zero, the
    /// reference frequency is not positive, there are no w or polarization
    /// planes, or the offset axes are too short or even.
    pub fn new(
        name: &str,
        data: Array4<Complex<f32>>,
        support: [usize; 2],
        sampling: usize,
        ref_freq_hz: f64,
    ) -> Result<Self, ResamplerError> {
        let bad_cf = |reason: String| {
            Err(ResamplerError::BadConvFunc {
                name: name.to_string(),
                reason,
            })
        };
        if sampling == 0 {
            return bad_cf("sampling must be at least 1".to_string());
        }
        if !(ref_freq_hz.is_finite() && ref_freq_hz > 0.0) {
            return bad_cf(format!("reference frequency {ref_freq_hz} Hz is not positive"));
        }
        let (len_x, len_y, num_w_planes, num_pol_planes) = data.dim();
        if num_w_planes == 0 || num_pol_planes == 0 {
            return bad_cf(format!(
                "need at least one w and one pol plane, got {num_w_planes} and {num_pol_planes}"
            ));
        }
        for (axis, len) in [len_x, len_y].into_iter().enumerate() {
            let needed = 2 * (support[axis] * sampling + sampling / 2) + 1;
            if len % 2 == 0 || len < needed {
                return bad_cf(format!(
                    "offset axis {axis} has {len} entries, needs an odd number of at least {needed}"
                ));
            }
        }
        Ok(Self {
            name: name.to_string(),
            data,
            support,
            sampling,
            ref_freq_hz,
            pa_rad: 0.0,
        })
    }

    /// A kernel with a single tap of weight one, and no oversampling. Gridding
    /// with it deposits each visibility into exactly one cell.
    pub fn single_tap(ref_freq_hz: f64, num_w_planes: usize, num_pol_planes: usize) -> Self {
        Self {
            name: "single tap".to_string(),
            data: Array4::from_elem(
                (1, 1, num_w_planes.max(1), num_pol_planes.max(1)),
                Complex::new(1.0, 0.0),
            ),
            support: [0, 0],
            sampling: 1,
            ref_freq_hz,
            pa_rad: 0.0,
        }
    }

    /// Set the parallactic angle this table was computed for.
    #[must_use]
    pub fn with_pa(mut self, pa_rad: f64) -> Self {
        self.pa_rad = pa_rad;
        self
    }

    /// The raw table, `[x_offset, y_offset, w_plane, pol_plane]`
    pub fn data(&self) -> ArrayView4<Complex<f32>> {
        self.data.view()
    }

    #[inline]
    fn origin(&self) -> [isize; 2] {
        [
            (self.data.len_of(Axis(0)) as isize - 1) / 2,
            (self.data.len_of(Axis(1)) as isize - 1) / 2,
        ]
    }
}

impl ConvFunc for CfTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn support(&self) -> [usize; 2] {
        self.support
    }

    fn sampling(&self) -> usize {
        self.sampling
    }

    fn ref_freq_hz(&self) -> f64 {
        self.ref_freq_hz
    }

    fn pa_rad(&self) -> f64 {
        self.pa_rad
    }

    fn num_w_planes(&self) -> usize {
        self.data.len_of(Axis(2))
    }

    fn num_pol_planes(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    fn max_index(&self) -> [usize; 2] {
        self.origin().map(|o| o as usize)
    }

    #[inline]
    fn weight(
        &self,
        ix: isize,
        iy: isize,
        w_plane: usize,
        pol_plane: usize,
    ) -> Option<Complex<f32>> {
        let [origin_x, origin_y] = self.origin();
        let (x, y) = (origin_x + ix, origin_y + iy);
        if x < 0 || y < 0 {
            return None;
        }
        self.data
            .get((x as usize, y as usize, w_plane, pol_plane))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::{CfSource, CfTable, ConvFunc, RowCfMap, ScaledCf};
    use crate::{
        ndarray::{Array1, Array4},
        Complex, ResamplerError, VisBuffer,
    };

    fn get_test_table(support: usize, sampling: usize) -> CfTable {
        let len = 2 * (support * sampling + sampling / 2) + 1;
        let mut data = Array4::zeros((len, len, 2, 1));
        for ((x, y, w, _), value) in data.indexed_iter_mut() {
            *value = Complex::new(x as f32, (y + 100 * w) as f32);
        }
        CfTable::new("test", data, [support, support], sampling, 150e6).unwrap()
    }

    #[test]
    fn test_new_validates_table() {
        let data = Array4::zeros((9, 9, 1, 1));
        assert!(CfTable::new("ok", data.clone(), [1, 1], 2, 1e8).is_ok());
        // 2 * 3 + 1 = 7 entries either side won't fit in 9
        assert!(matches!(
            CfTable::new("small", data.clone(), [2, 1], 3, 1e8),
            Err(ResamplerError::BadConvFunc { .. })
        ));
        assert!(matches!(
            CfTable::new("zero sampling", data.clone(), [1, 1], 0, 1e8),
            Err(ResamplerError::BadConvFunc { .. })
        ));
        assert!(matches!(
            CfTable::new("no freq", data, [1, 1], 4, 0.0),
            Err(ResamplerError::BadConvFunc { .. })
        ));
        assert!(matches!(
            CfTable::new("even", Array4::zeros((10, 9, 1, 1)), [1, 1], 2, 1e8),
            Err(ResamplerError::BadConvFunc { .. })
        ));
        assert!(matches!(
            CfTable::new("no planes", Array4::zeros((9, 9, 0, 1)), [1, 1], 4, 1e8),
            Err(ResamplerError::BadConvFunc { .. })
        ));
    }

    #[test]
    fn test_weight_lookup_is_centred() {
        let table = get_test_table(2, 4);
        // 2 * (8 + 2) + 1 = 21 entries, centre at 10
        assert_eq!(table.max_index(), [10, 10]);
        assert_eq!(table.weight(0, 0, 0, 0), Some(Complex::new(10.0, 10.0)));
        assert_eq!(table.weight(-10, 3, 1, 0), Some(Complex::new(0.0, 113.0)));
        assert_eq!(table.weight(11, 0, 0, 0), None);
        assert_eq!(table.weight(0, -11, 0, 0), None);
        assert_eq!(table.weight(0, 0, 2, 0), None);
        assert_eq!(table.num_w_planes(), 2);
        assert_eq!(table.num_pol_planes(), 1);
    }

    #[test]
    fn test_scaled_at_reference_frequency() {
        let table = get_test_table(4, 8);
        let scaled = ScaledCf::for_freq(&table, 150e6);
        assert_eq!(scaled.cf_scale, 1.0);
        assert_eq!(scaled.support, [4, 4]);
        assert_eq!(scaled.sampling, 8);
        assert!(!scaled.is_capped(&table));
    }

    #[test]
    fn test_scaled_at_double_frequency_halves() {
        let table = get_test_table(4, 8);
        let scaled = ScaledCf::for_freq(&table, 300e6);
        assert_eq!(scaled.cf_scale, 0.5);
        assert_eq!(scaled.support, [2, 2]);
        assert_eq!(scaled.sampling, 4);
    }

    #[test]
    fn test_scaled_sampling_never_zero() {
        let table = get_test_table(1, 1);
        let scaled = ScaledCf::for_freq(&table, 600e6);
        assert_eq!(scaled.sampling, 1);
        assert_eq!(scaled.support, [0, 0]);
    }

    #[test]
    fn test_scaled_support_is_capped_below_reference() {
        let table = get_test_table(4, 8);
        // at half the reference frequency we'd want support 8 at sampling 16,
        // but the table only holds 36 entries either side.
        let scaled = ScaledCf::for_freq(&table, 75e6);
        assert_eq!(scaled.sampling, 16);
        assert_eq!(scaled.support, [1, 1]);
        assert!(scaled.is_capped(&table));
    }

    #[test]
    fn test_single_tap() {
        let table = CfTable::single_tap(1e8, 1, 1);
        assert_eq!(table.support(), [0, 0]);
        assert_eq!(table.max_index(), [0, 0]);
        assert_eq!(table.weight(0, 0, 0, 0), Some(Complex::new(1.0, 0.0)));
        assert_eq!(table.weight(1, 0, 0, 0), None);
        let scaled = ScaledCf::for_freq(&table, 2e8);
        assert_eq!(scaled.support, [0, 0]);
        assert_eq!(scaled.sampling, 1);
    }

    #[test]
    fn test_single_kernel_serves_every_row() {
        let table = CfTable::single_tap(1e8, 1, 1);
        let rows = VisBuffer::new_blank(1, Array1::from(vec![1e8]), 3)
            .with_cf_keys(Array1::from(vec![0, 4, 9]))
            .unwrap();
        let view = rows.view();
        assert_eq!(table.num_cfs(), 1);
        assert_eq!((0..3).map(|row| table.cf_idx(&view.meta, row)).collect::<Vec<_>>(), vec![Some(0); 3]);
        assert!(table.check_rows(&view.meta).is_ok());
    }

    #[test]
    fn test_row_map_picks_bank_then_nearest_pa() {
        let cfs = RowCfMap::new(vec![
            vec![get_test_table(1, 1)],
            vec![
                get_test_table(1, 2).with_pa(-0.4),
                get_test_table(1, 2).with_pa(0.1),
                get_test_table(1, 2).with_pa(0.6),
            ],
        ])
        .unwrap();
        assert_eq!(cfs.num_keys(), 2);
        assert_eq!(cfs.num_cfs(), 4);
        assert_eq!(cfs.cf(0).sampling(), 1);
        assert_eq!(cfs.cf(3).pa_rad(), 0.6);

        let mut rows = VisBuffer::new_blank(1, Array1::from(vec![1e8]), 3)
            .with_cf_keys(Array1::from(vec![1, 0, 1]))
            .unwrap();
        rows.pa_rad = 0.4;
        let view = rows.view();
        assert_eq!(cfs.cf_idx(&view.meta, 0), Some(3));
        assert_eq!(cfs.cf_idx(&view.meta, 1), Some(0));
        assert_eq!(cfs.nearest(1, -1.0), Some(1));
        assert_eq!(cfs.nearest(1, 0.0), Some(2));
        assert_eq!(cfs.nearest(2, 0.0), None);
        assert!(cfs.check_rows(&view.meta).is_ok());
    }

    #[test]
    fn test_row_map_rejects_unknown_keys_and_empty_banks() {
        let cfs = RowCfMap::new(vec![vec![get_test_table(1, 1)]]).unwrap();
        let rows = VisBuffer::new_blank(1, Array1::from(vec![1e8]), 2)
            .with_cf_keys(Array1::from(vec![0, 1]))
            .unwrap();
        assert!(matches!(
            cfs.check_rows(&rows.view().meta),
            Err(ResamplerError::BadConvFunc { .. })
        ));
        assert_eq!(cfs.cf_idx(&rows.view().meta, 1), None);

        assert!(matches!(
            RowCfMap::<CfTable>::new(vec![]),
            Err(ResamplerError::BadConvFunc { .. })
        ));
        assert!(matches!(
            RowCfMap::new(vec![vec![get_test_table(1, 1)], vec![]]),
            Err(ResamplerError::BadConvFunc { reason, .. }) if reason.contains("bank 1")
        ));
    }
}
