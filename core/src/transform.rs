//! Delay-Doppler transform engine.
//!
//! # Background
//!
//! The channel sounder measures the frequency response of the propagation
//! channel on `F` subcarriers once per snapshot.  A moving scatterer (the
//! UAV) shows up as energy at a particular *delay* (path length) and
//! *Doppler* (radial velocity).  Both are recovered with two Fourier
//! transforms over a window of `T` consecutive snapshots:
//!
//! 1. an **inverse** transform along subcarriers turns each frequency
//!    response into an impulse response (frequency -> delay);
//! 2. a **forward** transform along snapshots turns the slow-time
//!    evolution of each delay bin into a Doppler spectrum
//!    (slow time -> Doppler).
//!
//! # Pipeline
//!
//! For a window `[start, start + length)` of one antenna pair:
//!
//! 1. **Clutter filter** (optional): first-order difference along the
//!    snapshot axis.  Static paths have the same response in consecutive
//!    snapshots and cancel; one extra snapshot is taken when available so
//!    the filtered window still has `length` rows.
//! 2. **Zero padding** to `F * up` subcarriers and `T * up` snapshots,
//!    which interpolates both axes by the upsampling factor.
//! 3. **IFFT / FFT** as above.  The inverse transform is scaled by `1/n`.
//! 4. **Normalisation** by the Frobenius norm of the whole map, so the
//!    linear power of a map sums to one.
//! 5. **Shift** along Doppler so zero Doppler sits at row `rows / 2`.
//! 6. **Truncation** of the delay axis to the configured number of bins.
//! 7. **Magnitude in dB**.
//!
//! The ground-truth marker is read at the window midpoint and converted to
//! map coordinates from the measurement constants; neither depends on the
//! clutter filter or the upsampling factor.

use std::time::Instant;

use log::{debug, info};
use ndarray::{s, Array2, ArrayView2};
use num_complex::{Complex32, Complex64};
#[cfg(feature = "python")]
use pyo3::prelude::*;
use rayon::prelude::*;
use rustfft::FftPlanner;

use crate::dataset::{AntennaPair, ChannelDataset, DatasetError, PositionScale};
use crate::types::{
    DelayDopplerFrame, GroundTruthMarker, MapPoint, MeasurementParams, TransformParams, WindowError,
    WindowSpec,
};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while computing a delay-Doppler map.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error("clutter filtering left no samples in the window starting at {start}")]
    EmptyWindow { start: usize },

    #[error("sweep hop must be at least 1")]
    ZeroHop,
}

// ---------------------------------------------------------------------------
// Marker placement
// ---------------------------------------------------------------------------

/// Position of a ground-truth marker on a map with `rows` Doppler bins and
/// `delay_bins` delay bins (before truncation).
///
/// The delay axis spans `[0, tau_max)`; the Doppler axis spans one slow-time
/// sampling rate with zero Doppler on row `rows / 2` (rounded down), the same
/// row the shifted map uses.
pub fn marker_to_map(
    marker: &GroundTruthMarker,
    measurement: &MeasurementParams,
    rows: usize,
    delay_bins: usize,
) -> MapPoint {
    MapPoint {
        row: marker.doppler_hz * measurement.snapshot_interval_s * rows as f64 + (rows / 2) as f64,
        col: marker.delay_s / measurement.tau_max_s * delay_bins as f64,
    }
}

// ---------------------------------------------------------------------------
// DelayDopplerEngine
// ---------------------------------------------------------------------------

/// Computes delay-Doppler maps from channel windows.
///
/// The engine holds only configuration; every call is independent, so one
/// engine can serve the viewer and a parallel sweep alike.
#[cfg_attr(feature = "python", pyclass)]
#[derive(Clone, Debug, Default)]
pub struct DelayDopplerEngine {
    params: TransformParams,
}

impl DelayDopplerEngine {
    pub fn new(params: TransformParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &TransformParams {
        &self.params
    }

    /// Compute the map of one window of a `(sample, subcarrier)` channel
    /// plane.
    ///
    /// `groundtruth` is the `(sample, [delay, doppler])` array belonging to
    /// `channel`.
    pub fn transform(
        &self,
        channel: ArrayView2<'_, Complex32>,
        groundtruth: ArrayView2<'_, f64>,
        window: &WindowSpec,
    ) -> Result<DelayDopplerFrame, TransformError> {
        let (sample_count, subcarriers) = channel.dim();
        window.check(sample_count)?;
        if groundtruth.dim() != (sample_count, 2) {
            return Err(DatasetError::ShapeMismatch {
                what: "ground truth",
                expected: format!("({}, 2)", sample_count),
                actual: format!("{:?}", groundtruth.dim()),
            }
            .into());
        }

        // -- slice and clutter filter ----------------------------------------
        let start = window.start_index;
        let taken = if window.filter_clutter && window.end() < sample_count {
            window.length + 1
        } else {
            window.length
        };
        let slice = channel
            .slice(s![start..start + taken, ..])
            .mapv(|v| Complex64::new(f64::from(v.re), f64::from(v.im)));
        let samples = if window.filter_clutter {
            &slice.slice(s![1.., ..]) - &slice.slice(s![..-1, ..])
        } else {
            slice
        };
        let snapshots = samples.nrows();
        if snapshots == 0 || subcarriers == 0 {
            return Err(TransformError::EmptyWindow { start });
        }

        // -- zero padding -----------------------------------------------------
        let up = window.upsample_factor;
        let (rows, cols) = snapshots
            .checked_mul(up)
            .zip(subcarriers.checked_mul(up))
            .filter(|(rows, cols)| rows.checked_mul(*cols).is_some())
            .ok_or(WindowError::TooLarge {
                snapshots,
                subcarriers,
                upsample_factor: up,
            })?;
        let zero = Complex64::new(0.0, 0.0);

        // Row-major (snapshot, delay) buffer.
        let mut grid = vec![zero; rows * cols];
        for (r, row) in samples.outer_iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                grid[r * cols + c] = v;
            }
        }

        // -- frequency -> delay ---------------------------------------------------
        let mut planner = FftPlanner::<f64>::new();
        planner.plan_fft_inverse(cols).process(&mut grid);
        let scale = 1.0 / cols as f64;
        grid.iter_mut().for_each(|v| *v *= scale);

        // -- slow time -> Doppler -------------------------------------------------
        // Column-major copy so each delay bin's slow-time series is contiguous.
        let mut spectrum = vec![zero; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                spectrum[c * rows + r] = grid[r * cols + c];
            }
        }
        planner.plan_fft_forward(rows).process(&mut spectrum);

        // -- normalise, shift, truncate, dB ---------------------------------------
        let norm = spectrum.iter().map(|v| v.norm_sqr()).sum::<f64>().sqrt();
        let norm = if norm > 0.0 { norm } else { 1.0 };

        let keep = self
            .params
            .delay_bins
            .map_or(cols, |bins| bins.saturating_mul(up).min(cols));
        let half = rows / 2;
        let power_db = Array2::from_shape_fn((rows, keep), |(r, c)| {
            let source = (r + rows - half) % rows;
            (20.0 * (spectrum[c * rows + source].norm() / norm).log10()) as f32
        });

        // -- marker -------------------------------------------------------------
        let mid = window.midpoint();
        let marker = GroundTruthMarker {
            delay_s: groundtruth[[mid, 0]],
            doppler_hz: groundtruth[[mid, 1]],
        };
        let marker_px = marker_to_map(&marker, &self.params.measurement, rows, cols);

        debug!(
            "window start={} len={} clutter={} up={} -> {}x{} map",
            start, window.length, window.filter_clutter, up, rows, keep,
        );

        Ok(DelayDopplerFrame {
            power_db,
            marker,
            marker_px,
            target_position: None,
            window: *window,
        })
    }

    /// Compute the map of one window of a dataset.
    ///
    /// With `positions`, the frame also carries the normalised position of
    /// target 0 at the window midpoint, which requires a loaded trajectory.
    pub fn frame(
        &self,
        dataset: &ChannelDataset,
        antennas: AntennaPair,
        window: &WindowSpec,
        positions: Option<&PositionScale>,
    ) -> Result<DelayDopplerFrame, TransformError> {
        let channel = dataset.channel_view(antennas)?;
        let mut frame = self.transform(channel, dataset.groundtruth(), window)?;
        if let Some(scale) = positions {
            let target = dataset.target_position(window.midpoint(), 0)?;
            frame.target_position = Some(scale.normalize(target));
        }
        Ok(frame)
    }

    /// Maps for every window `start = 0, hop, 2 * hop, ...` that fits in the
    /// dataset, computed in parallel and returned in start order.
    ///
    /// `template` supplies the window length, clutter filter and
    /// upsampling; its start index is ignored.
    pub fn sweep(
        &self,
        dataset: &ChannelDataset,
        antennas: AntennaPair,
        template: &WindowSpec,
        hop: usize,
    ) -> Result<Vec<DelayDopplerFrame>, TransformError> {
        if hop == 0 {
            return Err(TransformError::ZeroHop);
        }
        if template.length == 0 {
            return Err(WindowError::ZeroLength.into());
        }
        if template.upsample_factor == 0 {
            return Err(WindowError::ZeroUpsample.into());
        }
        dataset.check_antennas(antennas)?;

        let timer = Instant::now();
        let starts: Vec<usize> = match dataset.sample_count().checked_sub(template.length) {
            Some(last) => (0..=last).step_by(hop).collect(),
            None => Vec::new(),
        };
        info!(
            "Sweeping {} windows of {} samples (hop {}) over Tx {} / Rx {}",
            starts.len(),
            template.length,
            hop,
            antennas.tx,
            antennas.rx,
        );

        let frames = starts
            .par_iter()
            .map(|&start_index| {
                let window = WindowSpec {
                    start_index,
                    ..*template
                };
                self.frame(dataset, antennas, &window, None)
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!("Sweep complete in {} ms", timer.elapsed().as_millis());
        Ok(frames)
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl DelayDopplerEngine {
    #[new]
    #[pyo3(signature = (params=None))]
    fn py_new(params: Option<TransformParams>) -> Self {
        Self::new(params.unwrap_or_default())
    }

    /// Compute one frame from Python.
    #[pyo3(name = "frame", signature = (dataset, window, tx=0, rx=0, with_positions=false))]
    fn py_frame(
        &self,
        dataset: PyRef<'_, ChannelDataset>,
        window: WindowSpec,
        tx: usize,
        rx: usize,
        with_positions: bool,
    ) -> PyResult<DelayDopplerFrame> {
        let scale = with_positions.then(|| dataset.position_scale());
        self.frame(&dataset, AntennaPair::new(tx, rx), &window, scale.as_ref())
            .map_err(|e| pyo3::exceptions::PyValueError::new_err(e.to_string()))
    }

    fn __repr__(&self) -> String {
        format!("DelayDopplerEngine({:?})", self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::toy_dataset;
    use crate::dataset::{AntennaPositions, Trajectory};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Array4};
    use proptest::prelude::*;
    use std::f64::consts::PI;

    fn groundtruth(n: usize) -> Array2<f64> {
        Array::from_shape_fn((n, 2), |(s, c)| if c == 0 { s as f64 * 1e-8 } else { s as f64 - 50.0 })
    }

    /// Channel plane whose only component sits at Doppler bin `k` of a
    /// `period`-snapshot window and at zero delay.
    fn doppler_tone(n: usize, f: usize, k: usize, period: usize) -> Array2<Complex32> {
        Array::from_shape_fn((n, f), |(t, _)| {
            let phase = 2.0 * PI * (k * t) as f64 / period as f64;
            Complex32::new(phase.cos() as f32, phase.sin() as f32)
        })
    }

    fn engine() -> DelayDopplerEngine {
        DelayDopplerEngine::default()
    }

    #[test]
    fn static_tone_peaks_at_zero_doppler_zero_delay() {
        let channel = doppler_tone(100, 64, 0, 100);
        let gt = groundtruth(100);
        let frame = engine().transform(channel.view(), gt.view(), &WindowSpec::new(0, 100)).unwrap();

        assert_eq!(frame.shape(), (100, 64));
        let (row, col, db) = frame.peak().unwrap();
        assert_eq!((row, col), (50, 0));
        assert_eq!(row, frame.zero_doppler_row());
        assert_abs_diff_eq!(db, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn doppler_bin_lands_on_shifted_row() {
        let gt = groundtruth(40);
        for k in [1, 5, 13, 30] {
            let channel = doppler_tone(40, 8, k, 40);
            let frame = engine().transform(channel.view(), gt.view(), &WindowSpec::new(0, 40)).unwrap();
            let (row, col, _) = frame.peak().unwrap();
            assert_eq!(row, (k + 20) % 40, "bin {}", k);
            assert_eq!(col, 0);
        }
    }

    #[test]
    fn odd_window_puts_zero_doppler_on_floor_half() {
        let channel = doppler_tone(7, 4, 0, 7);
        let gt = groundtruth(7);
        let frame = engine().transform(channel.view(), gt.view(), &WindowSpec::new(0, 7)).unwrap();
        assert_eq!(frame.peak().unwrap().0, 3);
    }

    #[test]
    fn odd_window_marker_sits_on_zero_doppler_row() {
        let channel = doppler_tone(7, 4, 0, 7);
        let gt = Array2::<f64>::zeros((7, 2));
        let frame = engine().transform(channel.view(), gt.view(), &WindowSpec::new(0, 7)).unwrap();
        let (row, _, _) = frame.peak().unwrap();
        assert_eq!(row, frame.zero_doppler_row());
        assert_abs_diff_eq!(frame.marker_px.row, row as f64, epsilon = 1e-12);
    }

    #[test]
    fn clutter_filtered_tail_window_keeps_marker_on_peak_row() {
        // 8 samples ending at the last one difference down to 7 rows.
        let channel = doppler_tone(8, 4, 2, 7);
        let ts = MeasurementParams::default().snapshot_interval_s;
        let gt = Array::from_shape_fn((8, 2), |(_, c)| if c == 0 { 0.0 } else { 2.0 / (7.0 * ts) });
        let window = WindowSpec::new(0, 8).with_clutter_filter(true);
        let frame = engine().transform(channel.view(), gt.view(), &window).unwrap();

        assert_eq!(frame.shape().0, 7);
        let (row, _, _) = frame.peak().unwrap();
        assert_eq!(row, 5);
        assert_abs_diff_eq!(frame.marker_px.row, row as f64, epsilon = 1e-9);
    }

    #[test]
    fn oversized_upsampling_is_rejected() {
        let channel = doppler_tone(4, 4, 0, 4);
        let gt = groundtruth(4);
        let window = WindowSpec::new(0, 4).with_upsampling(usize::MAX / 2);
        assert!(matches!(
            engine().transform(channel.view(), gt.view(), &window),
            Err(TransformError::Window(WindowError::TooLarge { snapshots: 4, subcarriers: 4, .. }))
        ));
    }

    #[test]
    fn linear_power_sums_to_one() {
        let channel = Array::from_shape_fn((32, 16), |(t, f)| {
            Complex32::new((t as f32 * 0.3).sin() + f as f32 * 0.1, (f as f32 * 0.7).cos())
        });
        let gt = groundtruth(32);
        let frame = engine().transform(channel.view(), gt.view(), &WindowSpec::new(0, 32)).unwrap();
        let total: f64 = frame
            .power_db
            .iter()
            .filter(|v| v.is_finite())
            .map(|&v| 10f64.powf(f64::from(v) / 10.0))
            .sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn zero_channel_gives_minus_infinity_not_an_error() {
        let channel = Array2::<Complex32>::zeros((10, 4));
        let gt = groundtruth(10);
        let frame = engine().transform(channel.view(), gt.view(), &WindowSpec::new(0, 10)).unwrap();
        assert!(frame.power_db.iter().all(|v| *v == f32::NEG_INFINITY));
        assert!(frame.peak().is_none());
    }

    #[test]
    fn scenario_window_matches_expected_shape_and_marker() {
        let ds = toy_dataset(1000, 1, 1, 64, false);
        let params = TransformParams {
            delay_bins: Some(80),
            ..TransformParams::default()
        };
        let frame = DelayDopplerEngine::new(params)
            .frame(&ds, AntennaPair::default(), &WindowSpec::new(0, 100), None)
            .unwrap();
        assert_eq!(frame.shape(), (100, 64));
        assert_eq!(Some(frame.marker), ds.groundtruth_at(50));
        assert!(frame.target_position.is_none());
    }

    #[test]
    fn upsampling_and_truncation_set_the_shape() {
        let channel = doppler_tone(50, 64, 0, 50);
        let gt = groundtruth(50);
        let params = TransformParams {
            delay_bins: Some(20),
            ..TransformParams::default()
        };
        let window = WindowSpec::new(0, 50).with_upsampling(2);
        let frame = DelayDopplerEngine::new(params)
            .transform(channel.view(), gt.view(), &window)
            .unwrap();
        assert_eq!(frame.shape(), (100, 40));

        let full = engine().transform(channel.view(), gt.view(), &window).unwrap();
        assert_eq!(full.shape(), (100, 128));
    }

    #[test]
    fn clutter_filter_keeps_length_when_extra_sample_exists() {
        let channel = doppler_tone(20, 4, 3, 10);
        let gt = groundtruth(20);
        let window = WindowSpec::new(0, 10).with_clutter_filter(true);
        let frame = engine().transform(channel.view(), gt.view(), &window).unwrap();
        assert_eq!(frame.shape(), (10, 4));

        let at_end = WindowSpec::new(10, 10).with_clutter_filter(true);
        let frame = engine().transform(channel.view(), gt.view(), &at_end).unwrap();
        assert_eq!(frame.shape(), (9, 4));
    }

    #[test]
    fn clutter_filter_removes_static_paths() {
        // A strong static path plus a weak moving one at Doppler bin 2.
        let (n, f) = (17, 8);
        let moving = doppler_tone(n, f, 2, 16);
        let channel = moving.mapv(|v| v * 0.01 + Complex32::new(5.0, 0.0));
        let gt = groundtruth(n);

        let raw = engine().transform(channel.view(), gt.view(), &WindowSpec::new(0, 16)).unwrap();
        assert_eq!(raw.peak().unwrap().0, 8);

        let window = WindowSpec::new(0, 16).with_clutter_filter(true);
        let filtered = engine().transform(channel.view(), gt.view(), &window).unwrap();
        assert_eq!(filtered.peak().unwrap().0, 10);
        assert!(filtered.power_db[[8, 0]] < -60.0);
    }

    #[test]
    fn single_sample_clutter_window_is_empty() {
        let channel = doppler_tone(1, 4, 0, 1);
        let gt = groundtruth(1);
        let window = WindowSpec::new(0, 1).with_clutter_filter(true);
        assert!(matches!(
            engine().transform(channel.view(), gt.view(), &window),
            Err(TransformError::EmptyWindow { start: 0 })
        ));
    }

    #[test]
    fn marker_maps_into_grid_coordinates() {
        let params = MeasurementParams::default();
        let marker = GroundTruthMarker {
            delay_s: 4e-6,
            doppler_hz: 0.25 / params.snapshot_interval_s,
        };
        let point = marker_to_map(&marker, &params, 100, 64);
        assert_abs_diff_eq!(point.col, 16.0, epsilon = 1e-9);
        assert_abs_diff_eq!(point.row, 75.0, epsilon = 1e-9);
    }

    #[test]
    fn frame_rejects_bad_antenna_and_missing_trajectory() {
        let ds = toy_dataset(200, 2, 1, 8, false);
        let window = WindowSpec::new(0, 100);
        let err = engine().frame(&ds, AntennaPair::new(2, 0), &window, None).unwrap_err();
        assert!(matches!(
            err,
            TransformError::Dataset(DatasetError::AntennaOutOfRange { index: 2, size: 2, .. })
        ));

        let scale = ds.position_scale();
        let err = engine().frame(&ds, AntennaPair::new(1, 0), &window, Some(&scale)).unwrap_err();
        assert!(matches!(err, TransformError::Dataset(DatasetError::MissingTrajectory)));
    }

    #[test]
    fn frame_fills_normalised_target_position() {
        let ds = toy_dataset(200, 1, 1, 8, true);
        let scale = ds.position_scale();
        let frame = engine()
            .frame(&ds, AntennaPair::default(), &WindowSpec::new(100, 50), Some(&scale))
            .unwrap();
        let expected = scale.normalize(ds.target_position(125, 0).unwrap());
        assert_eq!(frame.target_position, Some(expected));
    }

    #[test]
    fn sweep_returns_frames_in_start_order() {
        let ds = toy_dataset(250, 1, 1, 8, false);
        let frames = engine()
            .sweep(&ds, AntennaPair::default(), &WindowSpec::new(0, 100), 50)
            .unwrap();
        let starts: Vec<usize> = frames.iter().map(|f| f.window.start_index).collect();
        assert_eq!(starts, vec![0, 50, 100, 150]);
        assert_eq!(Some(frames[3].marker), ds.groundtruth_at(200));
    }

    #[test]
    fn sweep_validates_arguments() {
        let ds = toy_dataset(50, 1, 1, 8, false);
        let template = WindowSpec::new(0, 100);
        assert!(matches!(
            engine().sweep(&ds, AntennaPair::default(), &template, 0),
            Err(TransformError::ZeroHop)
        ));
        assert!(engine().sweep(&ds, AntennaPair::default(), &template, 10).unwrap().is_empty());
        assert!(matches!(
            engine().sweep(&ds, AntennaPair::default(), &WindowSpec::new(0, 0), 10),
            Err(TransformError::Window(WindowError::ZeroLength))
        ));
    }

    #[test]
    fn groundtruth_must_match_channel() {
        let ds = ChannelDataset::from_parts(
            Array4::zeros((10, 1, 1, 4)),
            Array2::zeros((10, 2)),
            AntennaPositions {
                tx: Array2::zeros((1, 3)),
                rx: Array2::ones((1, 3)),
            },
            Trajectory::NotLoaded,
        )
        .unwrap();
        let short_gt = Array2::<f64>::zeros((9, 2));
        let view = ds.channel_view(AntennaPair::default()).unwrap();
        assert!(matches!(
            engine().transform(view, short_gt.view(), &WindowSpec::new(0, 5)),
            Err(TransformError::Dataset(DatasetError::ShapeMismatch { .. }))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn marker_ignores_filter_and_upsampling(
            start in 0usize..40,
            length in 2usize..24,
            filter in any::<bool>(),
            up in 1usize..4,
        ) {
            let channel = doppler_tone(64, 4, 1, 8);
            let gt = groundtruth(64);
            let plain = engine()
                .transform(channel.view(), gt.view(), &WindowSpec::new(start, length))
                .unwrap();
            let window = WindowSpec::new(start, length)
                .with_clutter_filter(filter)
                .with_upsampling(up);
            let frame = engine().transform(channel.view(), gt.view(), &window).unwrap();
            prop_assert_eq!(frame.marker, plain.marker);
            prop_assert_eq!(frame.marker.doppler_hz, (start + length / 2) as f64 - 50.0);
        }

        #[test]
        fn out_of_range_iff_window_overruns(start in 0usize..80, length in 1usize..80) {
            let channel = doppler_tone(64, 2, 0, 64);
            let gt = groundtruth(64);
            let result = engine().transform(channel.view(), gt.view(), &WindowSpec::new(start, length));
            if start + length > 64 {
                let is_out_of_range = matches!(
                    result,
                    Err(TransformError::Window(WindowError::OutOfRange { sample_count: 64, .. }))
                );
                prop_assert!(is_out_of_range);
            } else {
                prop_assert!(result.is_ok());
            }
        }
    }
}
