//! Common types shared across the delay-Doppler post-processing pipeline.
//!
//! These structures represent the data objects passed between the dataset,
//! the transform engine and the viewer: the window to process, the
//! measurement constants needed to put markers on the map grid, the engine
//! configuration, and the frame the engine produces.

use std::fs;
use std::path::Path;

use ndarray::Array2;
#[cfg(feature = "python")]
use pyo3::prelude::*;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// WindowSpec
// ---------------------------------------------------------------------------

/// A slow-time window over the channel tensor's sample axis.
///
/// `start_index + length` must not exceed the number of samples in the
/// dataset; the engine rejects such windows instead of clamping them.
#[cfg_attr(feature = "python", pyclass(get_all, set_all))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// First sample of the window (0-based).
    pub start_index: usize,

    /// Number of slow-time samples in the window.  Must be at least 1.
    pub length: usize,

    /// Remove static components with a first-order difference along the
    /// sample axis before Doppler processing.
    pub filter_clutter: bool,

    /// Zero-padding factor applied to both transform axes.  1 disables
    /// upsampling.
    pub upsample_factor: usize,
}

impl WindowSpec {
    /// Plain window: no clutter filtering, no upsampling.
    pub fn new(start_index: usize, length: usize) -> Self {
        Self {
            start_index,
            length,
            filter_clutter: false,
            upsample_factor: 1,
        }
    }

    pub fn with_clutter_filter(mut self, enabled: bool) -> Self {
        self.filter_clutter = enabled;
        self
    }

    pub fn with_upsampling(mut self, factor: usize) -> Self {
        self.upsample_factor = factor;
        self
    }

    /// Exclusive end of the window on the sample axis.
    pub fn end(&self) -> usize {
        self.start_index + self.length
    }

    /// Sample at the temporal centre of the window.  Ground truth is read
    /// here.
    pub fn midpoint(&self) -> usize {
        self.start_index + self.length / 2
    }

    /// Whether the window lies inside a sample axis of the given length.
    pub fn fits(&self, sample_count: usize) -> bool {
        self.start_index
            .checked_add(self.length)
            .map_or(false, |end| end <= sample_count)
    }

    /// Validate the window against a sample axis of length `sample_count`.
    ///
    /// `start_index + length == sample_count` is accepted; anything past the
    /// end is an error, never clamped.
    pub fn check(&self, sample_count: usize) -> Result<(), WindowError> {
        if self.length == 0 {
            return Err(WindowError::ZeroLength);
        }
        if self.upsample_factor == 0 {
            return Err(WindowError::ZeroUpsample);
        }
        if !self.fits(sample_count) {
            return Err(WindowError::OutOfRange {
                start: self.start_index,
                length: self.length,
                sample_count,
            });
        }
        Ok(())
    }
}

/// A window that cannot be taken from the data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WindowError {
    #[error("window [{start}, {start}+{length}) exceeds the {sample_count} available samples")]
    OutOfRange {
        start: usize,
        length: usize,
        sample_count: usize,
    },

    #[error("window length must be at least 1")]
    ZeroLength,

    #[error("upsample factor must be at least 1")]
    ZeroUpsample,

    #[error("{snapshots} x {subcarriers} window upsampled by {upsample_factor} does not fit in memory")]
    TooLarge {
        snapshots: usize,
        subcarriers: usize,
        upsample_factor: usize,
    },
}

#[cfg(feature = "python")]
#[pymethods]
impl WindowSpec {
    #[new]
    #[pyo3(signature = (start_index, length, filter_clutter=false, upsample_factor=1))]
    fn py_new(start_index: usize, length: usize, filter_clutter: bool, upsample_factor: usize) -> Self {
        Self {
            start_index,
            length,
            filter_clutter,
            upsample_factor,
        }
    }

    fn __repr__(&self) -> String {
        format!(
            "WindowSpec(start={}, length={}, clutter={}, upsample={})",
            self.start_index, self.length, self.filter_clutter, self.upsample_factor,
        )
    }
}

// ---------------------------------------------------------------------------
// Markers
// ---------------------------------------------------------------------------

/// Reference delay and Doppler of the target, in physical units.
#[cfg_attr(feature = "python", pyclass(get_all))]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthMarker {
    /// Propagation delay in seconds.
    pub delay_s: f64,

    /// Doppler shift in Hz.
    pub doppler_hz: f64,
}

impl GroundTruthMarker {
    pub fn delay_us(&self) -> f64 {
        self.delay_s * 1e6
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl GroundTruthMarker {
    fn __repr__(&self) -> String {
        format!(
            "GroundTruthMarker(delay={:.4} us, doppler={:.4} Hz)",
            self.delay_us(),
            self.doppler_hz,
        )
    }
}

/// A point on the delay-Doppler map grid, in fractional bin units.
///
/// `row` runs along the Doppler axis (row 0 = most negative Doppler),
/// `col` along the delay axis.
#[cfg_attr(feature = "python", pyclass(get_all))]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MapPoint {
    pub row: f64,
    pub col: f64,
}

// ---------------------------------------------------------------------------
// MeasurementParams
// ---------------------------------------------------------------------------

/// Physical constants of the channel sounder used to label the map axes
/// and to convert ground truth into map coordinates.
///
/// Defaults match the published measurement campaign: one snapshot every
/// 320 us (20 symbols of 16 us), 16 us maximum unambiguous delay.
#[cfg_attr(feature = "python", pyclass(get_all, set_all))]
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementParams {
    /// Slow-time sampling interval in seconds.
    pub snapshot_interval_s: f64,

    /// Inverse of the subcarrier spacing, in seconds.  The full delay axis
    /// spans `[0, tau_max_s)`.
    pub tau_max_s: f64,
}

impl Default for MeasurementParams {
    fn default() -> Self {
        Self {
            snapshot_interval_s: 20.0 * 16e-6,
            tau_max_s: 16e-6,
        }
    }
}

impl MeasurementParams {
    /// Width of the Doppler axis in Hz (the slow-time sampling rate).
    pub fn doppler_span_hz(&self) -> f64 {
        1.0 / self.snapshot_interval_s
    }

    /// Largest Doppler shift representable without aliasing.
    pub fn max_doppler_hz(&self) -> f64 {
        0.5 * self.doppler_span_hz()
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl MeasurementParams {
    #[new]
    #[pyo3(signature = (snapshot_interval_s=320e-6, tau_max_s=16e-6))]
    fn py_new(snapshot_interval_s: f64, tau_max_s: f64) -> Self {
        Self {
            snapshot_interval_s,
            tau_max_s,
        }
    }

    fn __repr__(&self) -> String {
        format!(
            "MeasurementParams(snapshot_interval={:.1} us, tau_max={:.1} us)",
            self.snapshot_interval_s * 1e6,
            self.tau_max_s * 1e6,
        )
    }
}

// ---------------------------------------------------------------------------
// TransformParams
// ---------------------------------------------------------------------------

/// Configuration of the delay-Doppler transform engine.
#[cfg_attr(feature = "python", pyclass(get_all, set_all))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformParams {
    /// Number of delay bins to keep, counted before upsampling.  `None`
    /// keeps the full delay axis.  The engine keeps
    /// `delay_bins * upsample_factor` columns (never more than it has).
    pub delay_bins: Option<usize>,

    /// Measurement constants used for marker placement.
    pub measurement: MeasurementParams,
}

#[cfg(feature = "python")]
#[pymethods]
impl TransformParams {
    #[new]
    #[pyo3(signature = (delay_bins=None, measurement=None))]
    fn py_new(delay_bins: Option<usize>, measurement: Option<MeasurementParams>) -> Self {
        Self {
            delay_bins,
            measurement: measurement.unwrap_or_default(),
        }
    }

    fn __repr__(&self) -> String {
        format!("TransformParams(delay_bins={:?})", self.delay_bins)
    }
}

// ---------------------------------------------------------------------------
// DelayDopplerFrame
// ---------------------------------------------------------------------------

/// One rendered delay-Doppler map plus its annotations.
///
/// `power_db` has shape `(doppler_bins, delay_bins)`; row `rows / 2` is zero
/// Doppler.  Bins with exactly zero energy hold `-inf`.
#[cfg_attr(feature = "python", pyclass)]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DelayDopplerFrame {
    /// Normalised magnitude in dB.
    pub power_db: Array2<f32>,

    /// Ground truth at the window midpoint.
    pub marker: GroundTruthMarker,

    /// `marker` expressed on the map grid.
    pub marker_px: MapPoint,

    /// Target position in the viewer's normalised square, when requested.
    pub target_position: Option<[f64; 2]>,

    /// Window the frame was computed from.
    pub window: WindowSpec,
}

impl DelayDopplerFrame {
    pub fn shape(&self) -> (usize, usize) {
        self.power_db.dim()
    }

    /// Index of the zero-Doppler row.
    pub fn zero_doppler_row(&self) -> usize {
        self.power_db.nrows() / 2
    }

    /// Strongest finite bin as `(row, col, dB)`, or `None` if the map holds
    /// no finite value.
    pub fn peak(&self) -> Option<(usize, usize, f32)> {
        self.power_db
            .indexed_iter()
            .filter(|(_, v)| v.is_finite())
            .fold(None, |best, ((r, c), &v)| match best {
                Some((_, _, b)) if b >= v => best,
                _ => Some((r, c, v)),
            })
    }

    /// Raise every bin below `floor_db` to it.  JSON has no `-inf`, so a
    /// frame must be clamped before it is written out and read back.
    pub fn clamp_floor(&mut self, floor_db: f32) {
        self.power_db.mapv_inplace(|v| if v >= floor_db { v } else { floor_db });
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl DelayDopplerFrame {
    /// Map as nested lists, one list per Doppler row.
    #[pyo3(name = "power_db")]
    fn py_power_db(&self) -> Vec<Vec<f32>> {
        self.power_db.outer_iter().map(|row| row.to_vec()).collect()
    }

    #[getter]
    fn marker(&self) -> GroundTruthMarker {
        self.marker
    }

    #[getter]
    fn marker_px(&self) -> MapPoint {
        self.marker_px
    }

    #[getter]
    fn target_position(&self) -> Option<(f64, f64)> {
        self.target_position.map(|[x, y]| (x, y))
    }

    #[getter]
    fn window(&self) -> WindowSpec {
        self.window
    }

    #[pyo3(name = "shape")]
    fn py_shape(&self) -> (usize, usize) {
        self.shape()
    }

    fn __repr__(&self) -> String {
        let (rows, cols) = self.shape();
        format!(
            "DelayDopplerFrame({}x{}, start={}, marker=({:.4} us, {:.2} Hz))",
            rows,
            cols,
            self.window.start_index,
            self.marker.delay_us(),
            self.marker.doppler_hz,
        )
    }
}

// ---------------------------------------------------------------------------
// ViewerConfig
// ---------------------------------------------------------------------------

/// Errors raised while reading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Display range of the colour scale, in dB relative to the normalised
/// map.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayRange {
    pub floor_db: f32,
    pub ceil_db: f32,
}

impl Default for DisplayRange {
    fn default() -> Self {
        Self {
            floor_db: -80.0,
            ceil_db: 0.0,
        }
    }
}

/// Settings of an interactive or batch session.
///
/// Every field has a default, so a JSON file only needs the keys it wants
/// to override:
///
/// ```json
/// { "window_len": 200, "filter_clutter": true, "transform": { "delay_bins": 80 } }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Slow-time window length; one snapshot of the viewer spans this many
    /// samples.
    pub window_len: usize,

    pub filter_clutter: bool,

    pub upsample_factor: usize,

    pub transform: TransformParams,

    pub display: DisplayRange,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            window_len: 100,
            filter_clutter: false,
            upsample_factor: 1,
            transform: TransformParams::default(),
            display: DisplayRange::default(),
        }
    }
}

impl ViewerConfig {
    /// Read a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.display().to_string(),
            source,
        })
    }

    /// Window of this session starting at `start_index`.
    pub fn window_at(&self, start_index: usize) -> WindowSpec {
        WindowSpec {
            start_index,
            length: self.window_len,
            filter_clutter: self.filter_clutter,
            upsample_factor: self.upsample_factor,
        }
    }
}
