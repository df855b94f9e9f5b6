//! Channel measurement datasets: file readers, complex decoding and
//! validated access to the measurement arrays.
//!
//! A scenario of the measurement campaign is stored in two HDF5 files:
//!
//! - a **channel** file holding the frequency responses, the ground-truth
//!   delay and Doppler of the target, and the Tx/Rx antenna positions;
//! - an optional **target** file holding the target trajectory.
//!
//! This module provides a [`MeasurementIO`] trait with an HDF5 backend
//! ([`Hdf5Reader`], behind the `hdf5-support` feature) and a
//! [`MeasurementReader`] that picks the backend from the file extension.
//! The raw arrays a backend returns are decoded and checked here, so every
//! [`ChannelDataset`] satisfies the same shape invariants regardless of
//! where its arrays came from.
//!
//! # Complex layout
//!
//! The frequency responses are complex `f32`.  Two storage layouts are
//! accepted, both with the same bytes on disk:
//!
//! - an HDF5 compound type with two `f32` members `r` and `i`
//!   ([`ChannelSamples::Complex`]);
//! - a plain `f32` array whose innermost axis has length 2, holding the
//!   real and imaginary part ([`ChannelSamples::Interleaved`], decoded by
//!   [`decode_interleaved`]).
//!
//! After decoding, size-1 axes are squeezed and the tensor is brought into
//! `(sample, tx, rx, subcarrier)` order by [`channel_tensor`].

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use log::info;
#[cfg(feature = "hdf5-support")]
use log::debug;
use ndarray::{s, Array2, Array3, Array4, ArrayView1, ArrayView2, Axis};
use num_complex::Complex32;
#[cfg(feature = "python")]
use pyo3::prelude::*;

use crate::types::{GroundTruthMarker, WindowError, WindowSpec};

/// Frequency responses in the channel file.
pub const H5_CHANNEL: &str = "Channel/FrequencyResponses/Data";
/// Ground-truth delay per sample, in seconds.
pub const H5_TARGET_DELAY: &str = "TargetParameters/Delay/Data";
/// Ground-truth Doppler per sample, in Hz.
pub const H5_TARGET_DOPPLER: &str = "TargetParameters/Doppler/Data";
pub const H5_TX_POSITIONS: &str = "AntennaPositions/PositionTx/Data";
pub const H5_RX_POSITIONS: &str = "AntennaPositions/PositionRx/Data";
/// Target trajectory in the target file.
pub const H5_TARGET_POSITIONS: &str = "Positions/Data";

/// Headroom applied to the largest observed separation when scaling
/// positions into the display square, so markers never touch its edge.
const POSITION_MARGIN: f64 = 2.1;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or indexing a dataset.
#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("{file}: required dataset '{key}' not found")]
    MissingKey { file: String, key: String },

    #[error("HDF5 error: {0}")]
    Hdf5(String),

    #[error("shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        actual: String,
    },

    #[error("target trajectory requested but no target file was loaded")]
    MissingTrajectory,

    #[error("{axis} index {index} out of range for an axis of size {size}")]
    AntennaOutOfRange {
        axis: AntennaAxis,
        index: usize,
        size: usize,
    },

    #[error("target index {index} out of range ({count} targets in trajectory)")]
    TargetOutOfRange { index: usize, count: usize },

    #[error(transparent)]
    Window(#[from] WindowError),
}

impl DatasetError {
    /// Whether the error comes from reading the files rather than from a
    /// request against an already loaded dataset.
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::UnsupportedFormat(_)
                | Self::MissingKey { .. }
                | Self::Hdf5(_)
                | Self::ShapeMismatch { .. }
        )
    }
}

/// Antenna axis of the channel tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AntennaAxis {
    Tx,
    Rx,
}

impl fmt::Display for AntennaAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tx => f.write_str("Tx"),
            Self::Rx => f.write_str("Rx"),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw file contents
// ---------------------------------------------------------------------------

/// A flat array exactly as stored in a file, with its stored shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RawArray<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

impl<T> RawArray<T> {
    pub fn new(shape: Vec<usize>, data: Vec<T>) -> Self {
        Self { shape, data }
    }

    fn shape_str(&self) -> String {
        format!("{:?} ({} values)", self.shape, self.data.len())
    }
}

/// Stored frequency responses before decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSamples {
    /// Native complex storage (compound `{r, i}`).
    Complex(RawArray<Complex32>),
    /// `f32` storage with real and imaginary part on an innermost axis of
    /// length 2.
    Interleaved(RawArray<f32>),
}

/// Everything read from a channel file.
#[derive(Debug, Clone)]
pub struct RawChannelFile {
    pub channel: ChannelSamples,
    pub delay: RawArray<f64>,
    pub doppler: RawArray<f64>,
    pub tx_positions: RawArray<f64>,
    pub rx_positions: RawArray<f64>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstract interface for reading measurement files.
///
/// Implementations open files read-only and must release them before
/// returning; the returned arrays own their data.
pub trait MeasurementIO {
    /// Read the five arrays of a channel file.
    fn read_channel(&self, path: &Path) -> Result<RawChannelFile, DatasetError>;

    /// Read the trajectory array of a target file.
    fn read_target(&self, path: &Path) -> Result<RawArray<f64>, DatasetError>;
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Turn `f32` real/imaginary pairs on the innermost axis into complex
/// values, dropping that axis from the shape.
pub fn decode_interleaved(raw: RawArray<f32>) -> Result<RawArray<Complex32>, DatasetError> {
    let mismatch = |raw: &RawArray<f32>| DatasetError::ShapeMismatch {
        what: "channel",
        expected: "innermost real/imaginary axis of length 2".into(),
        actual: raw.shape_str(),
    };

    let outer = match raw.shape.split_last() {
        Some((2, outer)) => outer.to_vec(),
        _ => return Err(mismatch(&raw)),
    };
    if raw.data.len() != raw.shape.iter().product::<usize>() {
        return Err(mismatch(&raw));
    }

    let data = raw
        .data
        .chunks_exact(2)
        .map(|pair| Complex32::new(pair[0], pair[1]))
        .collect();
    Ok(RawArray::new(outer, data))
}

/// Bring decoded frequency responses into `(sample, tx, rx, subcarrier)`
/// order.
///
/// A 4-D array is taken as is and a 2-D array is read as a single antenna
/// pair.  Any other rank is squeezed (size-1 axes removed) and then has to
/// be 2-D or 4-D.
pub fn channel_tensor(raw: RawArray<Complex32>) -> Result<Array4<Complex32>, DatasetError> {
    let widen = |dims: &[usize]| -> Option<[usize; 4]> {
        match *dims {
            [n, t, r, f] => Some([n, t, r, f]),
            [n, f] => Some([n, 1, 1, f]),
            _ => None,
        }
    };

    let dims = widen(&raw.shape).or_else(|| {
        let squeezed: Vec<usize> = raw.shape.iter().copied().filter(|&d| d != 1).collect();
        widen(&squeezed)
    });
    let Some([n, t, r, f]) = dims else {
        return Err(DatasetError::ShapeMismatch {
            what: "channel",
            expected: "(sample, subcarrier) or (sample, tx, rx, subcarrier)".into(),
            actual: raw.shape_str(),
        });
    };

    let actual = raw.shape_str();
    Array4::from_shape_vec((n, t, r, f), raw.data).map_err(|e| DatasetError::ShapeMismatch {
        what: "channel",
        expected: format!("({}, {}, {}, {})", n, t, r, f),
        actual: format!("{}: {}", actual, e),
    })
}

/// Join the separately stored delay and Doppler arrays into one `(N, 2)`
/// ground-truth array.  Each must hold exactly one value per sample.
fn groundtruth_from_raw(
    delay: RawArray<f64>,
    doppler: RawArray<f64>,
    sample_count: usize,
) -> Result<Array2<f64>, DatasetError> {
    for (what, raw) in [("ground-truth delay", &delay), ("ground-truth Doppler", &doppler)] {
        if raw.data.len() != sample_count {
            return Err(DatasetError::ShapeMismatch {
                what,
                expected: format!("{} values (one per channel sample)", sample_count),
                actual: raw.shape_str(),
            });
        }
    }

    let mut groundtruth = Array2::zeros((sample_count, 2));
    groundtruth.column_mut(0).assign(&ArrayView1::from(&delay.data));
    groundtruth.column_mut(1).assign(&ArrayView1::from(&doppler.data));
    Ok(groundtruth)
}

/// Antenna positions as `(ports, coords)`; the innermost non-trivial axis
/// holds the 2 or 3 coordinates.
fn positions_from_raw(raw: RawArray<f64>, what: &'static str) -> Result<Array2<f64>, DatasetError> {
    let coords = raw.shape.iter().rev().copied().find(|&d| d != 1);
    match coords {
        Some(coords @ 2..=3) if raw.data.len() % coords == 0 && !raw.data.is_empty() => {
            let ports = raw.data.len() / coords;
            Array2::from_shape_vec((ports, coords), raw.data).map_err(|e| DatasetError::ShapeMismatch {
                what,
                expected: format!("({}, {})", ports, coords),
                actual: e.to_string(),
            })
        }
        _ => Err(DatasetError::ShapeMismatch {
            what,
            expected: "one or more positions with 2 or 3 coordinates".into(),
            actual: raw.shape_str(),
        }),
    }
}

/// Trajectory as `(sample, target, coords)`.  The first axis must match the
/// channel's sample axis; a 2-D store is read as a single target.
fn trajectory_from_raw(raw: RawArray<f64>, sample_count: usize) -> Result<Array3<f64>, DatasetError> {
    let mismatch = |raw: &RawArray<f64>| DatasetError::ShapeMismatch {
        what: "target trajectory",
        expected: format!("({}, [targets,] 2 or 3)", sample_count),
        actual: raw.shape_str(),
    };

    let coords = raw.shape.get(1..).unwrap_or(&[]).iter().rev().copied().find(|&d| d != 1);
    let (Some(&first), Some(coords @ 2..=3)) = (raw.shape.first(), coords) else {
        return Err(mismatch(&raw));
    };
    if first != sample_count || sample_count == 0 || raw.data.len() % (sample_count * coords) != 0 {
        return Err(mismatch(&raw));
    }

    let targets = raw.data.len() / (sample_count * coords);
    if targets == 0 {
        return Err(mismatch(&raw));
    }
    let shape_str = raw.shape_str();
    Array3::from_shape_vec((sample_count, targets, coords), raw.data).map_err(|e| {
        DatasetError::ShapeMismatch {
            what: "target trajectory",
            expected: format!("({}, {}, {})", sample_count, targets, coords),
            actual: format!("{}: {}", shape_str, e),
        }
    })
}

// ---------------------------------------------------------------------------
// HDF5 reader
// ---------------------------------------------------------------------------

/// Compound element of the channel dataset.
#[cfg(feature = "hdf5-support")]
#[derive(hdf5::H5Type, Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub struct StoredComplex {
    pub r: f32,
    pub i: f32,
}

/// HDF5 reader, available when compiled with the `hdf5-support` feature.
#[cfg(feature = "hdf5-support")]
pub struct Hdf5Reader;

#[cfg(feature = "hdf5-support")]
impl MeasurementIO for Hdf5Reader {
    fn read_channel(&self, path: &Path) -> Result<RawChannelFile, DatasetError> {
        let file = open_h5(path)?;
        let raw = RawChannelFile {
            channel: read_channel_samples(&file, path)?,
            delay: read_f64_array(&file, path, H5_TARGET_DELAY)?,
            doppler: read_f64_array(&file, path, H5_TARGET_DOPPLER)?,
            tx_positions: read_f64_array(&file, path, H5_TX_POSITIONS)?,
            rx_positions: read_f64_array(&file, path, H5_RX_POSITIONS)?,
        };
        debug!("read channel file {} (handle released)", path.display());
        Ok(raw)
    }

    fn read_target(&self, path: &Path) -> Result<RawArray<f64>, DatasetError> {
        let file = open_h5(path)?;
        read_f64_array(&file, path, H5_TARGET_POSITIONS)
    }
}

#[cfg(feature = "hdf5-support")]
fn open_h5(path: &Path) -> Result<hdf5::File, DatasetError> {
    hdf5::File::open(path).map_err(|e| DatasetError::Hdf5(format!("{}: {}", path.display(), e)))
}

#[cfg(feature = "hdf5-support")]
fn open_dataset(file: &hdf5::File, path: &Path, key: &str) -> Result<hdf5::Dataset, DatasetError> {
    if !file.link_exists(key) {
        return Err(DatasetError::MissingKey {
            file: path.display().to_string(),
            key: key.to_string(),
        });
    }
    file.dataset(key).map_err(|e| h5_error(path, key, e))
}

#[cfg(feature = "hdf5-support")]
fn h5_error(path: &Path, key: &str, e: hdf5::Error) -> DatasetError {
    DatasetError::Hdf5(format!("{}:{}: {}", path.display(), key, e))
}

#[cfg(feature = "hdf5-support")]
fn read_f64_array(file: &hdf5::File, path: &Path, key: &str) -> Result<RawArray<f64>, DatasetError> {
    let dataset = open_dataset(file, path, key)?;
    let data: Vec<f64> = dataset.read_raw().map_err(|e| h5_error(path, key, e))?;
    Ok(RawArray::new(dataset.shape(), data))
}

#[cfg(feature = "hdf5-support")]
fn read_channel_samples(file: &hdf5::File, path: &Path) -> Result<ChannelSamples, DatasetError> {
    use hdf5::types::TypeDescriptor;

    let dataset = open_dataset(file, path, H5_CHANNEL)?;
    let shape = dataset.shape();
    let descriptor = dataset
        .dtype()
        .and_then(|dtype| dtype.to_descriptor())
        .map_err(|e| h5_error(path, H5_CHANNEL, e))?;

    match descriptor {
        TypeDescriptor::Float(_) => {
            let data: Vec<f32> = dataset.read_raw().map_err(|e| h5_error(path, H5_CHANNEL, e))?;
            Ok(ChannelSamples::Interleaved(RawArray::new(shape, data)))
        }
        _ => {
            let stored: Vec<StoredComplex> =
                dataset.read_raw().map_err(|e| h5_error(path, H5_CHANNEL, e))?;
            let data = stored.into_iter().map(|c| Complex32::new(c.r, c.i)).collect();
            Ok(ChannelSamples::Complex(RawArray::new(shape, data)))
        }
    }
}

// ---------------------------------------------------------------------------
// Format auto-detection
// ---------------------------------------------------------------------------

/// Reader that picks a backend from the file extension.
#[derive(Clone, Copy, Debug, Default)]
pub struct MeasurementReader;

impl MeasurementReader {
    fn backend(path: &Path) -> Result<&'static dyn MeasurementIO, DatasetError> {
        if !path.exists() {
            return Err(DatasetError::Io {
                path: path.display().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
            });
        }
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            #[cfg(feature = "hdf5-support")]
            "h5" | "hdf5" => Ok(&Hdf5Reader),
            #[cfg(not(feature = "hdf5-support"))]
            "h5" | "hdf5" => Err(DatasetError::UnsupportedFormat(
                "HDF5 support not compiled in; rebuild with the `hdf5-support` feature".to_string(),
            )),
            other => Err(DatasetError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl MeasurementIO for MeasurementReader {
    fn read_channel(&self, path: &Path) -> Result<RawChannelFile, DatasetError> {
        Self::backend(path)?.read_channel(path)
    }

    fn read_target(&self, path: &Path) -> Result<RawArray<f64>, DatasetError> {
        Self::backend(path)?.read_target(path)
    }
}

// ---------------------------------------------------------------------------
// Dataset
// ---------------------------------------------------------------------------

/// Indices of one Tx/Rx antenna pair (0-based).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AntennaPair {
    pub tx: usize,
    pub rx: usize,
}

impl AntennaPair {
    pub fn new(tx: usize, rx: usize) -> Self {
        Self { tx, rx }
    }
}

/// Antenna port positions, `(ports, coords)` each.
#[derive(Debug, Clone, PartialEq)]
pub struct AntennaPositions {
    pub tx: Array2<f64>,
    pub rx: Array2<f64>,
}

/// Target trajectory, present only when a target file was supplied.
#[derive(Debug, Clone, PartialEq)]
pub enum Trajectory {
    NotLoaded,
    /// Positions as `(sample, target, coords)`.
    Loaded(Array3<f64>),
}

impl Trajectory {
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    pub fn positions(&self) -> Result<&Array3<f64>, DatasetError> {
        match self {
            Self::Loaded(positions) => Ok(positions),
            Self::NotLoaded => Err(DatasetError::MissingTrajectory),
        }
    }
}

/// Maps top-view positions into a unit display square centred on the
/// first Tx port.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionScale {
    pub origin: [f64; 2],
    pub scale: f64,
}

impl PositionScale {
    /// Normalised `(x, y)` of a position; the origin lands on `(0.5, 0.5)`.
    pub fn normalize(&self, position: ArrayView1<'_, f64>) -> [f64; 2] {
        [
            (position[0] - self.origin[0]) / self.scale + 0.5,
            (position[1] - self.origin[1]) / self.scale + 0.5,
        ]
    }
}

/// Raw window of the dataset with the annotations at its midpoint, as used
/// for training-data extraction.
#[derive(Debug, Clone)]
pub struct WindowSample<'a> {
    /// `(sample, subcarrier)` view of the window.
    pub channel: ArrayView2<'a, Complex32>,
    pub groundtruth: GroundTruthMarker,
    /// Position of target 0 at the midpoint, when requested.
    pub target: Option<ArrayView1<'a, f64>>,
}

/// A loaded measurement scenario.
///
/// Invariants (checked on construction):
/// - the channel tensor is `(sample, tx, rx, subcarrier)`;
/// - ground truth is `(sample, 2)` with column 0 = delay, column 1 = Doppler;
/// - each antenna position array has at least one port with 2 or 3
///   coordinates;
/// - a loaded trajectory has one entry per channel sample.
#[cfg_attr(feature = "python", pyclass)]
#[derive(Debug, Clone)]
pub struct ChannelDataset {
    channel: Array4<Complex32>,
    groundtruth: Array2<f64>,
    antennas: AntennaPositions,
    trajectory: Trajectory,
    channel_file: Option<PathBuf>,
    target_file: Option<PathBuf>,
}

impl ChannelDataset {
    /// Load a scenario from its channel file and, optionally, its target
    /// file.
    pub fn load(channel_path: &Path, target_path: Option<&Path>) -> Result<Self, DatasetError> {
        Self::load_with(&MeasurementReader, channel_path, target_path)
    }

    /// Load through a specific reader backend.
    pub fn load_with(
        io: &dyn MeasurementIO,
        channel_path: &Path,
        target_path: Option<&Path>,
    ) -> Result<Self, DatasetError> {
        let raw = io.read_channel(channel_path)?;

        let decoded = match raw.channel {
            ChannelSamples::Complex(samples) => samples,
            ChannelSamples::Interleaved(pairs) => decode_interleaved(pairs)?,
        };
        let channel = channel_tensor(decoded)?;
        let sample_count = channel.len_of(Axis(0));

        let groundtruth = groundtruth_from_raw(raw.delay, raw.doppler, sample_count)?;
        let antennas = AntennaPositions {
            tx: positions_from_raw(raw.tx_positions, "Tx positions")?,
            rx: positions_from_raw(raw.rx_positions, "Rx positions")?,
        };

        let trajectory = match target_path {
            Some(path) => Trajectory::Loaded(trajectory_from_raw(io.read_target(path)?, sample_count)?),
            None => Trajectory::NotLoaded,
        };

        let mut dataset = Self::from_parts(channel, groundtruth, antennas, trajectory)?;
        dataset.channel_file = Some(channel_path.to_path_buf());
        dataset.target_file = target_path.map(Path::to_path_buf);

        info!("-----Dataset loaded!-----");
        info!(
            "{} samples, {} Tx ports, {} Rx ports, {} subcarriers, trajectory {}",
            dataset.sample_count(),
            dataset.tx_count(),
            dataset.rx_count(),
            dataset.subcarrier_count(),
            if dataset.has_trajectory() { "loaded" } else { "not loaded" },
        );
        Ok(dataset)
    }

    /// Build a dataset from in-memory arrays, checking the same invariants
    /// as [`ChannelDataset::load`].
    pub fn from_parts(
        channel: Array4<Complex32>,
        groundtruth: Array2<f64>,
        antennas: AntennaPositions,
        trajectory: Trajectory,
    ) -> Result<Self, DatasetError> {
        let sample_count = channel.len_of(Axis(0));

        if groundtruth.dim() != (sample_count, 2) {
            return Err(DatasetError::ShapeMismatch {
                what: "ground truth",
                expected: format!("({}, 2)", sample_count),
                actual: format!("{:?}", groundtruth.dim()),
            });
        }

        for (what, positions) in [("Tx positions", &antennas.tx), ("Rx positions", &antennas.rx)] {
            let (ports, coords) = positions.dim();
            if ports == 0 || !(2..=3).contains(&coords) {
                return Err(DatasetError::ShapeMismatch {
                    what,
                    expected: "(ports >= 1, 2 or 3)".into(),
                    actual: format!("{:?}", positions.dim()),
                });
            }
        }

        if let Trajectory::Loaded(positions) = &trajectory {
            let (samples, targets, coords) = positions.dim();
            if samples != sample_count || targets == 0 || !(2..=3).contains(&coords) {
                return Err(DatasetError::ShapeMismatch {
                    what: "target trajectory",
                    expected: format!("({}, targets >= 1, 2 or 3)", sample_count),
                    actual: format!("{:?}", positions.dim()),
                });
            }
        }

        Ok(Self {
            channel,
            groundtruth,
            antennas,
            trajectory,
            channel_file: None,
            target_file: None,
        })
    }

    pub fn sample_count(&self) -> usize {
        self.channel.len_of(Axis(0))
    }

    pub fn tx_count(&self) -> usize {
        self.channel.len_of(Axis(1))
    }

    pub fn rx_count(&self) -> usize {
        self.channel.len_of(Axis(2))
    }

    pub fn subcarrier_count(&self) -> usize {
        self.channel.len_of(Axis(3))
    }

    /// Full channel tensor, `(sample, tx, rx, subcarrier)`.
    pub fn channel(&self) -> &Array4<Complex32> {
        &self.channel
    }

    /// Ground truth, `(sample, [delay, doppler])`.
    pub fn groundtruth(&self) -> ArrayView2<'_, f64> {
        self.groundtruth.view()
    }

    pub fn groundtruth_at(&self, sample: usize) -> Option<GroundTruthMarker> {
        (sample < self.sample_count()).then(|| GroundTruthMarker {
            delay_s: self.groundtruth[[sample, 0]],
            doppler_hz: self.groundtruth[[sample, 1]],
        })
    }

    pub fn antennas(&self) -> &AntennaPositions {
        &self.antennas
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn has_trajectory(&self) -> bool {
        self.trajectory.is_loaded()
    }

    pub fn channel_file(&self) -> Option<&Path> {
        self.channel_file.as_deref()
    }

    pub fn target_file(&self) -> Option<&Path> {
        self.target_file.as_deref()
    }

    /// Check that an antenna pair exists in this dataset.
    pub fn check_antennas(&self, antennas: AntennaPair) -> Result<(), DatasetError> {
        for (axis, index, size) in [
            (AntennaAxis::Tx, antennas.tx, self.tx_count()),
            (AntennaAxis::Rx, antennas.rx, self.rx_count()),
        ] {
            if index >= size {
                return Err(DatasetError::AntennaOutOfRange { axis, index, size });
            }
        }
        Ok(())
    }

    /// Borrow the `(sample, subcarrier)` plane of one antenna pair.
    pub fn channel_view(&self, antennas: AntennaPair) -> Result<ArrayView2<'_, Complex32>, DatasetError> {
        self.check_antennas(antennas)?;
        Ok(self.channel.slice(s![.., antennas.tx, antennas.rx, ..]))
    }

    /// Position of `target` at `sample`.
    pub fn target_position(&self, sample: usize, target: usize) -> Result<ArrayView1<'_, f64>, DatasetError> {
        let positions = self.trajectory.positions()?;
        let (samples, targets, _) = positions.dim();
        if sample >= samples {
            return Err(WindowError::OutOfRange {
                start: sample,
                length: 1,
                sample_count: samples,
            }
            .into());
        }
        if target >= targets {
            return Err(DatasetError::TargetOutOfRange {
                index: target,
                count: targets,
            });
        }
        Ok(positions.slice(s![sample, target, ..]))
    }

    /// Scale for the top-view position display.
    ///
    /// Uses the largest x or y separation between any Tx port and any Rx
    /// port or trajectory point, so every marker stays inside the unit
    /// square for the whole session.
    pub fn position_scale(&self) -> PositionScale {
        let tx = &self.antennas.tx;
        let origin = [tx[[0, 0]], tx[[0, 1]]];

        let separation = |a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>| {
            (a[0] - b[0]).abs().max((a[1] - b[1]).abs())
        };

        let mut max_separation = 0.0_f64;
        for t in tx.outer_iter() {
            for r in self.antennas.rx.outer_iter() {
                max_separation = max_separation.max(separation(t, r));
            }
            if let Trajectory::Loaded(positions) = &self.trajectory {
                for p in positions.lanes(Axis(2)) {
                    max_separation = max_separation.max(separation(t, p));
                }
            }
        }

        let scale = if max_separation.is_finite() && max_separation > 0.0 {
            max_separation * POSITION_MARGIN
        } else {
            1.0
        };
        PositionScale { origin, scale }
    }

    /// Number of complete windows of `length` samples (stride 1).
    pub fn window_count(&self, length: usize) -> usize {
        match length {
            0 => 0,
            l if l > self.sample_count() => 0,
            l => self.sample_count() - l + 1,
        }
    }

    /// Raw window with the annotations at its midpoint.
    ///
    /// `with_trajectory` additionally returns the target position and fails
    /// with [`DatasetError::MissingTrajectory`] when no target file was
    /// loaded.
    pub fn sample_window(
        &self,
        antennas: AntennaPair,
        start: usize,
        length: usize,
        with_trajectory: bool,
    ) -> Result<WindowSample<'_>, DatasetError> {
        let window = WindowSpec::new(start, length);
        window.check(self.sample_count())?;

        let channel = self
            .channel_view(antennas)?
            .slice_move(s![window.start_index..window.end(), ..]);
        let mid = window.midpoint();
        let target = if with_trajectory {
            Some(self.target_position(mid, 0)?)
        } else {
            None
        };

        Ok(WindowSample {
            channel,
            // `mid < end <= sample_count`, so the lookup always succeeds.
            groundtruth: self.groundtruth_at(mid).unwrap_or(GroundTruthMarker {
                delay_s: f64::NAN,
                doppler_hz: f64::NAN,
            }),
            target,
        })
    }
}

impl fmt::Display for ChannelDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = |p: Option<&Path>| p.map_or_else(|| "-".to_string(), |p| p.display().to_string());
        writeln!(f, "---- Dataset Summary ----")?;
        writeln!(f, "Channel:           {:?}", self.channel.dim())?;
        writeln!(f, "Groundtruth:       {:?}", self.groundtruth.dim())?;
        writeln!(
            f,
            "Antenna Positions: Tx {:?}, Rx {:?}",
            self.antennas.tx.dim(),
            self.antennas.rx.dim()
        )?;
        match &self.trajectory {
            Trajectory::Loaded(p) => writeln!(f, "UAV Positions:     {:?}", p.dim())?,
            Trajectory::NotLoaded => writeln!(f, "UAV Positions:     Not Loaded")?,
        }
        writeln!(f, "From Files:")?;
        writeln!(f, "  - Channel: {}", shown(self.channel_file()))?;
        write!(f, "  - Target:  {}", shown(self.target_file()))
    }
}

#[cfg(feature = "python")]
#[pymethods]
impl ChannelDataset {
    /// Load a scenario from Python.
    #[staticmethod]
    #[pyo3(name = "load", signature = (channel_path, target_path=None))]
    fn py_load(channel_path: &str, target_path: Option<&str>) -> PyResult<Self> {
        Self::load(Path::new(channel_path), target_path.map(Path::new))
            .map_err(|e| pyo3::exceptions::PyIOError::new_err(e.to_string()))
    }

    #[getter(sample_count)]
    fn py_sample_count(&self) -> usize {
        self.sample_count()
    }

    #[getter(tx_count)]
    fn py_tx_count(&self) -> usize {
        self.tx_count()
    }

    #[getter(rx_count)]
    fn py_rx_count(&self) -> usize {
        self.rx_count()
    }

    #[getter(subcarrier_count)]
    fn py_subcarrier_count(&self) -> usize {
        self.subcarrier_count()
    }

    #[getter(has_trajectory)]
    fn py_has_trajectory(&self) -> bool {
        self.has_trajectory()
    }

    #[pyo3(name = "groundtruth_at")]
    fn py_groundtruth_at(&self, sample: usize) -> Option<GroundTruthMarker> {
        self.groundtruth_at(sample)
    }

    fn __len__(&self) -> usize {
        self.sample_count()
    }

    fn __str__(&self) -> String {
        self.to_string()
    }

    fn __repr__(&self) -> String {
        format!(
            "ChannelDataset(samples={}, tx={}, rx={}, subcarriers={}, trajectory={})",
            self.sample_count(),
            self.tx_count(),
            self.rx_count(),
            self.subcarrier_count(),
            self.has_trajectory(),
        )
    }
}
