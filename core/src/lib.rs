//! # ddmap-core
//!
//! Delay-Doppler post-processing of UAV radar channel measurements, with
//! optional Python bindings via [PyO3](https://pyo3.rs) and an optional
//! desktop viewer.
//!
//! ## Overview
//!
//! | Module        | Purpose                                                      |
//! |---------------|--------------------------------------------------------------|
//! | [`dataset`]   | Loads channel/target HDF5 files into a validated dataset     |
//! | [`transform`] | Turns a slow-time window into a delay-Doppler map            |
//! | [`viewer`]    | Slider-driven viewer state machine over a plot surface       |
//! | [`acquire`]   | Downloads, decrypts, unpacks and verifies published scenarios|
//! | [`types`]     | Shared data structures (windows, markers, params, config)    |
//! | `gui`         | egui front end for the viewer (feature `gui`)                |
//!
//! ## Features
//!
//! - `hdf5-support`: HDF5 reader (needs the HDF5 C library).
//! - `python`: the `ddmap_core` Python module (`extension-module` for wheels).
//! - `fetch`: HTTP download in [`acquire`].
//! - `gui`: the desktop viewer and the `ddmap view` command.
//!
//! ## Python usage
//!
//! ```python
//! import ddmap_core
//!
//! ds = ddmap_core.ChannelDataset.load("1_sinwave_channel.h5", "1_sinwave_target.h5")
//! engine = ddmap_core.DelayDopplerEngine(ddmap_core.TransformParams(delay_bins=80))
//! frame = engine.frame(ds, ddmap_core.WindowSpec(5000, 200, filter_clutter=True))
//! print(frame.marker, frame.shape())
//! ```

pub mod acquire;
pub mod dataset;
#[cfg(feature = "gui")]
pub mod gui;
pub mod transform;
pub mod types;
pub mod viewer;

// Re-export the most commonly used items at crate root for convenience.
pub use dataset::{AntennaPair, ChannelDataset, DatasetError, PositionScale, Trajectory};
pub use transform::{DelayDopplerEngine, TransformError};
pub use types::{
    DelayDopplerFrame, GroundTruthMarker, MapPoint, MeasurementParams, TransformParams, ViewerConfig,
    WindowError, WindowSpec,
};
pub use viewer::{PlotSurface, Viewer, ViewerError, ViewerEvent};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// The top-level Python module exposed by this crate.
///
/// Registered classes:
/// - `ChannelDataset`: scenario loader
/// - `DelayDopplerEngine`: the transform engine
/// - `DelayDopplerFrame`: one computed map with its markers
/// - `WindowSpec`, `TransformParams`, `MeasurementParams`: configuration
/// - `GroundTruthMarker`, `MapPoint`: marker values
#[cfg(feature = "python")]
#[pymodule]
fn ddmap_core(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<ChannelDataset>()?;
    m.add_class::<DelayDopplerEngine>()?;
    m.add_class::<DelayDopplerFrame>()?;
    m.add_class::<WindowSpec>()?;
    m.add_class::<TransformParams>()?;
    m.add_class::<MeasurementParams>()?;
    m.add_class::<GroundTruthMarker>()?;
    m.add_class::<MapPoint>()?;

    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add("__doc__", "Delay-Doppler post-processing of UAV channel measurements.")?;

    Ok(())
}
