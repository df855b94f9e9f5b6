//! Interactive delay-Doppler viewer.
//!
//! The viewer is a small state machine driven by slider events.  It owns the
//! dataset, the engine and the control state, and pushes every new frame to
//! a [`PlotSurface`].  Keeping drawing behind a trait lets the state machine
//! run headless in tests; the egui front end (`gui` feature) is one
//! implementation.
//!
//! Controls are 1-based like the sliders a user sees: snapshot `k` is the
//! window starting at sample `(k - 1) * window_len`, and antenna slider
//! value `v` selects port `v - 1`.  Tx/Rx sliders exist only when that axis
//! has more than one port.

use log::{debug, info};
use ndarray::Array2;

use crate::dataset::{AntennaPair, ChannelDataset, PositionScale};
use crate::transform::{DelayDopplerEngine, TransformError};
use crate::types::{DelayDopplerFrame, DisplayRange, MapPoint, ViewerConfig, WindowError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised by the viewer.
#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("{sample_count} samples do not fill a single window of {window_len}")]
    NoSnapshots { sample_count: usize, window_len: usize },

    #[error("no {0:?} control: that antenna axis has a single port")]
    NoSuchControl(ControlId),

    #[error(transparent)]
    Transform(#[from] TransformError),
}

// ---------------------------------------------------------------------------
// Controls
// ---------------------------------------------------------------------------

/// An integer slider with an inclusive, 1-based range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Slider {
    pub label: &'static str,
    pub valmin: usize,
    pub valmax: usize,
    pub valinit: usize,
    val: usize,
}

impl Slider {
    pub fn new(label: &'static str, valmax: usize) -> Self {
        Self {
            label,
            valmin: 1,
            valmax,
            valinit: 1,
            val: 1,
        }
    }

    pub fn value(&self) -> usize {
        self.val
    }

    /// Set the value, clamped into `[valmin, valmax]`.  Returns the value
    /// actually stored.
    pub fn set(&mut self, value: usize) -> usize {
        self.val = value.clamp(self.valmin, self.valmax);
        self.val
    }

    /// 0-based index selected by the slider.
    pub fn index(&self) -> usize {
        self.val - self.valmin
    }

    pub fn reset(&mut self) {
        self.val = self.valinit;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlId {
    Snapshot,
    Tx,
    Rx,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewerEvent {
    /// A slider moved to the given 1-based value.
    SliderChanged(ControlId, usize),
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewerPhase {
    Idle,
    Updating,
}

/// Current value of every control.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewerState {
    pub snapshot: Slider,
    pub tx: Option<Slider>,
    pub rx: Option<Slider>,
}

impl ViewerState {
    fn new(snapshots: usize, tx_count: usize, rx_count: usize) -> Self {
        Self {
            snapshot: Slider::new("Idx_snapshot", snapshots),
            tx: (tx_count > 1).then(|| Slider::new("Idx_tx", tx_count)),
            rx: (rx_count > 1).then(|| Slider::new("Idx_rx", rx_count)),
        }
    }

    pub fn slider(&self, id: ControlId) -> Option<&Slider> {
        match id {
            ControlId::Snapshot => Some(&self.snapshot),
            ControlId::Tx => self.tx.as_ref(),
            ControlId::Rx => self.rx.as_ref(),
        }
    }

    fn slider_mut(&mut self, id: ControlId) -> Option<&mut Slider> {
        match id {
            ControlId::Snapshot => Some(&mut self.snapshot),
            ControlId::Tx => self.tx.as_mut(),
            ControlId::Rx => self.rx.as_mut(),
        }
    }

    /// Selected antenna pair; an omitted slider means port 0.
    pub fn antennas(&self) -> AntennaPair {
        AntennaPair {
            tx: self.tx.as_ref().map_or(0, Slider::index),
            rx: self.rx.as_ref().map_or(0, Slider::index),
        }
    }

    fn reset(&mut self) {
        self.snapshot.reset();
        self.tx.iter_mut().chain(self.rx.iter_mut()).for_each(Slider::reset);
    }
}

// ---------------------------------------------------------------------------
// Plot surface
// ---------------------------------------------------------------------------

/// Text shown next to the map.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Readout {
    /// 1-based snapshot number.
    pub snapshot: usize,
    pub antennas: AntennaPair,
    pub start_index: usize,
    pub delay_us: f64,
    pub doppler_hz: f64,
}

/// Drawing target of the viewer.  Calls arrive in the order `set_map`,
/// `set_groundtruth`, `set_target`, `set_readout`, `redraw`; `set_antennas`
/// is called once at construction.
pub trait PlotSurface {
    /// Replace the map image, `(doppler, delay)` in dB.
    fn set_map(&mut self, power_db: &Array2<f32>, display: &DisplayRange);

    /// Move the ground-truth marker, in map grid coordinates.
    fn set_groundtruth(&mut self, point: MapPoint);

    /// Move the target marker in the normalised top view; `None` hides it.
    fn set_target(&mut self, position: Option<[f64; 2]>);

    /// Antenna ports in the normalised top view.
    fn set_antennas(&mut self, tx: &[[f64; 2]], rx: &[[f64; 2]]);

    fn set_readout(&mut self, readout: &Readout);

    fn redraw(&mut self);
}

// ---------------------------------------------------------------------------
// Viewer
// ---------------------------------------------------------------------------

/// Interactive session over one dataset.
pub struct Viewer<S: PlotSurface> {
    dataset: ChannelDataset,
    engine: DelayDopplerEngine,
    config: ViewerConfig,
    state: ViewerState,
    positions: PositionScale,
    phase: ViewerPhase,
    frame: Option<DelayDopplerFrame>,
    surface: S,
}

impl<S: PlotSurface> Viewer<S> {
    /// Set up the controls for `dataset` and draw the first frame.
    pub fn new(dataset: ChannelDataset, config: ViewerConfig, surface: S) -> Result<Self, ViewerError> {
        if config.window_len == 0 {
            return Err(TransformError::from(WindowError::ZeroLength).into());
        }
        let snapshots = dataset.sample_count() / config.window_len;
        if snapshots == 0 {
            return Err(ViewerError::NoSnapshots {
                sample_count: dataset.sample_count(),
                window_len: config.window_len,
            });
        }

        let state = ViewerState::new(snapshots, dataset.tx_count(), dataset.rx_count());
        let positions = dataset.position_scale();
        let engine = DelayDopplerEngine::new(config.transform);

        let mut viewer = Self {
            dataset,
            engine,
            config,
            state,
            positions,
            phase: ViewerPhase::Idle,
            frame: None,
            surface,
        };

        let normalized = |ports: &Array2<f64>| -> Vec<[f64; 2]> {
            ports.outer_iter().map(|p| positions.normalize(p)).collect()
        };
        let tx = normalized(&viewer.dataset.antennas().tx);
        let rx = normalized(&viewer.dataset.antennas().rx);
        viewer.surface.set_antennas(&tx, &rx);

        info!(
            "Viewer ready: {} snapshots of {} samples, Tx slider {}, Rx slider {}",
            snapshots,
            viewer.config.window_len,
            if viewer.state.tx.is_some() { "on" } else { "off" },
            if viewer.state.rx.is_some() { "on" } else { "off" },
        );
        viewer.update()?;
        Ok(viewer)
    }

    /// Apply one event.  On failure the controls are restored to their
    /// values before the event and the surface is left as it was.
    pub fn handle(&mut self, event: ViewerEvent) -> Result<(), ViewerError> {
        let previous = self.state.clone();
        match event {
            ViewerEvent::SliderChanged(id, value) => {
                let slider = self.state.slider_mut(id).ok_or(ViewerError::NoSuchControl(id))?;
                let stored = slider.set(value);
                debug!("{:?} slider -> {} (requested {})", id, stored, value);
            }
            ViewerEvent::Reset => {
                self.state.reset();
                debug!("controls reset");
            }
        }

        self.update().inspect_err(|_| self.state = previous)
    }

    fn update(&mut self) -> Result<(), ViewerError> {
        self.phase = ViewerPhase::Updating;
        let result = self.render();
        self.phase = ViewerPhase::Idle;
        let frame = result?;

        let marker = frame.marker;
        self.surface.set_map(&frame.power_db, &self.config.display);
        self.surface.set_groundtruth(frame.marker_px);
        self.surface.set_target(frame.target_position);
        self.surface.set_readout(&Readout {
            snapshot: self.state.snapshot.value(),
            antennas: self.state.antennas(),
            start_index: frame.window.start_index,
            delay_us: marker.delay_us(),
            doppler_hz: marker.doppler_hz,
        });
        self.surface.redraw();
        self.frame = Some(frame);
        Ok(())
    }

    fn render(&self) -> Result<DelayDopplerFrame, TransformError> {
        let start = self.state.snapshot.index() * self.config.window_len;
        let window = self.config.window_at(start);
        let positions = self.dataset.has_trajectory().then_some(&self.positions);
        self.engine.frame(&self.dataset, self.state.antennas(), &window, positions)
    }

    pub fn state(&self) -> &ViewerState {
        &self.state
    }

    pub fn phase(&self) -> ViewerPhase {
        self.phase
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.snapshot.valmax
    }

    pub fn dataset(&self) -> &ChannelDataset {
        &self.dataset
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn position_scale(&self) -> &PositionScale {
        &self.positions
    }

    /// Most recently drawn frame.
    pub fn frame(&self) -> Option<&DelayDopplerFrame> {
        self.frame.as_ref()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::tests::toy_dataset;

    #[derive(Default)]
    struct RecordingSurface {
        maps: Vec<(usize, usize)>,
        groundtruth: Vec<MapPoint>,
        targets: Vec<Option<[f64; 2]>>,
        antennas: Vec<(usize, usize)>,
        readouts: Vec<Readout>,
        redraws: usize,
    }

    impl PlotSurface for RecordingSurface {
        fn set_map(&mut self, power_db: &Array2<f32>, _display: &DisplayRange) {
            self.maps.push(power_db.dim());
        }

        fn set_groundtruth(&mut self, point: MapPoint) {
            self.groundtruth.push(point);
        }

        fn set_target(&mut self, position: Option<[f64; 2]>) {
            self.targets.push(position);
        }

        fn set_antennas(&mut self, tx: &[[f64; 2]], rx: &[[f64; 2]]) {
            self.antennas.push((tx.len(), rx.len()));
        }

        fn set_readout(&mut self, readout: &Readout) {
            self.readouts.push(*readout);
        }

        fn redraw(&mut self) {
            self.redraws += 1;
        }
    }

    fn viewer(n: usize, tx: usize, rx: usize, trajectory: bool) -> Viewer<RecordingSurface> {
        Viewer::new(
            toy_dataset(n, tx, rx, 8, trajectory),
            ViewerConfig::default(),
            RecordingSurface::default(),
        )
        .unwrap()
    }

    #[test]
    fn construction_draws_first_snapshot() {
        let v = viewer(1000, 1, 1, false);
        assert_eq!(v.snapshot_count(), 10);
        assert_eq!(v.phase(), ViewerPhase::Idle);
        assert_eq!(v.surface().redraws, 1);
        assert_eq!(v.surface().antennas, vec![(1, 1)]);
        assert_eq!(v.surface().maps, vec![(100, 8)]);
        assert_eq!(v.surface().targets, vec![None]);
        let readout = v.surface().readouts[0];
        assert_eq!((readout.snapshot, readout.start_index), (1, 0));
        assert_eq!(v.frame().unwrap().marker, v.dataset().groundtruth_at(50).unwrap());
    }

    #[test]
    fn single_port_axes_have_no_slider() {
        let mut v = viewer(300, 1, 3, false);
        assert!(v.state().tx.is_none());
        assert_eq!(v.state().rx.as_ref().unwrap().valmax, 3);
        assert!(matches!(
            v.handle(ViewerEvent::SliderChanged(ControlId::Tx, 1)),
            Err(ViewerError::NoSuchControl(ControlId::Tx))
        ));
        assert_eq!(v.surface().redraws, 1);
    }

    #[test]
    fn slider_values_map_to_zero_based_indices() {
        let mut v = viewer(300, 2, 3, false);
        v.handle(ViewerEvent::SliderChanged(ControlId::Rx, 3)).unwrap();
        v.handle(ViewerEvent::SliderChanged(ControlId::Tx, 2)).unwrap();
        v.handle(ViewerEvent::SliderChanged(ControlId::Snapshot, 3)).unwrap();

        assert_eq!(v.state().antennas(), AntennaPair::new(1, 2));
        let readout = *v.surface().readouts.last().unwrap();
        assert_eq!(readout.antennas, AntennaPair::new(1, 2));
        assert_eq!(readout.start_index, 200);
        assert_eq!(v.frame().unwrap().marker, v.dataset().groundtruth_at(250).unwrap());
        assert_eq!(v.surface().redraws, 4);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let mut v = viewer(500, 1, 1, false);
        v.handle(ViewerEvent::SliderChanged(ControlId::Snapshot, 99)).unwrap();
        assert_eq!(v.state().snapshot.value(), 5);
        v.handle(ViewerEvent::SliderChanged(ControlId::Snapshot, 0)).unwrap();
        assert_eq!(v.state().snapshot.value(), 1);
    }

    #[test]
    fn reset_restores_controls_with_one_update() {
        let mut v = viewer(500, 2, 2, false);
        v.handle(ViewerEvent::SliderChanged(ControlId::Snapshot, 4)).unwrap();
        v.handle(ViewerEvent::SliderChanged(ControlId::Tx, 2)).unwrap();
        let before = v.surface().redraws;

        v.handle(ViewerEvent::Reset).unwrap();
        assert_eq!(v.surface().redraws, before + 1);
        assert_eq!(v.state().snapshot.value(), 1);
        assert_eq!(v.state().antennas(), AntennaPair::default());
        assert_eq!(v.surface().readouts.last().unwrap().start_index, 0);
    }

    #[test]
    fn failed_update_restores_slider_and_leaves_surface() {
        // With window_len 1 the last window has no extra sample, so the
        // clutter filter leaves it empty.
        let config = ViewerConfig {
            window_len: 1,
            filter_clutter: true,
            ..ViewerConfig::default()
        };
        let mut v = Viewer::new(toy_dataset(3, 1, 1, 4, false), config, RecordingSurface::default()).unwrap();
        v.handle(ViewerEvent::SliderChanged(ControlId::Snapshot, 2)).unwrap();
        let redraws = v.surface().redraws;

        let err = v.handle(ViewerEvent::SliderChanged(ControlId::Snapshot, 3)).unwrap_err();
        assert!(matches!(err, ViewerError::Transform(TransformError::EmptyWindow { start: 2 })));
        assert_eq!(v.state().snapshot.value(), 2);
        assert_eq!(v.surface().redraws, redraws);
        assert_eq!(v.surface().maps.len(), redraws);
        assert_eq!(v.phase(), ViewerPhase::Idle);
    }

    #[test]
    fn trajectory_drives_target_marker() {
        let v = viewer(400, 1, 1, true);
        let target = v.surface().targets[0].unwrap();
        let expected = v.position_scale().normalize(v.dataset().target_position(50, 0).unwrap());
        assert_eq!(target, expected);
    }

    #[test]
    fn too_short_dataset_has_no_snapshots() {
        let result = Viewer::new(
            toy_dataset(99, 1, 1, 4, false),
            ViewerConfig::default(),
            RecordingSurface::default(),
        );
        assert!(matches!(
            result,
            Err(ViewerError::NoSnapshots { sample_count: 99, window_len: 100 })
        ));
    }
}
