//! Desktop front end for the [`Viewer`](crate::viewer::Viewer), built on
//! eframe/egui.
//!
//! [`EguiSurface`] implements [`PlotSurface`] by keeping the latest map in
//! a single texture that is replaced in place; [`ViewerApp`] lays out the
//! controls, the delay-Doppler image and the top-view position plot.

use egui::{Color32, ColorImage, TextureHandle, TextureOptions};
use egui_plot::{Legend, MarkerShape, Plot, PlotImage, PlotPoint, Points};
use ndarray::Array2;

use crate::dataset::ChannelDataset;
use crate::types::{DisplayRange, MapPoint, ViewerConfig};
use crate::viewer::{ControlId, PlotSurface, Readout, Viewer, ViewerError, ViewerEvent};

/// Colour stops of the map palette, dark (floor) to bright (ceiling).
const PALETTE: [[u8; 3]; 5] = [
    [0, 0, 4],
    [87, 16, 110],
    [188, 55, 84],
    [249, 142, 9],
    [252, 255, 164],
];

fn palette(t: f32) -> Color32 {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    let scaled = t * (PALETTE.len() - 1) as f32;
    let i = (scaled.floor() as usize).min(PALETTE.len() - 2);
    let f = scaled - i as f32;
    let lerp = |a: u8, b: u8| (f32::from(a) + (f32::from(b) - f32::from(a)) * f).round() as u8;
    let (a, b) = (PALETTE[i], PALETTE[i + 1]);
    Color32::from_rgb(lerp(a[0], b[0]), lerp(a[1], b[1]), lerp(a[2], b[2]))
}

/// Render a `(doppler, delay)` dB map as an image with delay along x and
/// the most positive Doppler at the top.
fn map_image(power_db: &Array2<f32>, display: &DisplayRange) -> ColorImage {
    let (rows, cols) = power_db.dim();
    let span = (display.ceil_db - display.floor_db).max(f32::EPSILON);
    let mut image = ColorImage::new([cols, rows], Color32::BLACK);
    for ((r, c), &db) in power_db.indexed_iter() {
        image[(c, rows - 1 - r)] = palette((db - display.floor_db) / span);
    }
    image
}

// ---------------------------------------------------------------------------
// Surface
// ---------------------------------------------------------------------------

pub struct EguiSurface {
    ctx: egui::Context,
    texture: Option<TextureHandle>,
    map_size: [usize; 2],
    groundtruth: Option<MapPoint>,
    target: Option<[f64; 2]>,
    tx: Vec<[f64; 2]>,
    rx: Vec<[f64; 2]>,
    readout: Option<Readout>,
}

impl EguiSurface {
    pub fn new(ctx: egui::Context) -> Self {
        Self {
            ctx,
            texture: None,
            map_size: [0, 0],
            groundtruth: None,
            target: None,
            tx: Vec::new(),
            rx: Vec::new(),
            readout: None,
        }
    }
}

impl PlotSurface for EguiSurface {
    fn set_map(&mut self, power_db: &Array2<f32>, display: &DisplayRange) {
        let image = map_image(power_db, display);
        self.map_size = image.size;
        match &mut self.texture {
            Some(texture) => texture.set(image, TextureOptions::NEAREST),
            None => {
                self.texture = Some(self.ctx.load_texture("delay_doppler_map", image, TextureOptions::NEAREST));
            }
        }
    }

    fn set_groundtruth(&mut self, point: MapPoint) {
        self.groundtruth = Some(point);
    }

    fn set_target(&mut self, position: Option<[f64; 2]>) {
        self.target = position;
    }

    fn set_antennas(&mut self, tx: &[[f64; 2]], rx: &[[f64; 2]]) {
        self.tx = tx.to_vec();
        self.rx = rx.to_vec();
    }

    fn set_readout(&mut self, readout: &Readout) {
        self.readout = Some(*readout);
    }

    fn redraw(&mut self) {
        self.ctx.request_repaint();
    }
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

pub struct ViewerApp {
    viewer: Viewer<EguiSurface>,
    error: Option<String>,
}

impl ViewerApp {
    pub fn new(
        cc: &eframe::CreationContext<'_>,
        dataset: ChannelDataset,
        config: ViewerConfig,
    ) -> Result<Self, ViewerError> {
        let surface = EguiSurface::new(cc.egui_ctx.clone());
        Ok(Self {
            viewer: Viewer::new(dataset, config, surface)?,
            error: None,
        })
    }

    fn controls(&mut self, ui: &mut egui::Ui) {
        let state = self.viewer.state().clone();
        let mut events = Vec::new();

        ui.heading("Controls");
        let sliders = [
            (ControlId::Snapshot, Some(&state.snapshot)),
            (ControlId::Tx, state.tx.as_ref()),
            (ControlId::Rx, state.rx.as_ref()),
        ];
        for (id, slider) in sliders {
            let Some(slider) = slider else { continue };
            let mut value = slider.value();
            let changed = ui
                .add(egui::Slider::new(&mut value, slider.valmin..=slider.valmax).text(slider.label))
                .changed();
            if changed {
                events.push(ViewerEvent::SliderChanged(id, value));
            }
        }
        if ui.button("Reset").clicked() {
            events.push(ViewerEvent::Reset);
        }

        for event in events {
            self.error = self.viewer.handle(event).err().map(|e| e.to_string());
        }

        ui.separator();
        if let Some(readout) = self.viewer.surface().readout {
            ui.label(format!("Snapshot {} (sample {})", readout.snapshot, readout.start_index));
            ui.label(format!("Tx {} / Rx {}", readout.antennas.tx + 1, readout.antennas.rx + 1));
            ui.label(format!("Delay: {:.3} us", readout.delay_us));
            ui.label(format!("Doppler: {:.1} Hz", readout.doppler_hz));
        }
        if let Some(error) = &self.error {
            ui.colored_label(Color32::LIGHT_RED, error);
        }
    }

    fn map_plot(&self, ui: &mut egui::Ui) {
        let surface = self.viewer.surface();
        let [cols, rows] = surface.map_size;
        let half = (rows / 2) as f64;

        Plot::new("delay_doppler_map")
            .legend(Legend::default())
            .x_axis_label("Delay bin")
            .y_axis_label("Doppler bin")
            .y_axis_formatter(move |mark, _range| format!("{:.0}", mark.value - half))
            .allow_drag(false)
            .show(ui, |plot_ui| {
                if let Some(texture) = &surface.texture {
                    // Pixel centres sit on integer bin coordinates.
                    plot_ui.image(PlotImage::new(
                        texture,
                        PlotPoint::new(cols as f64 / 2.0 - 0.5, rows as f64 / 2.0 - 0.5),
                        egui::vec2(cols as f32, rows as f32),
                    ));
                }
                if let Some(point) = surface.groundtruth {
                    plot_ui.points(
                        Points::new(vec![[point.col, point.row]])
                            .name("Target")
                            .shape(MarkerShape::Cross)
                            .color(Color32::from_rgb(100, 255, 100))
                            .radius(6.0),
                    );
                }
            });
    }

    fn position_plot(&self, ui: &mut egui::Ui) {
        let surface = self.viewer.surface();
        Plot::new("position_map")
            .legend(Legend::default())
            .data_aspect(1.0)
            .include_x(0.0)
            .include_x(1.0)
            .include_y(0.0)
            .include_y(1.0)
            .x_axis_formatter(|mark, _range| format!("{:.1}", mark.value - 0.5))
            .y_axis_formatter(|mark, _range| format!("{:.1}", mark.value - 0.5))
            .show(ui, |plot_ui| {
                if let Some(target) = surface.target {
                    plot_ui.points(
                        Points::new(vec![target])
                            .name("Target")
                            .color(Color32::from_rgb(100, 200, 255))
                            .radius(5.0),
                    );
                }
                plot_ui.points(
                    Points::new(surface.tx.clone())
                        .name("Tx")
                        .shape(MarkerShape::Square)
                        .color(Color32::from_rgb(255, 160, 60))
                        .radius(5.0),
                );
                plot_ui.points(
                    Points::new(surface.rx.clone())
                        .name("Rx")
                        .shape(MarkerShape::Diamond)
                        .color(Color32::from_rgb(220, 80, 220))
                        .radius(5.0),
                );
            });
    }
}

impl eframe::App for ViewerApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        egui::SidePanel::left("controls").min_width(220.0).show(ctx, |ui| {
            self.controls(ui);
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.columns(2, |columns| {
                columns[0].heading("Delay-Doppler map");
                self.map_plot(&mut columns[0]);
                columns[1].heading("Position map (top view, normalized)");
                self.position_plot(&mut columns[1]);
            });
        });
    }
}

/// Open the viewer window and block until it is closed.
pub fn run(dataset: ChannelDataset, config: ViewerConfig) -> eframe::Result<()> {
    let native_options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1400.0, 700.0])
            .with_title("Delay-Doppler viewer"),
        ..Default::default()
    };

    eframe::run_native(
        "Delay-Doppler viewer",
        native_options,
        Box::new(move |cc| Ok(Box::new(ViewerApp::new(cc, dataset, config)?))),
    )
}
