//! Loss series, loss-curve plots and validation images.
//!
//! Nothing in here may stop a training run: write failures are logged and
//! reported as `None`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::TrainingConfig;
use crate::error::Result;
use crate::lora::AdapterRegistry;
use crate::model::DiffusionBackend;

/// Directory under the output path holding plots and images.
pub const VALIDATION_DIR: &str = "_validation";

/// A recorded loss value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossPoint {
    /// Global step the loss was recorded at.
    pub step: usize,
    /// Batch loss.
    pub loss: f64,
}

/// Recorded losses in step order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    points: Vec<LossPoint>,
}

impl LossHistory {
    /// Append a loss value.
    pub fn record_loss(&mut self, step: usize, loss: f64) {
        self.points.push(LossPoint { step, loss });
    }

    /// All recorded points.
    #[must_use]
    pub fn points(&self) -> &[LossPoint] {
        &self.points
    }

    /// Number of recorded points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Most recent point.
    #[must_use]
    pub fn last(&self) -> Option<LossPoint> {
        self.points.last().copied()
    }

    /// Render the series as an SVG line chart.
    #[must_use]
    pub fn render_svg(&self) -> String {
        let width = 640.0;
        let height = 360.0;
        let margin = 50.0;
        let plot_w = width - 2.0 * margin;
        let plot_h = height - 2.0 * margin;

        let finite: Vec<LossPoint> = self
            .points
            .iter()
            .copied()
            .filter(|p| p.loss.is_finite())
            .collect();

        let mut svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {width} {height}">"#
        );
        let _ = write!(
            svg,
            r#"<text x="{}" y="20" text-anchor="middle" font-size="14" "#,
            width / 2.0
        );
        svg.push_str(r#"font-weight="bold">Training loss</text>"#);
        let _ = write!(
            svg,
            r##"<rect x="{margin}" y="{margin}" width="{plot_w}" height="{plot_h}" "##
        );
        svg.push_str(r##"fill="none" stroke="#ccc"/>"##);

        if let (Some(first), Some(last)) = (finite.first(), finite.last()) {
            let (min_step, max_step) = (first.step as f64, last.step as f64);
            let min_loss = finite.iter().map(|p| p.loss).fold(f64::INFINITY, f64::min);
            let max_loss = finite.iter().map(|p| p.loss).fold(f64::NEG_INFINITY, f64::max);
            let step_span = (max_step - min_step).max(1.0);
            let loss_span = (max_loss - min_loss).max(f64::EPSILON);

            let points: Vec<String> = finite
                .iter()
                .map(|p| {
                    let x = margin + (p.step as f64 - min_step) / step_span * plot_w;
                    let y = margin + plot_h - (p.loss - min_loss) / loss_span * plot_h;
                    format!("{x:.1},{y:.1}")
                })
                .collect();
            let _ = write!(
                svg,
                r#"<polyline fill="none" stroke="steelblue" stroke-width="1.5" points="{}"/>"#,
                points.join(" ")
            );

            let _ = write!(
                svg,
                r#"<text x="{}" y="{}" text-anchor="end" font-size="10">{max_loss:.4}</text>"#,
                margin - 5.0,
                margin + 4.0
            );
            let _ = write!(
                svg,
                r#"<text x="{}" y="{}" text-anchor="end" font-size="10">{min_loss:.4}</text>"#,
                margin - 5.0,
                margin + plot_h
            );
            let _ = write!(
                svg,
                r#"<text x="{margin}" y="{}" text-anchor="start" font-size="10">step {}</text>"#,
                height - margin + 15.0,
                first.step
            );
            let _ = write!(
                svg,
                r#"<text x="{}" y="{}" text-anchor="end" font-size="10">step {}</text>"#,
                width - margin,
                height - margin + 15.0,
                last.step
            );
        }

        svg.push_str("</svg>");
        svg
    }
}

/// Writes plots and validation images under `<output>/_validation`.
#[derive(Debug, Clone)]
pub struct Instrumentation {
    plots_dir: PathBuf,
    images_dir: PathBuf,
    prompt: Option<String>,
    seed: u64,
}

impl Instrumentation {
    /// Instrumentation for a run.
    #[must_use]
    pub fn new(config: &TrainingConfig) -> Self {
        let root = config.save.output_path.join(VALIDATION_DIR);
        Self {
            plots_dir: root.join("plots"),
            images_dir: root.join("images"),
            prompt: config.validation_prompt().map(str::to_string),
            seed: config.seed,
        }
    }

    /// Where the plot for `step` goes.
    #[must_use]
    pub fn plot_path(&self, step: usize) -> PathBuf {
        self.plots_dir.join(format!("{step:07}_loss.svg"))
    }

    /// Where the validation image for `step` goes.
    #[must_use]
    pub fn image_path(&self, step: usize) -> PathBuf {
        self.images_dir.join(format!("{step:07}_image.png"))
    }

    /// Render the loss curve for `step`.
    pub fn write_loss_plot(&self, step: usize, history: &LossHistory) -> Option<PathBuf> {
        let path = self.plot_path(step);
        match write_file(&path, history.render_svg().as_bytes()) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(step, error = %e, "failed to write loss plot");
                None
            }
        }
    }

    /// Render a validation image with the current adapters.
    pub fn generate_validation_image<B: DiffusionBackend + ?Sized>(
        &self,
        step: usize,
        backend: &B,
        adapters: &AdapterRegistry,
    ) -> Option<PathBuf> {
        let Some(prompt) = self.prompt.as_deref() else {
            warn!(step, "no validation prompt; skipping validation image");
            return None;
        };
        let path = self.image_path(step);
        let result = backend
            .generate_image(prompt, self.seed, adapters)
            .and_then(|image| {
                std::fs::create_dir_all(&self.images_dir)?;
                image.save(&path)?;
                Ok(())
            });
        match result {
            Ok(()) => {
                info!(step, path = %path.display(), "Saved validation image");
                Some(path)
            }
            Err(e) => {
                warn!(step, error = %e, "validation image generation failed");
                None
            }
        }
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)?;
    Ok(())
}
