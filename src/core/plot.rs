//! Classic three panel GSEA enrichment plot rendered to SVG.

use plotters::prelude::*;
use std::path::{Path, PathBuf};

use crate::core::enrichment::gsea::enrichment_score;
use crate::core::enrichment::ranking::RankingStatistic;
use crate::core::enrichment::results::EnrichmentResult;
use crate::error::{GseaError, Result};
use crate::utils::general::{array_max, array_min};

////////////////
// Structures //
////////////////

/// Everything needed to draw the enrichment plot of one gene set
///
/// ### Fields
///
/// * `term` - Name of the gene set, used as the title
/// * `running_es` - Running enrichment score, one value per rank position
/// * `hits` - Rank positions of the gene set members
/// * `hit_profile` - Signed hit weight per rank position; decides the tick
///   colour
/// * `es` - Enrichment score
/// * `nes` - Normalised enrichment score
/// * `pval` - Nominal p-value
/// * `fdr` - FDR q-value
/// * `output` - Optional path the SVG gets written to
/// * `size` - Width and height in pixels
#[derive(Clone, Debug)]
pub struct GseaPlot {
    pub term: String,
    pub running_es: Vec<f64>,
    pub hits: Vec<usize>,
    pub hit_profile: Vec<f64>,
    pub es: f64,
    pub nes: Option<f64>,
    pub pval: f64,
    pub fdr: f64,
    pub output: Option<PathBuf>,
    pub size: (u32, u32),
}

impl GseaPlot {
    /// Build the plot configuration from an enrichment result
    ///
    /// ### Params
    ///
    /// * `result` - The enrichment result of the gene set
    /// * `ranking` - The ranking the result was computed on
    /// * `weight` - The GSEA weight used for the run
    pub fn from_result(result: &EnrichmentResult, ranking: &RankingStatistic, weight: f64) -> Self {
        let hit_profile = enrichment_score(ranking.scores(), &result.hits, weight).hit_profile;
        Self {
            term: result.term.clone(),
            running_es: result.running_es.clone(),
            hits: result.hits.clone(),
            hit_profile,
            es: result.es,
            nes: result.nes,
            pval: result.pval,
            fdr: result.fdr,
            output: None,
            size: (800, 600),
        }
    }

    /// Write the rendered SVG to `path`
    pub fn with_output<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.output = Some(path.as_ref().to_path_buf());
        self
    }
}

/// A rendered plot
#[derive(Clone, Debug, PartialEq)]
pub struct PlotImage {
    pub svg: String,
}

//////////////
// Plotting //
//////////////

/// Pad a value range so it is never empty
fn padded(lo: f64, hi: f64) -> (f64, f64) {
    let pad = ((hi - lo) * 0.05).max(1e-3);
    (lo - pad, hi + pad)
}

/// Draw the enrichment plot
///
/// Panels from top to bottom: running enrichment score with the ES peak, the
/// hit ticks (red for positive, blue for negative ranking scores) and the
/// ranked metric.
///
/// ### Params
///
/// * `ranking` - The ranking of the run
/// * `config` - The `GseaPlot` configuration
///
/// ### Returns
///
/// The `PlotImage`; the SVG is also written to `config.output` if set.
pub fn plot(ranking: &RankingStatistic, config: &GseaPlot) -> Result<PlotImage> {
    let n = ranking.len();
    if n == 0 {
        return Err(GseaError::Data("cannot plot an empty ranking".into()));
    }
    if config.running_es.len() != n || config.hit_profile.len() != n {
        return Err(GseaError::Data(format!(
            "plot of '{}' has {} running scores and {} hit weights for {} ranked genes",
            config.term,
            config.running_es.len(),
            config.hit_profile.len(),
            n
        )));
    }
    if let Some(&h) = config.hits.iter().find(|&&h| h >= n) {
        return Err(GseaError::Data(format!(
            "hit position {} outside of the ranking of {} genes",
            h, n
        )));
    }

    let running = &config.running_es;
    let scores = ranking.scores();
    let peak = running.iter().enumerate().fold(0, |best, (i, &v)| {
        let better = if config.es >= 0.0 { v > running[best] } else { v < running[best] };
        if better {
            i
        } else {
            best
        }
    });
    let (es_lo, es_hi) = padded(array_min(running).min(0.0), array_max(running).max(0.0));
    let (sc_lo, sc_hi) = padded(array_min(scores).min(0.0), array_max(scores).max(0.0));
    let nes = config
        .nes
        .map_or_else(|| "NA".to_string(), |v| format!("{:.3}", v));

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, config.size).into_drawing_area();
        root.fill(&WHITE)?;
        let root = root.titled(&config.term, ("sans-serif", 18))?;
        let (_, height) = root.dim_in_pixel();
        let (es_area, rest) = root.split_vertically(height * 55 / 100);
        let (hit_area, metric_area) = rest.split_vertically(height * 12 / 100);

        // running enrichment score
        let mut es_chart = ChartBuilder::on(&es_area)
            .margin(10)
            .x_label_area_size(0)
            .y_label_area_size(60)
            .caption(
                format!(
                    "ES = {:.3}   NES = {}   p = {:.3}   FDR = {:.3}",
                    config.es, nes, config.pval, config.fdr
                ),
                ("sans-serif", 14),
            )
            .build_cartesian_2d(0..n, es_lo..es_hi)?;
        es_chart
            .configure_mesh()
            .disable_x_mesh()
            .y_desc("Enrichment score")
            .draw()?;
        es_chart.draw_series(std::iter::once(PathElement::new(
            vec![(0, 0.0), (n - 1, 0.0)],
            BLACK.mix(0.4),
        )))?;
        es_chart.draw_series(std::iter::once(PathElement::new(
            vec![(peak, es_lo), (peak, es_hi)],
            RED.mix(0.6).stroke_width(1),
        )))?;
        es_chart.draw_series(LineSeries::new(
            running.iter().enumerate().map(|(i, &v)| (i, v)),
            GREEN.stroke_width(2),
        ))?;

        // hit ticks
        let mut hit_chart = ChartBuilder::on(&hit_area)
            .margin_left(10)
            .margin_right(10)
            .x_label_area_size(0)
            .y_label_area_size(60)
            .build_cartesian_2d(0..n, 0.0..1.0)?;
        hit_chart.draw_series(config.hits.iter().map(|&h| {
            let w = config.hit_profile[h];
            let color = if w > 0.0 {
                RED
            } else if w < 0.0 {
                BLUE
            } else {
                BLACK
            };
            PathElement::new(vec![(h, 0.0), (h, 1.0)], color.stroke_width(1))
        }))?;

        // ranked list metric
        let mut metric_chart = ChartBuilder::on(&metric_area)
            .margin(10)
            .x_label_area_size(35)
            .y_label_area_size(60)
            .build_cartesian_2d(0..n, sc_lo..sc_hi)?;
        metric_chart
            .configure_mesh()
            .disable_mesh()
            .x_desc("Rank in ordered dataset")
            .y_desc("Ranked list metric")
            .draw()?;
        metric_chart.draw_series(AreaSeries::new(
            scores.iter().enumerate().map(|(i, &s)| (i, s)),
            0.0,
            BLACK.mix(0.3),
        ))?;

        root.present()?;
    }

    if let Some(path) = &config.output {
        std::fs::write(path, &svg).map_err(|e| GseaError::io(path, e))?;
        tracing::info!(term = %config.term, path = %path.display(), "enrichment plot written");
    }

    Ok(PlotImage { svg })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> (RankingStatistic, GseaPlot) {
        let ranking = RankingStatistic::from_pairs(vec![("G1", 5.0), ("G2", 3.0), ("G3", -2.0)]);
        let stats = enrichment_score(ranking.scores(), &[0, 2], 1.0);
        let config = GseaPlot {
            term: "TEST_SET".to_string(),
            running_es: stats.running_es,
            hits: vec![0, 2],
            hit_profile: stats.hit_profile,
            es: stats.es,
            nes: Some(1.2),
            pval: 0.01,
            fdr: 0.05,
            output: None,
            size: (640, 480),
        };
        (ranking, config)
    }

    #[test]
    fn test_plot_svg() {
        let (ranking, config) = scenario();
        let image = plot(&ranking, &config).unwrap();
        assert!(image.svg.contains("<svg"));
        assert!(image.svg.contains("TEST_SET"));
        // same inputs, same picture
        assert_eq!(plot(&ranking, &config).unwrap(), image);
    }

    #[test]
    fn test_plot_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_set.svg");
        let (ranking, config) = scenario();
        let image = plot(&ranking, &config.with_output(&path)).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, image.svg);
    }

    #[test]
    fn test_plot_length_mismatch() {
        let (ranking, mut config) = scenario();
        config.running_es.pop();
        assert!(matches!(plot(&ranking, &config), Err(GseaError::Data(_))));
    }
}
