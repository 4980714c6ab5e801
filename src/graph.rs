//! Confidence graph rendering.
//!
//! One point per chosen page variant: x is the page number parsed from
//! the filename, y the average OCR confidence. Pages more than two
//! standard deviations below the mean are labelled so a skim of the graph
//! points straight at the worst scans.

use plotters::prelude::*;

use crate::{naming, prelude::*};

const SIZE: (u32, u32) = (1200, 800);

/// How many standard deviations from the mean marks an outlier.
const OUTLIER_SIGMA: f64 = 2.0;

/// Render `graph.png`-style output for `(hocr name, confidence)` pairs.
///
/// Returns `Ok(false)` without writing anything when fewer than two
/// usable points exist; a one-page book has no trend worth plotting.
pub fn render(points: &[(String, f64)], title: &str, out: &Path) -> Result<bool> {
    if points.len() < 2 {
        return Ok(false);
    }

    // Page numbers come from the filename prefix. If that fails for every
    // file, fall back to input order so the graph still renders.
    let numbered: Vec<(u32, &str, f64)> = if points
        .iter()
        .any(|(name, _)| naming::page_number(name).is_some())
    {
        points
            .iter()
            .filter_map(|(name, conf)| {
                naming::page_number(name).map(|n| (n, name.as_str(), *conf))
            })
            .collect()
    } else {
        points
            .iter()
            .enumerate()
            .map(|(i, (name, conf))| (i as u32 + 1, name.as_str(), *conf))
            .collect()
    };
    if numbered.len() < 2 {
        return Ok(false);
    }

    let mut series = numbered;
    series.sort_by_key(|&(page, _, _)| page);

    let mean = series.iter().map(|&(_, _, c)| c).sum::<f64>() / series.len() as f64;
    let variance = series
        .iter()
        .map(|&(_, _, c)| (c - mean).powi(2))
        .sum::<f64>()
        / series.len() as f64;
    let cutoff = mean - OUTLIER_SIGMA * variance.sqrt();

    let x_min = series.first().map(|&(p, _, _)| p).unwrap_or(0);
    let x_max = series.last().map(|&(p, _, _)| p).unwrap_or(1).max(x_min + 1);

    let root = BitMapBackend::new(out, SIZE).into_drawing_area();
    root.fill(&WHITE)
        .map_err(|err| anyhow!("failed to clear graph canvas: {err}"))?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 30))
        .margin(15)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(x_min..x_max + 1, 0.0..100.0f64)
        .map_err(|err| anyhow!("failed to build graph axes: {err}"))?;

    chart
        .configure_mesh()
        .x_desc("page")
        .y_desc("confidence")
        .draw()
        .map_err(|err| anyhow!("failed to draw graph mesh: {err}"))?;

    chart
        .draw_series(LineSeries::new(
            series.iter().map(|&(p, _, c)| (p, c)),
            &BLUE,
        ))
        .map_err(|err| anyhow!("failed to draw graph line: {err}"))?;

    chart
        .draw_series(
            series
                .iter()
                .map(|&(p, _, c)| Circle::new((p, c), 3, BLUE.filled())),
        )
        .map_err(|err| anyhow!("failed to draw graph points: {err}"))?;

    // Label the outliers with their page numbers.
    chart
        .draw_series(series.iter().filter(|&&(_, _, c)| c < cutoff).map(
            |&(p, _, c)| {
                Text::new(format!("{p}"), (p, c - 3.0), ("sans-serif", 16).into_font())
            },
        ))
        .map_err(|err| anyhow!("failed to annotate graph outliers: {err}"))?;

    root.present()
        .map_err(|err| anyhow!("failed to write graph to {out:?}: {err}"))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_graph_for_two_or_more_pages() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("graph.png");
        let points = vec![
            ("0001_bin0.2.hocr".to_owned(), 91.5),
            ("0002_bin0.1.hocr".to_owned(), 88.0),
            ("0003_bin0.5.hocr".to_owned(), 35.0),
        ];
        assert!(render(&points, "mybook", &out).unwrap());
        let bytes = std::fs::read(&out).unwrap();
        assert!(bytes.starts_with(&[0x89, b'P', b'N', b'G']));
    }

    #[test]
    fn skips_graph_for_single_page() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("graph.png");
        let points = vec![("0001_bin0.2.hocr".to_owned(), 91.5)];
        assert!(!render(&points, "mybook", &out).unwrap());
        assert!(!out.exists());
    }

    #[test]
    fn falls_back_to_input_order_without_page_numbers() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("graph.png");
        let points = vec![
            ("cover_bin0.2.hocr".to_owned(), 80.0),
            ("title_bin0.2.hocr".to_owned(), 85.0),
        ];
        assert!(render(&points, "mybook", &out).unwrap());
        assert!(out.exists());
    }
}
