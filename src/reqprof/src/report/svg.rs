use std::io::Write;

use super::{escape_xml, palette::FrameCategory, Renderer, Report};
use crate::hierarchy::LayoutOptions;

const IMAGE_WIDTH: f64 = 1200.0;
const MARGIN: f64 = 20.0;
const GRAPH_WIDTH: f64 = IMAGE_WIDTH - 2.0 * MARGIN;
const GRAPH_TOP: f64 = 96.0;
const ROW_HEIGHT: f64 = 16.0;
const MIN_FRAME_WIDTH: f64 = 2.0;
const MAX_ROOTS: usize = 10;
const MAX_ROWS: usize = 30;
const MIN_LABELLED_WIDTH: f64 = 30.0;
const MAX_LABEL_CHARS: usize = 50;
// rough width of one 11px monospace glyph
const CHAR_WIDTH: f64 = 6.6;
const COLOR_JITTER: u8 = 18;

fn fit_label(label: &str, width: f64) -> Option<String> {
    if width <= MIN_LABELLED_WIDTH {
        return None;
    }
    let fits = (((width - 6.0) / CHAR_WIDTH) as usize).min(MAX_LABEL_CHARS);
    if fits < 3 {
        return None;
    }

    if label.chars().count() <= fits {
        Some(label.to_string())
    } else {
        let mut short = label.chars().take(fits - 2).collect::<String>();
        short.push_str("..");
        Some(short)
    }
}

/// Static flame graph image. Only the hottest roots and the lowest rows are
/// drawn.
pub struct SvgRenderer;

impl Renderer for SvgRenderer {
    fn extension(&self) -> &'static str {
        "svg"
    }

    fn max_depth(&self) -> usize {
        MAX_ROWS
    }

    fn render(&self, w: &mut dyn Write, report: &Report<'_>) -> anyhow::Result<()> {
        let rects = report.hierarchy.layout(&LayoutOptions {
            width: GRAPH_WIDTH,
            min_width: MIN_FRAME_WIDTH,
            max_depth: MAX_ROWS,
            max_roots: MAX_ROOTS,
        });
        let rows = rects.iter().map(|r| r.depth + 1).max().unwrap_or(1);
        let graph_height = rows as f64 * ROW_HEIGHT;
        let height = GRAPH_TOP + graph_height + MARGIN;
        let total = report.total_samples().max(1);

        writeln!(w, r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>"#)?;
        writeln!(
            w,
            r#"<svg xmlns="http://www.w3.org/2000/svg" version="1.1" width="{IMAGE_WIDTH}" height="{height}" viewBox="0 0 {IMAGE_WIDTH} {height}" font-family="Menlo, Consolas, monospace" font-size="11">"#
        )?;
        writeln!(
            w,
            r##"<rect x="0.5" y="0.5" width="{}" height="{}" fill="#fafafa" stroke="#999"/>"##,
            IMAGE_WIDTH - 1.0,
            height - 1.0
        )?;

        let mut title = format!("Flame graph: {}", report.meta.correlation_id);
        if let Some(label) = report.meta.label {
            title.push_str(" (");
            title.push_str(label);
            title.push(')');
        }
        writeln!(
            w,
            r#"<text x="{}" y="28" font-size="17" text-anchor="middle">{}</text>"#,
            IMAGE_WIDTH / 2.0,
            escape_xml(&title)
        )?;
        writeln!(
            w,
            r##"<text x="{MARGIN}" y="50" fill="#555">{} samples, {} stacks, {} mode (heuristic), generated {}</text>"##,
            report.total_samples(),
            report.stack_count(),
            report.meta.mode,
            report.meta.generated_at.date(),
        )?;

        let mut legend_x = MARGIN;
        for category in FrameCategory::legend() {
            writeln!(
                w,
                r##"<rect x="{legend_x}" y="64" width="12" height="12" fill="{}" stroke="#666"/><text x="{}" y="74">{}</text>"##,
                category.color(),
                legend_x + 16.0,
                escape_xml(category.name())
            )?;
            legend_x += 16.0 + category.name().len() as f64 * CHAR_WIDTH + 18.0;
        }

        writeln!(w, r#"<g transform="translate({MARGIN},{GRAPH_TOP})">"#)?;
        for rect in &rects {
            let node = rect.node;
            let y = graph_height - (rect.depth + 1) as f64 * ROW_HEIGHT;
            let color = FrameCategory::of(&node.label, node.is_root)
                .color()
                .jitter(&node.label, COLOR_JITTER);
            let label = escape_xml(&node.label);
            let percent = node.count as f64 * 100.0 / total as f64;

            writeln!(w, "<g>")?;
            writeln!(
                w,
                "<title>{label} ({} samples, {percent:.2}%)</title>",
                node.count
            )?;
            writeln!(
                w,
                r##"<rect x="{:.2}" y="{y}" width="{:.2}" height="{}" fill="{color}" stroke="#fff" stroke-width="0.5" rx="2"/>"##,
                rect.x,
                rect.width,
                ROW_HEIGHT - 1.0
            )?;
            if let Some(text) = fit_label(&node.label, rect.width) {
                writeln!(
                    w,
                    r#"<text x="{:.2}" y="{}">{}</text>"#,
                    rect.x + 3.0,
                    y + ROW_HEIGHT - 4.5,
                    escape_xml(&text)
                )?;
            }
            writeln!(w, "</g>")?;
        }
        writeln!(w, "</g>")?;
        writeln!(w, "</svg>")?;
        Ok(())
    }
}
