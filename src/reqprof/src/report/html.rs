//! Self-contained interactive flame graph page.
//!
//! Frames are absolutely positioned `div`s carrying their layout in `data-*`
//! attributes; the embedded script re-lays them out for zoom, drill-down,
//! search and the per-mode filter. No external assets.

use std::{collections::BTreeSet, io::Write};

use time::macros::format_description;

use super::{escape_xml, palette::FrameCategory, Renderer, Report};
use crate::{
    hierarchy::{FrameRect, LayoutOptions},
    profiler::{parse_mode_tag, AnalysisMode},
};

const ROW_HEIGHT: u32 = 18;
// percent of the graph width
const MIN_FRAME_WIDTH: f64 = 0.02;

const STYLE: &str = r#"
body { margin: 0; font: 13px -apple-system, "Segoe UI", Helvetica, Arial, sans-serif; color: #222; background: #fff; }
header { padding: 12px 18px; border-bottom: 1px solid #ddd; background: #f7f7f7; }
h1 { margin: 0 0 6px; font-size: 18px; font-weight: 600; }
h1 .label { color: #666; font-weight: 400; }
.stats span { margin-right: 18px; }
.controls { margin: 10px 0 6px; display: flex; gap: 6px; align-items: center; flex-wrap: wrap; }
.controls input { width: 220px; }
#match-info { color: #666; margin-left: 6px; }
.legend span { display: inline-flex; align-items: center; margin-right: 14px; }
.legend i { display: inline-block; width: 12px; height: 12px; margin-right: 5px; border: 1px solid #888; }
main { display: flex; }
#viewport { flex: 1; overflow-x: auto; overflow-y: hidden; padding: 10px 18px; }
#graph { position: relative; width: 100%; }
.frame { position: absolute; height: 17px; box-sizing: border-box; padding: 0 3px; border: 1px solid rgba(255,255,255,0.8);
  border-radius: 2px; overflow: hidden; white-space: nowrap; text-overflow: ellipsis; font: 11px Menlo, Consolas, monospace;
  line-height: 15px; cursor: pointer; }
.frame:hover { border-color: #333; }
.frame.match { background: #ff00ff !important; color: #fff; }
.frame.ancestor { opacity: 0.6; }
.frame.focused { border-color: #000; }
#tooltip { position: fixed; pointer-events: none; background: rgba(30,30,30,0.92); color: #fff; padding: 5px 8px;
  border-radius: 4px; font: 12px Menlo, Consolas, monospace; max-width: 600px; word-break: break-all; z-index: 10; }
#details { width: 280px; padding: 10px 18px; border-left: 1px solid #ddd; background: #fbfbfb; }
#details h2 { font-size: 14px; margin: 0 0 8px; }
#details dt { color: #666; margin-top: 6px; }
#details dd { margin: 0; font-family: Menlo, Consolas, monospace; word-break: break-all; }
"#;

const SCRIPT: &str = r#"
(function () {
  var graph = document.getElementById('graph');
  var total = parseFloat(graph.dataset.total) || 1;
  var frames = Array.prototype.slice.call(graph.querySelectorAll('.frame'));
  var tooltip = document.getElementById('tooltip');
  var details = document.getElementById('details-body');
  var search = document.getElementById('search');
  var filter = document.getElementById('event-filter');
  var matchInfo = document.getElementById('match-info');
  var zoom = 1;
  var focus = null;
  var EPS = 1e-9;

  function num(el, key) { return parseFloat(el.dataset[key]); }
  function pct(count) { return (count * 100 / total).toFixed(2) + '%'; }

  function layout() {
    var fx = focus ? num(focus, 'x') : 0;
    var fw = focus ? num(focus, 'w') : 100;
    var fd = focus ? num(focus, 'depth') : 0;
    var mode = filter.value;
    frames.forEach(function (el) {
      var x = num(el, 'x'), w = num(el, 'w'), d = num(el, 'depth');
      var visible = !mode || el.dataset.mode === mode;
      el.classList.remove('ancestor');
      if (focus && el.dataset.root !== focus.dataset.root) {
        visible = false;
      } else if (focus && d < fd) {
        visible = visible && x <= fx + EPS && x + w >= fx + fw - EPS;
        el.classList.add('ancestor');
        el.style.left = '0%';
        el.style.width = '100%';
      } else if (focus) {
        visible = visible && x >= fx - EPS && x + w <= fx + fw + EPS;
        el.style.left = ((x - fx) / fw * 100) + '%';
        el.style.width = (w / fw * 100) + '%';
      } else {
        el.style.left = x + '%';
        el.style.width = w + '%';
      }
      el.classList.toggle('focused', el === focus);
      el.style.display = visible ? '' : 'none';
    });
    graph.style.width = (zoom * 100) + '%';
  }

  function showDetails(el) {
    var count = num(el, 'count');
    details.innerHTML = '';
    var dl = document.createElement('dl');
    [['Frame', el.textContent],
     ['Samples', count + ' (' + pct(count) + ')'],
     ['Depth', el.dataset.depth],
     ['Thread', el.dataset.thread],
     ['Mode', el.dataset.mode],
     ['Callees', el.dataset.children]].forEach(function (row) {
      var dt = document.createElement('dt');
      dt.textContent = row[0];
      var dd = document.createElement('dd');
      dd.textContent = row[1];
      dl.appendChild(dt);
      dl.appendChild(dd);
    });
    details.appendChild(dl);
  }

  graph.addEventListener('click', function (ev) {
    var el = ev.target.closest('.frame');
    if (!el) { return; }
    focus = (el === focus) ? null : el;
    layout();
    showDetails(el);
  });

  graph.addEventListener('mousemove', function (ev) {
    var el = ev.target.closest('.frame');
    if (!el) { tooltip.hidden = true; return; }
    tooltip.textContent = el.textContent + ': ' + el.dataset.count + ' samples (' + pct(num(el, 'count')) + ')';
    tooltip.style.left = (ev.clientX + 12) + 'px';
    tooltip.style.top = (ev.clientY + 12) + 'px';
    tooltip.hidden = false;
  });
  graph.addEventListener('mouseleave', function () { tooltip.hidden = true; });

  search.addEventListener('input', function () {
    var q = search.value.trim().toLowerCase();
    var hits = 0, samples = 0;
    frames.forEach(function (el) {
      var hit = q !== '' && el.textContent.toLowerCase().indexOf(q) >= 0;
      el.classList.toggle('match', hit);
      if (hit) { hits += 1; samples += num(el, 'count'); }
    });
    matchInfo.textContent = q ? hits + ' frames, ' + samples + ' samples' : '';
  });

  filter.addEventListener('change', layout);

  document.getElementById('zoom-in').addEventListener('click', function () {
    zoom = Math.min(zoom * 1.5, 50);
    layout();
  });
  document.getElementById('zoom-out').addEventListener('click', function () {
    zoom = Math.max(zoom / 1.5, 1);
    layout();
  });
  document.getElementById('reset').addEventListener('click', function () {
    zoom = 1;
    focus = null;
    search.value = '';
    filter.value = '';
    search.dispatchEvent(new Event('input'));
    layout();
  });

  layout();
})();
"#;

pub struct HtmlRenderer;

impl HtmlRenderer {
    fn root_mode(label: &str, default: AnalysisMode) -> AnalysisMode {
        parse_mode_tag(label).map_or(default, |(mode, _)| mode)
    }

    fn write_header(&self, w: &mut dyn Write, report: &Report<'_>) -> anyhow::Result<()> {
        let meta = &report.meta;
        let generated = meta.generated_at.format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second] UTC"
        ))?;

        write!(w, "<header><h1>Flame graph: {}", escape_xml(meta.correlation_id))?;
        if let Some(label) = meta.label {
            write!(w, r#" <span class="label">{}</span>"#, escape_xml(label))?;
        }
        writeln!(w, "</h1>")?;

        writeln!(
            w,
            r#"<div class="stats"><span>Total samples: <b>{}</b></span><span>Distinct stacks: <b>{}</b></span><span>Generated: <b>{}</b></span><span>Analysis mode: <b>{}</b> (heuristic)</span><span>Correlation id: <b>{}</b></span></div>"#,
            report.total_samples(),
            report.stack_count(),
            generated,
            meta.mode,
            escape_xml(meta.correlation_id),
        )?;

        let modes = report
            .hierarchy
            .roots()
            .iter()
            .map(|root| Self::root_mode(&root.label, meta.mode))
            .collect::<BTreeSet<_>>();
        write!(
            w,
            r#"<div class="controls"><button id="zoom-in">Zoom in</button><button id="zoom-out">Zoom out</button><button id="reset">Reset</button><input id="search" type="search" placeholder="Search frames"><select id="event-filter"><option value="">All events</option>"#
        )?;
        for mode in modes {
            write!(w, r#"<option value="{mode}">{mode}</option>"#)?;
        }
        writeln!(w, r#"</select><span id="match-info"></span></div>"#)?;

        write!(w, r#"<div class="legend">"#)?;
        for category in FrameCategory::legend() {
            write!(
                w,
                r#"<span><i style="background:{}"></i>{}</span>"#,
                category.color(),
                escape_xml(category.name())
            )?;
        }
        writeln!(w, "</div></header>")?;
        Ok(())
    }

    fn write_frame(
        &self,
        w: &mut dyn Write,
        rect: &FrameRect<'_>,
        thread: &str,
        mode: AnalysisMode,
    ) -> anyhow::Result<()> {
        let node = rect.node;
        let color = FrameCategory::of(&node.label, node.is_root).color();
        writeln!(
            w,
            r#"<div class="frame" data-x="{x:.4}" data-w="{width:.4}" data-depth="{depth}" data-root="{root}" data-thread="{thread}" data-mode="{mode}" data-count="{count}" data-children="{children}" style="left:{x:.4}%;width:{width:.4}%;bottom:{bottom}px;background:{color}">{label}</div>"#,
            x = rect.x,
            width = rect.width,
            depth = rect.depth,
            root = rect.root,
            thread = escape_xml(thread),
            count = node.count,
            children = node.children.len(),
            bottom = rect.depth as u32 * ROW_HEIGHT,
            label = escape_xml(&node.label),
        )?;
        Ok(())
    }
}

impl Renderer for HtmlRenderer {
    fn extension(&self) -> &'static str {
        "html"
    }

    fn render(&self, w: &mut dyn Write, report: &Report<'_>) -> anyhow::Result<()> {
        let rects = report.hierarchy.layout(&LayoutOptions {
            width: 100.0,
            min_width: MIN_FRAME_WIDTH,
            ..Default::default()
        });
        let rows = rects.iter().map(|r| r.depth + 1).max().unwrap_or(1) as u32;

        writeln!(w, "<!DOCTYPE html>")?;
        writeln!(w, r#"<html lang="en"><head><meta charset="utf-8">"#)?;
        writeln!(
            w,
            "<title>Flame graph: {}</title>",
            escape_xml(report.meta.correlation_id)
        )?;
        writeln!(w, "<style>{STYLE}</style></head><body>")?;

        self.write_header(w, report)?;

        writeln!(w, r#"<main><div id="viewport">"#)?;
        writeln!(
            w,
            r#"<div id="graph" data-total="{}" style="height:{}px">"#,
            report.total_samples(),
            rows * ROW_HEIGHT
        )?;
        let roots = report.hierarchy.roots();
        for rect in &rects {
            let root = &roots[rect.root];
            let mode = Self::root_mode(&root.label, report.meta.mode);
            let thread = parse_mode_tag(&root.label).map_or(root.label.as_str(), |(_, name)| name);
            self.write_frame(w, rect, thread, mode)?;
        }
        writeln!(w, "</div></div>")?;
        writeln!(
            w,
            r#"<aside id="details"><h2>Details</h2><div id="details-body">Click a frame to zoom into it.</div></aside></main>"#
        )?;
        writeln!(w, r#"<div id="tooltip" hidden></div>"#)?;
        writeln!(w, "<script>{SCRIPT}</script>")?;
        writeln!(w, "</body></html>")?;
        Ok(())
    }
}
