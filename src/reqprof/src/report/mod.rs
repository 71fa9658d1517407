//! Turning a finished session's folded stacks into files on disk.
//!
//! Every report is written next to a raw `stack count` dump of the complete,
//! unfiltered table, so the data survives even if rendering fails.

use std::{
    borrow::Cow,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use thiserror::Error;
use time::{macros::format_description, OffsetDateTime};
use tracing::{debug, error, warn};

use crate::{
    config::OutputFormat,
    hierarchy::{BuildOptions, FrameHierarchy, MAX_TREE_DEPTH},
    profiler::AnalysisMode,
    stacks::FoldedStacks,
};

pub mod html;
pub mod json;
pub mod palette;
pub mod svg;

pub use html::HtmlRenderer;
pub use json::JsonRenderer;
pub use svg::SvgRenderer;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("no stacks with at least {min_samples} samples")]
    Empty { min_samples: u64 },
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("format timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
    #[error("render: {0:#}")]
    Render(#[source] anyhow::Error),
}

/// Identifies the run a report belongs to.
#[derive(Debug, Clone)]
pub struct ReportMeta<'a> {
    pub correlation_id: &'a str,
    pub label: Option<&'a str>,
    pub mode: AnalysisMode,
    pub generated_at: OffsetDateTime,
}

/// What a renderer draws: the filtered table and the tree built from it.
pub struct Report<'a> {
    pub meta: ReportMeta<'a>,
    pub stacks: &'a FoldedStacks,
    pub hierarchy: FrameHierarchy,
}

impl<'a> Report<'a> {
    pub fn new(meta: ReportMeta<'a>, stacks: &'a FoldedStacks) -> Self {
        Self::with_options(meta, stacks, &BuildOptions::default())
    }

    pub fn with_options(
        meta: ReportMeta<'a>,
        stacks: &'a FoldedStacks,
        options: &BuildOptions,
    ) -> Self {
        Self {
            meta,
            stacks,
            hierarchy: FrameHierarchy::build_with(stacks, options),
        }
    }

    pub fn total_samples(&self) -> u64 {
        self.stacks.total_samples()
    }

    pub fn stack_count(&self) -> usize {
        self.stacks.len()
    }
}

pub trait Renderer: Send + Sync {
    fn extension(&self) -> &'static str;

    /// Deepest row this renderer draws. The tree is never built past it.
    fn max_depth(&self) -> usize {
        MAX_TREE_DEPTH
    }

    fn render(&self, w: &mut dyn Write, report: &Report<'_>) -> anyhow::Result<()>;
}

pub fn renderer_for(format: OutputFormat) -> Box<dyn Renderer> {
    match format {
        OutputFormat::Html => Box::new(HtmlRenderer),
        OutputFormat::Svg => Box::new(SvgRenderer),
        OutputFormat::Json => Box::new(JsonRenderer),
    }
}

/// A finished session handed to the writer.
pub struct ReportRequest<'a> {
    pub correlation_id: &'a str,
    pub label: Option<&'a str>,
    pub mode: AnalysisMode,
    /// Full, unfiltered table.
    pub stacks: FoldedStacks,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportArtifacts {
    pub raw: Option<PathBuf>,
    pub report: Option<PathBuf>,
}

impl ReportArtifacts {
    /// The rendered report if there is one, else the raw dump.
    pub fn primary(&self) -> Option<&Path> {
        self.report.as_deref().or(self.raw.as_deref())
    }
}

pub struct ReportWriter {
    dir: PathBuf,
    renderer: Box<dyn Renderer>,
    min_samples: u64,
}

impl ReportWriter {
    pub fn new(dir: impl Into<PathBuf>, format: OutputFormat, min_samples: u64) -> Self {
        Self::with_renderer(dir, renderer_for(format), min_samples)
    }

    pub fn with_renderer(
        dir: impl Into<PathBuf>,
        renderer: Box<dyn Renderer>,
        min_samples: u64,
    ) -> Self {
        Self {
            dir: dir.into(),
            renderer,
            min_samples,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the report for `request`, logging instead of failing.
    pub fn write(&self, request: ReportRequest<'_>) -> Option<PathBuf> {
        match self.write_artifacts(&request) {
            Ok(artifacts) => artifacts.primary().map(Path::to_path_buf),
            Err(e @ ReportError::Empty { .. }) => {
                debug!(correlation_id = request.correlation_id, "skipping report: {e}");
                None
            }
            Err(e) => {
                error!(correlation_id = request.correlation_id, "failed to write report: {e}");
                None
            }
        }
    }

    pub fn write_artifacts(&self, request: &ReportRequest<'_>) -> Result<ReportArtifacts, ReportError> {
        let filtered = request.stacks.filter_min_count(self.min_samples);
        if filtered.is_empty() {
            return Err(ReportError::Empty {
                min_samples: self.min_samples,
            });
        }

        fs::create_dir_all(&self.dir)?;

        let generated_at = OffsetDateTime::now_utc();
        let stem = artifact_stem(request.correlation_id, request.label, generated_at)?;

        let raw_path = unique_path(&self.dir, &stem, "txt");
        let raw = match fs::write(&raw_path, request.stacks.to_folded_text()) {
            Ok(()) => Some(raw_path),
            Err(e) => {
                warn!(path = %raw_path.display(), "failed to write raw stacks: {e}");
                None
            }
        };

        let renderer = self.renderer.as_ref();
        let report = Report::with_options(
            ReportMeta {
                correlation_id: request.correlation_id,
                label: request.label,
                mode: request.mode,
                generated_at,
            },
            &filtered,
            &BuildOptions {
                max_depth: renderer.max_depth(),
                ..Default::default()
            },
        );
        let report_path = unique_path(&self.dir, &stem, renderer.extension());

        match render_to_path(renderer, &report, &report_path) {
            Ok(()) => Ok(ReportArtifacts {
                raw,
                report: Some(report_path),
            }),
            Err(e) if raw.is_some() => {
                error!(
                    path = %report_path.display(),
                    "failed to render {} report, keeping raw stacks: {e}",
                    renderer.extension()
                );
                Ok(ReportArtifacts { raw, report: None })
            }
            Err(e) => Err(e),
        }
    }
}

/// Render into `path`. A partially written file is removed on failure.
pub fn render_to_path(
    renderer: &dyn Renderer,
    report: &Report<'_>,
    path: &Path,
) -> Result<(), ReportError> {
    let file = File::create(path)?;
    let cleanup = scopeguard::guard(path, |path| {
        let _ = fs::remove_file(path);
    });

    let mut buf_writer = BufWriter::new(file);
    renderer
        .render(&mut buf_writer, report)
        .map_err(ReportError::Render)?;
    buf_writer.flush()?;

    scopeguard::ScopeGuard::into_inner(cleanup);
    Ok(())
}

/// Replace everything outside `[A-Za-z0-9_.-]` with `_`.
pub fn sanitize_file_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '.' | '-' => c,
            _ => '_',
        })
        .collect()
}

/// `flamegraph_<id>[_<label>]_<yyyyMMdd_HHmmss_SSS>`, UTC.
pub fn artifact_stem(
    correlation_id: &str,
    label: Option<&str>,
    at: OffsetDateTime,
) -> Result<String, time::error::Format> {
    let timestamp = at.format(format_description!(
        "[year][month][day]_[hour][minute][second]_[subsecond digits:3]"
    ))?;

    let mut stem = format!("flamegraph_{}", sanitize_file_component(correlation_id));
    if let Some(label) = label.filter(|l| !l.is_empty()) {
        stem.push('_');
        stem.push_str(&sanitize_file_component(label));
    }
    stem.push('_');
    stem.push_str(&timestamp);
    Ok(stem)
}

fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let path = dir.join(format!("{stem}.{extension}"));
    if !path.exists() {
        return path;
    }

    (1..)
        .map(|n| dir.join(format!("{stem}_{n}.{extension}")))
        .find(|path| !path.exists())
        .unwrap_or(path)
}

pub fn escape_xml(s: &str) -> Cow<'_, str> {
    if !s.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn table(entries: &[(&str, u64)]) -> FoldedStacks {
        entries.iter().map(|&(k, v)| (k.to_string(), v)).collect()
    }

    fn request(stacks: FoldedStacks) -> ReportRequest<'static> {
        ReportRequest {
            correlation_id: "req/42",
            label: Some("GET /users"),
            mode: AnalysisMode::Cpu,
            stacks,
        }
    }

    struct BrokenRenderer;

    impl Renderer for BrokenRenderer {
        fn extension(&self) -> &'static str {
            "html"
        }

        fn render(&self, w: &mut dyn Write, _report: &Report<'_>) -> anyhow::Result<()> {
            w.write_all(b"<html>")?;
            anyhow::bail!("out of ink")
        }
    }

    #[test]
    fn names_artifacts() {
        let at = datetime!(2024-03-05 07:08:09.123 UTC);
        assert_eq!(
            artifact_stem("req/42", Some("GET /users"), at).unwrap(),
            "flamegraph_req_42_GET__users_20240305_070809_123"
        );
        assert_eq!(
            artifact_stem("abc-1.2", None, at).unwrap(),
            "flamegraph_abc-1.2_20240305_070809_123"
        );
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_xml("plain"), "plain");
        assert_eq!(
            escape_xml("<Vec<T> as Clone>::clone & \"q\""),
            "&lt;Vec&lt;T&gt; as Clone&gt;::clone &amp; &quot;q&quot;"
        );
    }

    #[test]
    fn writes_raw_dump_and_report() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path().join("out"), OutputFormat::Html, 10);

        let artifacts = writer
            .write_artifacts(&request(table(&[("main;a", 12), ("main;b", 3)])))
            .unwrap();

        let report = artifacts.report.clone().unwrap();
        assert_eq!(report.extension().unwrap(), "html");
        assert!(report
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("flamegraph_req_42_GET__users_"));

        // raw dump keeps what the threshold dropped
        let raw = fs::read_to_string(artifacts.raw.unwrap()).unwrap();
        assert_eq!(raw, "main;a 12\nmain;b 3\n");

        let html = fs::read_to_string(report).unwrap();
        assert!(html.contains(">a</div>"));
        assert!(!html.contains(">b</div>"));
    }

    #[test]
    fn nothing_over_threshold_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let writer = ReportWriter::new(&out, OutputFormat::Svg, 10);

        assert_eq!(writer.write(request(table(&[("X", 9)]))), None);
        assert!(!out.exists());
    }

    #[test]
    fn threshold_keeps_exact_matches() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path(), OutputFormat::Json, 10);

        let path = writer.write(request(table(&[("X", 9), ("Y", 10)]))).unwrap();
        let stacks = json::read_stacks(&fs::read(path).unwrap()).unwrap();
        assert_eq!(stacks, table(&[("Y", 10)]));
    }

    #[test]
    fn same_second_reports_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let stem = "flamegraph_x_20240101_000000_000";
        fs::write(dir.path().join(format!("{stem}.svg")), "").unwrap();
        fs::write(dir.path().join(format!("{stem}_1.svg")), "").unwrap();

        assert_eq!(
            unique_path(dir.path(), stem, "svg"),
            dir.path().join(format!("{stem}_2.svg"))
        );
    }

    #[test]
    fn failed_render_falls_back_to_raw_dump() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::with_renderer(dir.path(), Box::new(BrokenRenderer), 1);

        let path = writer.write(request(table(&[("main;a", 5)]))).unwrap();
        assert_eq!(path.extension().unwrap(), "txt");
        assert_eq!(fs::read_to_string(&path).unwrap(), "main;a 5\n");

        let files = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect::<Vec<_>>();
        assert_eq!(files, [path]);
    }

    #[test]
    fn failed_render_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let stacks = table(&[("main;a", 1)]);
        let report = Report::new(
            ReportMeta {
                correlation_id: "r",
                label: None,
                mode: AnalysisMode::Cpu,
                generated_at: OffsetDateTime::now_utc(),
            },
            &stacks,
        );
        let path = dir.path().join("r.html");

        let err = render_to_path(&BrokenRenderer, &report, &path).unwrap_err();
        assert!(matches!(err, ReportError::Render(_)));
        assert!(!path.exists());
    }
}
