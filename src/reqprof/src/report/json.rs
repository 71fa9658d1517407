use std::io::Write;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;

use super::{Renderer, Report};
use crate::{
    profiler::AnalysisMode,
    stacks::{split_frames, FoldedStacks, FRAME_SEPARATOR},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JsonMetadata {
    pub generated_at: String,
    pub total_samples: u64,
    pub stack_count: usize,
    pub analysis_mode: AnalysisMode,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonStack {
    /// Outermost first.
    pub frames: Vec<String>,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonReport {
    pub metadata: JsonMetadata,
    /// By count, hottest first.
    pub stacks: Vec<JsonStack>,
}

impl JsonReport {
    pub fn from_report(report: &Report<'_>) -> anyhow::Result<Self> {
        Ok(Self {
            metadata: JsonMetadata {
                generated_at: report.meta.generated_at.format(&Rfc3339)?,
                total_samples: report.total_samples(),
                stack_count: report.stack_count(),
                analysis_mode: report.meta.mode,
                correlation_id: report.meta.correlation_id.to_string(),
                label: report.meta.label.map(String::from),
            },
            stacks: report
                .stacks
                .sorted_by_count()
                .into_iter()
                .map(|(key, count)| JsonStack {
                    frames: split_frames(key).map(String::from).collect(),
                    count,
                })
                .collect(),
        })
    }

    pub fn to_folded_stacks(&self) -> FoldedStacks {
        let separator = FRAME_SEPARATOR.to_string();
        self.stacks
            .iter()
            .map(|stack| (stack.frames.join(&separator), stack.count))
            .collect()
    }
}

pub struct JsonRenderer;

impl Renderer for JsonRenderer {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn render(&self, w: &mut dyn Write, report: &Report<'_>) -> anyhow::Result<()> {
        serde_json::to_writer_pretty(w, &JsonReport::from_report(report)?)?;
        Ok(())
    }
}

/// Parse an exported report back into the table it was rendered from.
pub fn read_stacks(json: &[u8]) -> anyhow::Result<FoldedStacks> {
    let report: JsonReport = serde_json::from_slice(json)?;
    Ok(report.to_folded_stacks())
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::report::ReportMeta;

    #[test]
    fn exports_metadata_and_stacks() {
        let stacks: FoldedStacks = [
            ("LOCK|http-2;app::update;parking_lot::lock".to_string(), 9),
            ("LOCK|http-1;app::index".to_string(), 12),
        ]
        .into_iter()
        .collect();
        let report = Report::new(
            ReportMeta {
                correlation_id: "req-7",
                label: Some("PUT /items"),
                mode: AnalysisMode::Lock,
                generated_at: datetime!(2024-01-02 03:04:05 UTC),
            },
            &stacks,
        );

        let mut out = Vec::new();
        JsonRenderer.render(&mut out, &report).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        let metadata = &value["metadata"];
        assert_eq!(metadata["generatedAt"], "2024-01-02T03:04:05Z");
        assert_eq!(metadata["totalSamples"], 21);
        assert_eq!(metadata["stackCount"], 2);
        assert_eq!(metadata["analysisMode"], "LOCK");
        assert_eq!(metadata["correlationId"], "req-7");
        assert_eq!(metadata["label"], "PUT /items");

        let first = &value["stacks"][0];
        assert_eq!(first["count"], 12);
        assert_eq!(first["frames"], serde_json::json!(["LOCK|http-1", "app::index"]));

        assert_eq!(read_stacks(&out).unwrap(), stacks);
    }

    #[test]
    fn rejects_documents_without_stacks() {
        assert!(read_stacks(br#"{"metadata": {}}"#).is_err());
    }
}
