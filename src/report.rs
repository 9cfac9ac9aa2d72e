//! Render a finished analysis into its two durable artifacts:
//! the human-readable markdown report and the structured analysis JSON.
//!
//! Pure functions over the pipeline's result types — no I/O here; the
//! [`crate::history::HistoryStore`] owns where the artifacts land.

use chrono::Utc;
use serde_json::json;

use crate::capability::DocumentMetadata;
use crate::job::AnalysisMode;
use crate::structure::DocumentStructure;

/// Everything known about one analyzed document.
#[derive(Debug, Clone)]
pub struct DocumentAnalysis {
    pub metadata: DocumentMetadata,
    pub structure: DocumentStructure,
    pub analysis_text: String,
    pub mode: AnalysisMode,
    pub ocr_capability: String,
    pub text_capability: String,
    pub processing_secs: f64,
}

/// Build the markdown summary report.
pub fn build_markdown_report(result: &DocumentAnalysis) -> String {
    let meta = &result.metadata;
    let structure = &result.structure;

    let mut lines: Vec<String> = vec![
        format!("# {} — Analysis Report", meta.title),
        String::new(),
        format!("> Generated {}", Utc::now().format("%Y-%m-%d %H:%M")),
        String::new(),
        "| Field | Value |".to_string(),
        "|-------|-------|".to_string(),
        format!(
            "| Author | {} |",
            if meta.author.is_empty() { "unknown" } else { &meta.author }
        ),
        format!("| Pages | {} |", meta.total_pages),
        format!("| Analysis mode | {} |", result.mode),
        format!("| Model | {} |", result.text_capability),
        format!("| Processing time | {:.1} s |", result.processing_secs),
        String::new(),
    ];

    if !structure.abstract_text.is_empty() {
        lines.push("## Abstract".to_string());
        lines.push(String::new());
        lines.push(structure.abstract_text.clone());
        lines.push(String::new());
    }

    if !structure.sections.is_empty() {
        lines.push("## Document Outline".to_string());
        lines.push(String::new());
        for section in &structure.sections {
            let indent = "  ".repeat(section.level.saturating_sub(1));
            lines.push(format!("{indent}- {}", section.title));
        }
        lines.push(String::new());
    }

    lines.push("## Analysis".to_string());
    lines.push(String::new());
    lines.push(result.analysis_text.clone());
    lines.push(String::new());
    lines.push("---".to_string());
    lines.push("*Generated by the paperlens analysis pipeline*".to_string());

    lines.join("\n")
}

/// Build the structured analysis payload.
pub fn build_analysis_data(result: &DocumentAnalysis) -> serde_json::Value {
    let meta = &result.metadata;
    let structure = &result.structure;

    json!({
        "metadata": {
            "title": meta.title,
            "author": meta.author,
            "total_pages": meta.total_pages,
        },
        "structure": {
            "title": structure.title,
            "abstract": structure.abstract_text,
            "sections": structure.sections,
            "figures_count": structure.figures.len(),
            "tables_count": structure.tables.len(),
        },
        "analysis": {
            "type": result.mode.as_str(),
            "ocr_model": result.ocr_capability,
            "model": result.text_capability,
            "text": result.analysis_text,
        },
        "processing": {
            "time_seconds": (result.processing_secs * 100.0).round() / 100.0,
            "generated_at": Utc::now().to_rfc3339(),
        },
    })
}
