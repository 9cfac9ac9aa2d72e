//! Prompt templates for the vision and text capabilities.
//!
//! Centralising every prompt here keeps behaviour changes to one place and
//! lets unit tests inspect templates without a live model. Analysis templates
//! carry a `{content}` placeholder filled by [`render`]; the
//! [`crate::job::AnalysisMode::Custom`] variant supplies its own template
//! through the same mechanism.

use crate::job::AnalysisMode;

/// Instructions sent with every page image in stage 2.
pub const OCR_INSTRUCTIONS: &str = "\
Transcribe this academic paper page completely:
1. Capture all text, preserving the original paragraph structure
2. Convert mathematical formulas to LaTeX (wrapped in $$)
3. Convert tables to Markdown tables
4. For figures and charts, describe their content and key information
5. Mark section heading levels with #, ##, ### as appropriate

Output format: Markdown";

/// Stage 4 template for a full analysis.
pub const COMPREHENSIVE_TEMPLATE: &str = "\
As a researcher in this field, analyze this paper in depth.

## Required output:

### 1. Overview
- What is the research question?
- Which subfield does it belong to?

### 2. Methodology
- What is the core algorithm or model?
- What is novel about it?
- How does it relate to established methods?

### 3. Experiments
- Which benchmarks were used?
- Which baselines were compared?
- What are the key results?

### 4. Takeaways
- Which ideas are worth borrowing?
- Are there reusable technical components?

### 5. Limitations and future directions

Paper content:
{content}";

/// Stage 4 template for a quick summary.
pub const QUICK_TEMPLATE: &str = "\
Summarize this paper briefly:
1. One-sentence summary (under 200 words)
2. Core contributions (3 points)
3. Key results

Paper content:
{content}";

/// Stage 4 template focused on methodology.
pub const METHODOLOGY_TEMPLATE: &str = "\
Analyze only the methodology of this paper:
1. Problem formulation (objective function, constraints)
2. Detailed steps of the solution algorithm
3. Complexity analysis
4. Parameter settings

Paper content:
{content}";

/// Intermediate prompt used on each chunk during hierarchical reduction.
pub const CHUNK_SUMMARY_TEMPLATE: &str =
    "Summarize the core content of the following section (under 200 words):\n{content}";

/// Resolve the analysis template for a mode.
///
/// `Custom` returns the caller-supplied template verbatim; it is expected to
/// contain a `{content}` placeholder like the built-ins.
pub fn analysis_template(mode: &AnalysisMode) -> &str {
    match mode {
        AnalysisMode::Comprehensive => COMPREHENSIVE_TEMPLATE,
        AnalysisMode::Quick => QUICK_TEMPLATE,
        AnalysisMode::MethodologyFocus => METHODOLOGY_TEMPLATE,
        AnalysisMode::Custom(template) => template,
    }
}

/// Fill the `{content}` placeholder of a template.
///
/// A template without the placeholder gets the content appended instead, so
/// a sloppy custom template still sees the document.
pub fn render(template: &str, content: &str) -> String {
    if template.contains("{content}") {
        template.replace("{content}", content)
    } else {
        format!("{template}\n\n{content}")
    }
}
