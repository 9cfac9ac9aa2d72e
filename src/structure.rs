//! Regex-based structure index over assembled markdown.
//!
//! Pure CPU: stage 3 builds a [`DocumentStructure`] from the merged page
//! transcriptions without touching any model. The index drives three things
//! downstream — section-boundary chunking in stage 4, the context hint
//! prepended to the analysis prompt, and the section outline in the report.
//!
//! Heading detection is deliberately dumb (`^#{1,6} `): the vision models are
//! prompted to emit markdown headings, so trusting their output beats trying
//! to re-derive structure from prose.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// One detected section heading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Heading level, 1..=6.
    pub level: usize,
    pub title: String,
    /// Byte offset of the heading line in the source markdown.
    pub start: usize,
}

/// A numbered figure or table caption reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionRef {
    pub number: u32,
    pub caption: String,
}

/// Structure index for one assembled document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentStructure {
    pub title: String,
    pub abstract_text: String,
    pub sections: Vec<Section>,
    pub figures: Vec<CaptionRef>,
    pub tables: Vec<CaptionRef>,
}

static RE_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(#{1,6})[ \t]+(.+)$").unwrap());

static RE_FIGURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[Ff]igure|[Ff]ig\.)\s*(\d+)[.:]?\s*([^\n]*)").unwrap());

static RE_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[Tt]able\s*(\d+)[.:]?\s*([^\n]*)").unwrap());

static RE_ABSTRACT_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?mi)^(?:#{1,3}\s*abstract\s*|\*{0,2}abstract\*{0,2}\s*)$").unwrap());

/// Single-word labels journals stamp above the real title.
const JOURNAL_MARKERS: [&str; 6] = [
    "note",
    "letter",
    "communication",
    "article",
    "paper",
    "preprint",
];

/// Lines on a scanned first page that are never the title.
static RE_TITLE_NOISE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)^1-s2\.0-.*",
        r"(?i)^http.*",
        r"(?i)^doi:.*",
        r"(?i)^www\..*",
        r"(?i)^Downloaded from.*",
        r"(?i)^Journal of .*",
        r"(?i)^Research Article.*",
        r"(?i)^\d{4} Elsevier.*",
        r"(?i)^Available online.*",
        r"(?i)^table of contents",
        r"(?i)^references",
        r"(?i)^abstract$",
        r"^#\s*(Note|Letter|Communication|Article|Paper)$",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Parse every markdown heading into an ordered [`Section`] list.
pub fn parse_sections(markdown: &str) -> Vec<Section> {
    RE_HEADING
        .captures_iter(markdown)
        .map(|caps| Section {
            level: caps[1].len(),
            title: caps[2].trim().to_string(),
            start: caps.get(0).unwrap().start(),
        })
        .collect()
}

/// Extract the abstract: the text between an `Abstract` heading and the next
/// heading, falling back to a keyword scan over the first 3000 characters.
pub fn extract_abstract(markdown: &str) -> String {
    if let Some(m) = RE_ABSTRACT_HEADING.find(markdown) {
        let rest = &markdown[m.end()..];
        let rest = rest.strip_prefix('\n').unwrap_or(rest);
        let end = RE_HEADING.find(rest).map(|h| h.start()).unwrap_or(rest.len());
        return rest[..end].trim().to_string();
    }

    // Fallback: locate the keyword in the document head and take the text
    // until the next heading or a hard paragraph break.
    static RE_ABSTRACT_WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)abstract").unwrap());
    let head_len = floor_char_boundary(markdown, markdown.len().min(3000));
    let Some(idx) = RE_ABSTRACT_WORD.find(&markdown[..head_len]).map(|m| m.start()) else {
        return String::new();
    };
    let rest = &markdown[idx..];
    let Some(first_nl) = rest.find('\n') else {
        return String::new();
    };
    let rest = &rest[first_nl + 1..];
    let end = RE_HEADING
        .find(rest)
        .map(|h| h.start())
        .or_else(|| rest.find("\n\n\n"))
        .unwrap_or_else(|| floor_char_boundary(rest, rest.len().min(2000)));
    rest[..end].trim().to_string()
}

fn extract_captions(markdown: &str, re: &Regex) -> Vec<CaptionRef> {
    re.captures_iter(markdown)
        .filter_map(|caps| {
            Some(CaptionRef {
                number: caps[1].parse().ok()?,
                caption: caps[2].trim().to_string(),
            })
        })
        .collect()
}

/// Build the full structure index for an assembled document.
///
/// `first_page` (the first page's raw transcription, when available) feeds
/// the title fallback: scanned papers often carry the real title as plain
/// text on page one rather than as a markdown heading.
pub fn build_structure(markdown: &str, first_page: Option<&str>) -> DocumentStructure {
    let sections = parse_sections(markdown);
    let abstract_text = extract_abstract(markdown);
    let figures = extract_captions(markdown, &RE_FIGURE);
    let tables = extract_captions(markdown, &RE_TABLE);

    let mut title = sections
        .iter()
        .find(|s| {
            s.level == 1
                && s.title.len() > 10
                && !JOURNAL_MARKERS.contains(&s.title.to_lowercase().as_str())
        })
        .map(|s| s.title.clone())
        .unwrap_or_default();

    if title.is_empty() {
        if let Some(page) = first_page {
            title = scan_first_page_title(page).unwrap_or_default();
        }
    }

    tracing::debug!(
        title = %title,
        sections = sections.len(),
        figures = figures.len(),
        tables = tables.len(),
        "structure index built"
    );

    DocumentStructure {
        title,
        abstract_text,
        sections,
        figures,
        tables,
    }
}

/// Hunt for a plausible title in the first 20 lines of the first page,
/// skipping DOIs, URLs, publisher boilerplate, bare page numbers and
/// journal markers.
fn scan_first_page_title(first_page: &str) -> Option<String> {
    static RE_BARE_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());
    static RE_COPYRIGHT: Lazy<Regex> = Lazy::new(|| Regex::new(r"© \d{4}").unwrap());

    for line in first_page.lines().take(20) {
        let line = line.trim_matches(|c: char| "#* \u{b7}\t".contains(c)).trim();
        if line.len() < 5 {
            continue;
        }
        if RE_TITLE_NOISE.iter().any(|re| re.is_match(line)) {
            continue;
        }
        if RE_BARE_NUMBER.is_match(line) || RE_COPYRIGHT.is_match(line) {
            continue;
        }
        if JOURNAL_MARKERS.contains(&line.to_lowercase().as_str()) {
            continue;
        }
        return Some(line.to_string());
    }
    None
}

/// Titles that look like upload filenames rather than prose.
pub fn looks_like_filename(title: &str) -> bool {
    static RE_FILENAME: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"[-_.]{2,}|^\d+-\w+-\d+|^1-s2\.").unwrap());
    RE_FILENAME.is_match(title)
}

/// Largest byte index `<= at` that falls on a char boundary.
fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    while at > 0 && !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}
