//! Reasoning/document extraction from a growing model output buffer.
//!
//! `extract` is a pure function of the whole buffer and is re-run on every
//! delta. It tolerates documents that are still streaming: when no closed
//! `<code>` block exists yet it falls back through progressively looser
//! heuristics, the last of which closes dangling `<body>`/`<html>` tags so a
//! partial page can be rendered live.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Documents shorter than this are never shown, to avoid flashing fragments.
pub const MIN_RENDERABLE_LEN: usize = 100;

static THINKING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<thinking>(.*?)</thinking>")
        .expect("thinking regex is hardcoded and must be valid")
});

static REASONING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<reasoning>(.*?)</reasoning>")
        .expect("reasoning regex is hardcoded and must be valid")
});

// A reasoning section that has opened but not closed yet runs to the end of the buffer.
static OPEN_REASONING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:thinking|reasoning)>.*\z")
        .expect("open reasoning regex is hardcoded and must be valid")
});

static CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<code>(.*?)</code>").expect("code regex is hardcoded and must be valid")
});

static DOCTYPE_DOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<!doctype\s+html[^>]*>.*</html>")
        .expect("doctype regex is hardcoded and must be valid")
});

static HTML_DOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<html(?:\s[^>]*)?>.*</html>")
        .expect("html regex is hardcoded and must be valid")
});

static FENCED_HTML_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```html[^\n]*\n(.*?)```")
        .expect("html fence regex is hardcoded and must be valid")
});

static FENCED_ANY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[^\n]*\n(.*?)```").expect("fence regex is hardcoded and must be valid")
});

static DOC_START_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<!doctype\s+html|<html(?:[\s>]|$)")
        .expect("document start regex is hardcoded and must be valid")
});

/// Where the document text came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    /// A closed `<code>` block.
    Tagged,
    /// A complete `<!DOCTYPE html>` or `<html>` span in the raw buffer.
    Doctype,
    /// A fenced code block holding HTML.
    Fenced,
    /// Line scan from the first document start, possibly with closing tags added.
    LineScan,
    #[default]
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub reasoning: Option<String>,
    /// Empty when there is not enough structure yet.
    pub document: String,
    pub source: MatchSource,
}

pub fn extract(buffer: &str) -> Extraction {
    let reasoning = extract_reasoning(buffer);

    if let Some(code) = CODE_RE.captures(buffer).and_then(|c| c.get(1)) {
        return Extraction {
            reasoning,
            document: code.as_str().trim().to_string(),
            source: MatchSource::Tagged,
        };
    }

    let (document, source) = fallback_document(&strip_reasoning(buffer))
        .unwrap_or((String::new(), MatchSource::None));

    Extraction {
        reasoning,
        document,
        source,
    }
}

/// Whether a document is complete enough to replace what is on screen.
pub fn is_renderable(document: &str) -> bool {
    document.len() > MIN_RENDERABLE_LEN && document.to_ascii_lowercase().contains("</html>")
}

fn extract_reasoning(buffer: &str) -> Option<String> {
    let section = |re: &Regex| {
        re.captures(buffer)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
    };

    match (section(&THINKING_RE), section(&REASONING_RE)) {
        (None, None) => None,
        (Some(thinking), None) => Some(format!("## Thinking\n{thinking}")),
        (None, Some(reasoning)) => Some(format!("## Reasoning\n{reasoning}")),
        (Some(thinking), Some(reasoning)) => Some(format!(
            "## Thinking\n{thinking}\n\n## Reasoning\n{reasoning}"
        )),
    }
}

fn strip_reasoning(buffer: &str) -> String {
    let stripped = THINKING_RE.replace_all(buffer, "");
    let stripped = REASONING_RE.replace_all(&stripped, "");
    OPEN_REASONING_RE.replace(&stripped, "").into_owned()
}

fn fallback_document(text: &str) -> Option<(String, MatchSource)> {
    if let Some(m) = DOCTYPE_DOC_RE.find(text).or_else(|| HTML_DOC_RE.find(text)) {
        return Some((m.as_str().trim().to_string(), MatchSource::Doctype));
    }

    if let Some(body) = FENCED_HTML_RE.captures(text).and_then(|c| c.get(1)) {
        return Some((body.as_str().trim().to_string(), MatchSource::Fenced));
    }

    let fenced = FENCED_ANY_RE
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|body| DOC_START_RE.is_match(body));
    if let Some(body) = fenced {
        return Some((body.trim().to_string(), MatchSource::Fenced));
    }

    scan_lines(text).map(|doc| (doc, MatchSource::LineScan))
}

/// Take everything from the first document start. Stop at a closing
/// `</html>` if one follows; otherwise close dangling body/html tags.
fn scan_lines(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let (start, offset) = lines
        .iter()
        .enumerate()
        .find_map(|(i, line)| DOC_START_RE.find(line).map(|m| (i, m.start())))?;

    let mut out: Vec<&str> = Vec::new();
    let mut closed = false;
    for (i, line) in lines.iter().enumerate().skip(start) {
        let line = if i == start { &line[offset..] } else { *line };
        if let Some(end) = line.to_ascii_lowercase().find("</html>") {
            out.push(&line[..end + "</html>".len()]);
            closed = true;
            break;
        }
        out.push(line);
    }

    let mut doc = out.join("\n").trim_end().to_string();
    if !closed {
        let lower = doc.to_ascii_lowercase();
        if lower.contains("<body") && !lower.contains("</body>") {
            doc.push_str("\n</body>");
        }
        if lower.contains("<html") {
            doc.push_str("\n</html>");
        }
    }
    Some(doc)
}

/// Per-generation extraction state, fed one delta at a time.
#[derive(Debug, Default)]
pub struct ExtractionState {
    buffer: String,
    reasoning: Option<String>,
    document: Option<String>,
    source: MatchSource,
}

impl ExtractionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and re-extract. Returns true when a renderable
    /// document appeared or changed.
    pub fn push(&mut self, delta: &str) -> bool {
        self.buffer.push_str(delta);
        let extraction = extract(&self.buffer);

        if extraction.reasoning.is_some() {
            self.reasoning = extraction.reasoning;
        }
        self.source = extraction.source;

        if extraction.source == MatchSource::None {
            return false;
        }
        let changed = self.document.as_deref() != Some(extraction.document.as_str());
        let renderable = is_renderable(&extraction.document);
        self.document = Some(extraction.document);
        changed && renderable
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.reasoning.as_deref()
    }

    pub fn document(&self) -> Option<&str> {
        self.document.as_deref()
    }

    pub fn source(&self) -> MatchSource {
        self.source
    }
}
