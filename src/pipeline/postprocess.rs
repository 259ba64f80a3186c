//! Deterministic text normalisation. No model involvement, no failure modes.
//!
//! Three passes live here:
//!
//! * [`clean_text`] — OCR cleanup applied to the concatenated element text of
//!   a page (hyphen joins, repeated punctuation, quote artefacts, stray
//!   spaces around punctuation and brackets).
//! * [`strip_envelope`] — defensive parsing of the page formatter's raw
//!   output: ```` ```markdown ```` wrappers, unterminated mermaid fences,
//!   echoed prompt preambles and end-of-turn sentinels.
//! * [`polish_markdown`] — layout rules run on the stripped formatter output
//!   (line endings, blank lines, heading spacing, table repair, placeholder
//!   image links, invisible characters).
//!
//! Every function is `&str → String`, total, and panic-free on any input:
//! an unmatched markdown or mermaid fence is left alone rather than guessed at.

use once_cell::sync::Lazy;
use regex::Regex;

// ── OCR text cleanup ─────────────────────────────────────────────────────────

static RE_HYPHEN_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\w)-[ \t]*\r?\n[ \t]*(\w)").unwrap());
static RE_DOTS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.{2,}").unwrap());
static RE_COMMAS: Lazy<Regex> = Lazy::new(|| Regex::new(r",{2,}").unwrap());
static RE_BANGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"!{2,}").unwrap());
static RE_QUESTIONS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?{2,}").unwrap());
static RE_SPACE_BEFORE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+([.,!?%)\]])").unwrap());
static RE_SPACE_AFTER_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"([(\[])[ \t]+").unwrap());

/// Clean OCR artefacts out of plain page text.
///
/// Only horizontal whitespace is touched around punctuation, so paragraph
/// breaks and table rows keep their line structure.
pub fn clean_text(input: &str) -> String {
    let s = RE_HYPHEN_BREAK.replace_all(input, "$1$2");
    let s = RE_DOTS.replace_all(&s, ".");
    let s = RE_COMMAS.replace_all(&s, ",");
    let s = RE_BANGS.replace_all(&s, "!");
    let s = RE_QUESTIONS.replace_all(&s, "?");
    let s = normalise_quotes(&s);
    let s = RE_SPACE_BEFORE_PUNCT.replace_all(&s, "$1");
    let s = RE_SPACE_AFTER_OPEN.replace_all(&s, "$1");
    s.trim().to_string()
}

fn normalise_quotes(input: &str) -> String {
    input
        .replace("``", "\"")
        .replace("''", "\"")
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
}

// ── Envelope stripping ───────────────────────────────────────────────────────

/// End-of-turn tokens some chat models leak into their output.
pub const SENTINELS: &[&str] = &["<|im_end|>", "<|endoftext|>", "<end_of_turn>", "<|eot_id|>"];

/// Echoed prompt marker; everything up to and including it is dropped.
pub const PROMPT_ECHO_MARKER: &str = "Extracted Text:";

const MARKDOWN_FENCE: &str = "```markdown";
const MERMAID_FENCE: &str = "```mermaid";

/// Strip generative formatting artefacts from raw formatter output.
pub fn strip_envelope(raw: &str) -> String {
    let mut s = raw.replace("\r\n", "\n");

    for sentinel in SENTINELS {
        if let Some(pos) = s.find(sentinel) {
            s.truncate(pos);
        }
    }

    if let Some(pos) = s.find(PROMPT_ECHO_MARKER) {
        s = s[pos + PROMPT_ECHO_MARKER.len()..].to_string();
    }

    // Bare fences only wrap the answer when no markdown or mermaid block exists.
    if s.contains("```") && !s.contains(MARKDOWN_FENCE) && !s.contains(MERMAID_FENCE) {
        s = s.replace("```", "");
    }

    let s = unwrap_markdown_fence(&s);
    let s = close_dangling_mermaid(&s);
    s.trim().to_string()
}

/// Content of the first ```` ```markdown ```` block, closed by the *last*
/// bare ```` ``` ```` line after it. Unclosed wrappers are returned unchanged.
fn unwrap_markdown_fence(input: &str) -> String {
    let Some(start) = input.find(MARKDOWN_FENCE) else {
        return input.to_string();
    };
    let after_tag = &input[start + MARKDOWN_FENCE.len()..];
    let body = match after_tag.find('\n') {
        Some(nl) => &after_tag[nl + 1..],
        None => return input.to_string(),
    };

    let lines: Vec<&str> = body.lines().collect();
    match lines.iter().rposition(|l| l.trim() == "```") {
        Some(close) => lines[..close].join("\n"),
        None => input.to_string(),
    }
}

/// Close the last ```` ```mermaid ```` block if it was never terminated and
/// already reached an arrow line; the fence goes right after the last arrow.
fn close_dangling_mermaid(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let Some(open) = lines
        .iter()
        .rposition(|l| l.trim_start().starts_with(MERMAID_FENCE))
    else {
        return input.to_string();
    };

    let rest = &lines[open + 1..];
    if rest.iter().any(|l| l.trim() == "```") {
        return input.to_string();
    }
    let Some(last_arrow) = rest.iter().rposition(|l| l.contains("-->")) else {
        return input.to_string();
    };

    let insert_at = open + 1 + last_arrow + 1;
    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 1);
    out.extend_from_slice(&lines[..insert_at]);
    out.push("```");
    out.extend_from_slice(&lines[insert_at..]);
    out.join("\n")
}

// ── Markdown polish ──────────────────────────────────────────────────────────

/// Layout rules applied after [`strip_envelope`], in order.
pub fn polish_markdown(input: &str) -> String {
    let s = input.replace("\r\n", "\n").replace('\r', "\n");
    let s = trim_line_ends(&s);
    let s = collapse_blank_runs(&s);
    let s = space_headings(&s);
    let s = insert_missing_table_separator(&s);
    let s = drop_body_separators(&s);
    let s = replace_placeholder_images(&s);
    let s = s.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    );
    single_final_newline(&s)
}

fn trim_line_ends(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_runs(input: &str) -> String {
    RE_BLANK_RUN.replace_all(input, "\n\n\n").into_owned()
}

static RE_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#{1,6}\s").unwrap());

fn space_headings(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in input.lines() {
        if RE_HEADING.is_match(line) && out.last().is_some_and(|prev| !prev.is_empty()) {
            out.push("");
        }
        out.push(line);
    }
    out.join("\n")
}

fn is_pipe_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_rule_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|')
        && t.contains('-')
        && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// A header row directly followed by a data row gets a `| --- |` rule.
fn insert_missing_table_separator(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);
    for (i, line) in lines.iter().enumerate() {
        out.push(line.to_string());
        let starts_table = is_pipe_row(line)
            && !is_rule_row(line)
            && (i == 0 || !is_pipe_row(lines[i - 1]));
        let next_is_data = lines
            .get(i + 1)
            .is_some_and(|n| is_pipe_row(n) && !is_rule_row(n));
        if starts_table && next_is_data {
            out.push(super::table::separator_row(super::table::column_count(line)));
        }
    }
    out.join("\n")
}

/// Within a table only the rule in second position survives.
fn drop_body_separators(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut row = 0usize;
    for line in input.lines() {
        if is_pipe_row(line) {
            row += 1;
            if is_rule_row(line) && row != 2 {
                continue;
            }
        } else {
            row = 0;
        }
        out.push(line);
    }
    out.join("\n")
}

static RE_IMAGE_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

const PLACEHOLDER_HOSTS: &[&str] = &[
    "example.com",
    "placeholder.com",
    "dummyimage.com",
    "picsum.photos",
    "placehold.it",
];

fn is_placeholder_target(url: &str) -> bool {
    let u = url.trim();
    let remote = u.starts_with("http://") || u.starts_with("https://");
    !remote || PLACEHOLDER_HOSTS.iter().any(|h| u.contains(h))
}

/// Image links the formatter invented become italic captions.
fn replace_placeholder_images(input: &str) -> String {
    RE_IMAGE_LINK
        .replace_all(input, |caps: &regex::Captures<'_>| {
            if !is_placeholder_target(&caps[2]) {
                return caps[0].to_string();
            }
            let alt = caps[1].trim();
            if alt.is_empty() {
                String::new()
            } else {
                format!("*{alt}*")
            }
        })
        .into_owned()
}

fn single_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{trimmed}\n")
    }
}
