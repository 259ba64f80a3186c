//! Table conversion and fragment helpers.
//!
//! Layout engines hand tables over either as HTML (`<table><tr><td>…`) or as
//! plain cell rows (spreadsheets). Both become GFM pipe tables *without* a
//! header rule; the rule is synthesised once, when the reconciliation engine
//! flushes a (possibly fused) table, by [`format_table`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Raw table payload carried by a structural element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawTable {
    Html(String),
    Rows(Vec<Vec<String>>),
    /// Already pipe-formatted markdown.
    Markdown(String),
}

impl RawTable {
    pub fn to_markdown(&self) -> String {
        match self {
            RawTable::Html(html) => html_to_markdown(html),
            RawTable::Rows(rows) => rows_to_markdown(rows),
            RawTable::Markdown(md) => md.clone(),
        }
    }
}

static RE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").unwrap());
static RE_CELL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<t[hd][^>]*>(.*?)</t[hd]>").unwrap());
static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]+>").unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Convert an HTML table into pipe rows, one per `<tr>`.
pub fn html_to_markdown(html: &str) -> String {
    let rows: Vec<Vec<String>> = RE_ROW
        .captures_iter(html)
        .map(|row| {
            RE_CELL
                .captures_iter(&row[1])
                .map(|cell| cell_text(&cell[1]))
                .collect()
        })
        .filter(|cells: &Vec<String>| !cells.is_empty())
        .collect();
    rows_to_markdown(&rows)
}

fn cell_text(inner: &str) -> String {
    let text = RE_TAG.replace_all(inner, " ");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    RE_WS.replace_all(text.trim(), " ").into_owned()
}

/// Render cell rows as pipe rows. Short rows are padded to the widest row;
/// line breaks inside a cell become `<br>`.
pub fn rows_to_markdown(rows: &[Vec<String>]) -> String {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return String::new();
    }
    rows.iter()
        .map(|row| {
            let cells: Vec<String> = (0..width)
                .map(|i| {
                    row.get(i)
                        .map(|c| {
                            c.trim()
                                .replace('|', "\\|")
                                .replace("\r\n", "<br>")
                                .replace('\n', "<br>")
                        })
                        .unwrap_or_default()
                })
                .collect();
            format!("| {} |", cells.join(" | "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

static RE_EMPTY_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\|(\s*\|)+\s*$").unwrap());
static RE_RULE_ROW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\|(\s*:?-{3,}:?\s*\|)+\s*$").unwrap());

/// Drop blank lines, all-empty rows and rule rows; trim what is left.
pub fn filter_table(md: &str) -> String {
    md.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !RE_EMPTY_ROW.is_match(line) && !RE_RULE_ROW.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Border pipe count of the first non-blank line; `0` for an empty table.
///
/// A `\|` inside a cell is content, not a border.
pub fn column_count(md: &str) -> usize {
    md.lines()
        .find(|l| !l.trim().is_empty())
        .map(border_pipes)
        .unwrap_or(0)
}

fn border_pipes(line: &str) -> usize {
    let mut count = 0;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '|' => count += 1,
            _ => {}
        }
    }
    count
}

/// `| --- | --- |` for a row with `pipes` pipe characters.
pub fn separator_row(pipes: usize) -> String {
    let cols = pipes.saturating_sub(1).max(1);
    format!("|{}|", vec![" --- "; cols].join("|"))
}

/// Insert a header rule after the first line.
pub fn format_table(md: &str) -> String {
    let pipes = column_count(md);
    if pipes == 0 {
        return md.to_string();
    }
    let mut lines: Vec<String> = md.lines().map(str::to_string).collect();
    lines.insert(1.min(lines.len()), separator_row(pipes));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaped_pipes_are_not_borders() {
        let md = rows_to_markdown(&[vec!["a|b".into(), "c".into()]]);
        assert_eq!(md, "| a\\|b | c |");
        assert_eq!(column_count(&md), 3);
        assert_eq!(column_count(r"| x \\| y |"), 3);
        assert_eq!(
            format_table(&md),
            "| a\\|b | c |\n| --- | --- |"
        );
    }

    #[test]
    fn html_table_to_rows() {
        let html = "<table><tr><th>Name</th><th>Qty</th></tr>\
                    <tr><td><b>Apple</b></td><td>3 &amp; 4</td></tr>\
                    <tr><td>Pipe | char</td><td></td></tr></table>";
        assert_eq!(
            html_to_markdown(html),
            "| Name | Qty |\n| Apple | 3 & 4 |\n| Pipe \\| char |  |"
        );
    }

    #[test]
    fn ragged_rows_are_padded() {
        let rows = vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]];
        assert_eq!(rows_to_markdown(&rows), "| a | b |\n| c |  |");
        assert_eq!(rows_to_markdown(&[]), "");
    }

    #[test]
    fn filter_removes_rules_and_empty_rows() {
        let md = "  | a | b |  \n|---|---|\n|  |  |\n\n| 1 | 2 |\n| :---: | --- |";
        assert_eq!(filter_table(md), "| a | b |\n| 1 | 2 |");
    }

    #[test]
    fn column_count_uses_first_non_blank_line() {
        assert_eq!(column_count("\n\n| a | b | c |\n| 1 |"), 4);
        assert_eq!(column_count(""), 0);
    }

    #[test]
    fn format_inserts_header_rule() {
        assert_eq!(
            format_table("| a | b |\n| 1 | 2 |"),
            "| a | b |\n| --- | --- |\n| 1 | 2 |"
        );
        assert_eq!(format_table("| a |"), "| a |\n| --- |");
        assert_eq!(format_table(""), "");
    }
}
