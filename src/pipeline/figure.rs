//! Decoding of figure-interpreter output.
//!
//! The interpreter is prompted to answer in a loose line format:
//!
//! ```text
//! Type: bar chart
//! Figure Caption: Revenue by quarter
//! Concise Description: Revenue rises each quarter.
//! data:
//! | Quarter | Revenue |
//! | Q1 | 10 |
//! enddata;
//! ```
//!
//! Models drift from the format, so every field is optional and decoding
//! never fails.

use serde::{Deserialize, Serialize};

const TYPE_MARKER: &str = "Type:";
const CAPTION_MARKER: &str = "Figure Caption:";
const DESCRIPTION_MARKER: &str = "Concise Description:";
const DATA_MARKER: &str = "data:";
const DATA_END_MARKER: &str = "enddata";

/// Fields recovered from one interpreter response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DecodedFigure {
    /// Lowercased; `"image"` when the model gave no type.
    pub image_type: String,
    pub caption: String,
    pub description: String,
    /// Structured payload, or the description when no data block exists.
    pub data: String,
}

pub fn decode_figure_output(text: &str) -> DecodedFigure {
    let description = first_line_after(text, DESCRIPTION_MARKER).unwrap_or_default();
    let data = data_block(text).unwrap_or_else(|| description.clone());
    DecodedFigure {
        image_type: first_line_after(text, TYPE_MARKER)
            .map(|t| t.to_lowercase())
            .unwrap_or_else(|| "image".to_string()),
        caption: first_line_after(text, CAPTION_MARKER).unwrap_or_default(),
        description,
        data,
    }
}

fn first_line_after(text: &str, marker: &str) -> Option<String> {
    let (_, rest) = text.split_once(marker)?;
    Some(rest.trim_start().lines().next().unwrap_or("").trim().to_string())
}

/// The data marker only counts at the start of a line, so prose such as
/// "uses metadata: ..." is not mistaken for a data block.
fn data_block(text: &str) -> Option<String> {
    let start = line_starts(text).find_map(|i| {
        let line = text[i..].trim_start_matches([' ', '\t']);
        line.starts_with(DATA_MARKER)
            .then(|| text.len() - line.len() + DATA_MARKER.len())
    })?;
    let rest = &text[start..];
    let body = match rest.split_once(DATA_END_MARKER) {
        Some((body, _)) => body,
        None => rest,
    };
    Some(body.trim().to_string())
}

fn line_starts(text: &str) -> impl Iterator<Item = usize> + '_ {
    std::iter::once(0).chain(text.match_indices('\n').map(|(i, _)| i + 1))
}
