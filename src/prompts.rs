//! Prompts for the vision-model adapters in [`crate::models::vlm`].
//!
//! The figure prompt fixes the output markers that
//! [`crate::pipeline::figure::decode_figure_output`] parses (`Type:`,
//! `Figure Caption:`, `Concise Description:`, `data:` … `enddata;`). Keep the
//! two in sync: a marker renamed here silently becomes an empty field there.
//!
//! The formatter prompt ends with the literal `Extracted Text:` marker. Some
//! models echo it back; envelope stripping removes the echo.

/// System prompt for the figure interpreter.
pub const FIGURE_SYSTEM_PROMPT: &str = r#"You turn figures cut out of document pages into text a reader can use without seeing the image.

First decide what the figure is:
- A chart or graph: name the chart type and transcribe its data as a Markdown table.
- A flowchart or diagram with arrows: transcribe it as Mermaid code.
- A logo: answer with the organisation name only.
- Anything else: describe what it shows in a few short sentences.

If the figure carries a caption or title, copy it exactly. Otherwise leave the caption empty."#;

/// User prompt for the figure interpreter. Defines the marker layout.
pub const FIGURE_PROMPT: &str = r#"Describe the attached figure using exactly this layout.

For a chart or graph:
Type: (Bar Chart, Line Graph, Pie Chart, ...)
Figure Caption: (caption or title, empty if none)
data:
| the chart data as a Markdown table |
enddata;
Concise Description: (one or two sentences)

For a flowchart or diagram:
Type: Flowchart
Figure Caption: (caption or title, empty if none)
data:
```mermaid
(Mermaid code)
```
enddata;
Concise Description: (one or two sentences)

For any other image:
Type: (Photo, Logo, Illustration, ...)
Figure Caption: (caption or title, empty if none)
Concise Description: (one or two sentences; for a logo only the organisation name)"#;

/// System prompt for the page formatter.
pub const FORMATTER_SYSTEM_PROMPT: &str = r#"You format text extracted from a document page into Markdown, using the page image as the layout reference.
Do not summarise or rewrite the text. You may only restore reading order, rejoin broken words, and drop OCR garbage."#;

/// User prompt for the page formatter; the page text follows the marker.
pub const FORMATTER_PROMPT: &str = r#"Rebuild this page as Markdown so it looks like the attached page image.
- Turn visual headings into Markdown headings and keep the original numbering.
- Repair tables whose extraction broke, for example header cells that spilled onto a line of their own.
- Keep figure descriptions and tables in the place they occupy on the page.
- Output only the Markdown. No explanations and no ```markdown fences.

Extracted Text:
"#;

/// Build the formatter's user message for one page.
pub fn formatter_user_prompt(plain_text: &str) -> String {
    format!("{FORMATTER_PROMPT}{plain_text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn figure_prompt_declares_every_decoded_marker() {
        for marker in ["Type:", "Figure Caption:", "Concise Description:", "data:", "enddata;"] {
            assert!(FIGURE_PROMPT.contains(marker), "missing {marker}");
        }
    }

    #[test]
    fn formatter_prompt_ends_with_text_marker() {
        let p = formatter_user_prompt("Hello");
        assert!(p.ends_with("Extracted Text:\nHello"));
    }
}
