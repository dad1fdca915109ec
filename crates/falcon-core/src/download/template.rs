//! Filename templates for downloaded files.
//!
//! A template is literal text with `{site}`, `{id}` and `{title}`
//! placeholders. Rendered names are sanitized for every common filesystem.

use crate::error::{FalconError, Result};
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Site,
    Id,
    Title,
}

/// Values substituted into a [`FilenameTemplate`].
#[derive(Debug, Clone, Copy)]
pub struct FilenameFields<'a> {
    pub site: &'a str,
    pub id: &'a str,
    pub title: Option<&'a str>,
}

/// Parsed `download.filename_format`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTemplate {
    source: String,
    segments: Vec<Segment>,
}

const MAX_STEM_CHARS: usize = 150;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]*)\}").expect("placeholder regex must compile"));

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]+"#).expect("filename regex must compile"));

impl FilenameTemplate {
    /// Parse a template. Unknown placeholders and stray braces are
    /// configuration errors.
    pub fn parse(format: &str) -> Result<Self> {
        if format.trim().is_empty() {
            return Err(config_error("filename_format must not be empty"));
        }

        let mut segments = Vec::new();
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(format) {
            let Some(whole) = caps.get(0) else { continue };
            push_literal(&mut segments, &format[last..whole.start()])?;
            let segment = match caps.get(1).map(|m| m.as_str()) {
                Some("site") => Segment::Site,
                Some("id") => Segment::Id,
                Some("title") => Segment::Title,
                Some(other) => {
                    return Err(config_error(&format!(
                        "unknown placeholder {{{}}} in filename_format (expected {{site}}, {{id}} or {{title}})",
                        other
                    )))
                }
                None => continue,
            };
            segments.push(segment);
            last = whole.end();
        }
        push_literal(&mut segments, &format[last..])?;

        if !segments.iter().any(|s| matches!(s, Segment::Id)) {
            tracing::warn!("filename_format {:?} has no {{id}}; names will rely on collision suffixes", format);
        }

        Ok(Self {
            source: format.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render a sanitized file stem (no extension). Falls back to
    /// `<site>_<id>` when the rendered name is empty after sanitizing.
    pub fn render(&self, fields: &FilenameFields<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Site => out.push_str(fields.site),
                Segment::Id => out.push_str(fields.id),
                Segment::Title => out.push_str(fields.title.unwrap_or_default()),
            }
        }

        let stem = sanitize(&out);
        if stem.is_empty() {
            sanitize(&format!("{}_{}", fields.site, fields.id))
        } else {
            stem
        }
    }
}

impl Default for FilenameTemplate {
    fn default() -> Self {
        Self {
            source: "{site}_{id}".to_string(),
            segments: vec![Segment::Site, Segment::Literal("_".to_string()), Segment::Id],
        }
    }
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) -> Result<()> {
    if text.contains('{') || text.contains('}') {
        return Err(config_error(&format!("unbalanced brace in filename_format near {:?}", text)));
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

fn config_error(message: &str) -> FalconError {
    FalconError::Config {
        message: message.to_string(),
    }
}

/// Replace path separators and reserved characters, trim edge dots and
/// whitespace, and bound the length.
pub fn sanitize(name: &str) -> String {
    let replaced = UNSAFE_CHARS.replace_all(name, "_");
    let trimmed = replaced.trim_matches(|c: char| c.is_whitespace() || c == '.' || c == '_');
    trimmed.chars().take(MAX_STEM_CHARS).collect::<String>().trim_end().to_string()
}
