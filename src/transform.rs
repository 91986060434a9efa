//! Content transforms applied to fetched bodies before they are stored.
//!
//! Whether a body is re-serialized, reduced to text or stored untouched is a
//! policy chosen by the caller, not by the fetcher. The fetcher receives one
//! [`ContentTransform`] and applies it to every successful response.
//!
//! | Kind | Transform | Rejects |
//! |------|-----------|---------|
//! | `json` | [`JsonIndent`] | anything that is not a JSON document, including an empty body |
//! | `xml` | [`XmlIndent`] | malformed XML, bodies without a root element |
//! | `html-text` | [`HtmlText`] | bodies that are not UTF-8 |
//! | `verbatim` | [`Verbatim`] | nothing |
//! | `auto` | [`ByContentType`] | whatever the selected transform rejects |

use clap::ValueEnum;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use scraper::Html;
use serde::Deserialize;
use serde::de::IgnoredAny;
use std::fmt;
use thiserror::Error;

/// The body could not be re-serialized in the expected format.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("body is not a JSON document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("body is not a well-formed XML document: {0}")]
    Xml(String),
    #[error("body is not UTF-8 text: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

/// Normalization step between fetch and write.
pub trait ContentTransform: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Turn a response body into the bytes to store.
    ///
    /// `content_type` is the raw `Content-Type` header of the response, if any.
    fn apply(&self, body: &[u8], content_type: Option<&str>) -> Result<Vec<u8>, FormatError>;
}

/// Re-indent a JSON document with two spaces.
///
/// Only whitespace between tokens changes. Strings, numbers, member order and
/// repeated member names are copied byte for byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonIndent;

impl ContentTransform for JsonIndent {
    fn name(&self) -> &'static str {
        "json"
    }

    fn apply(&self, body: &[u8], _content_type: Option<&str>) -> Result<Vec<u8>, FormatError> {
        serde_json::from_slice::<IgnoredAny>(body)?;
        Ok(reindent_json(body))
    }
}

const JSON_INDENT: &[u8] = b"  ";

fn push_newline(out: &mut Vec<u8>, depth: usize) {
    out.push(b'\n');
    for _ in 0..depth {
        out.extend_from_slice(JSON_INDENT);
    }
}

/// Rewrite the whitespace of an already validated JSON document.
fn reindent_json(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + body.len() / 4);
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < body.len() {
        let b = body[i];
        i += 1;

        if in_string {
            out.push(b);
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match b {
            b' ' | b'\t' | b'\n' | b'\r' => {}
            b'"' => {
                in_string = true;
                out.push(b);
            }
            b'{' | b'[' => {
                out.push(b);
                let close = if b == b'{' { b'}' } else { b']' };
                while i < body.len() && body[i].is_ascii_whitespace() {
                    i += 1;
                }
                if body.get(i) == Some(&close) {
                    out.push(close);
                    i += 1;
                } else {
                    depth += 1;
                    push_newline(&mut out, depth);
                }
            }
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                push_newline(&mut out, depth);
                out.push(b);
            }
            b',' => {
                out.push(b);
                push_newline(&mut out, depth);
            }
            b':' => out.extend_from_slice(b": "),
            _ => out.push(b),
        }
    }
    out
}

/// Re-indent an XML document with two spaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlIndent;

impl ContentTransform for XmlIndent {
    fn name(&self) -> &'static str {
        "xml"
    }

    fn apply(&self, body: &[u8], _content_type: Option<&str>) -> Result<Vec<u8>, FormatError> {
        let mut reader = Reader::from_reader(body);
        reader.config_mut().trim_text(true);
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        let mut has_root = false;

        loop {
            match reader.read_event() {
                Ok(Event::Eof) => break,
                Ok(event) => {
                    if matches!(event, Event::Start(_) | Event::Empty(_)) {
                        has_root = true;
                    }
                    writer
                        .write_event(event)
                        .map_err(|e| FormatError::Xml(e.to_string()))?;
                }
                Err(e) => {
                    return Err(FormatError::Xml(format!(
                        "at byte {}: {}",
                        reader.buffer_position(),
                        e
                    )));
                }
            }
        }

        if !has_root {
            return Err(FormatError::Xml("document has no root element".to_string()));
        }
        Ok(writer.into_inner())
    }
}

/// Visible text of an HTML page, one text run per line.
///
/// Text inside `script`, `style`, `noscript` and `template` is skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlText;

const HIDDEN_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

impl ContentTransform for HtmlText {
    fn name(&self) -> &'static str {
        "html-text"
    }

    fn apply(&self, body: &[u8], _content_type: Option<&str>) -> Result<Vec<u8>, FormatError> {
        let html = std::str::from_utf8(body)?;
        let document = Html::parse_document(html);

        let mut content = String::new();
        for node in document.root_element().descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let hidden = node
                .parent()
                .and_then(|p| p.value().as_element().map(|e| e.name()))
                .is_some_and(|name| HIDDEN_ELEMENTS.contains(&name));
            let run = text.trim();
            if hidden || run.is_empty() {
                continue;
            }
            content.push_str(run);
            content.push('\n');
        }
        Ok(content.into_bytes())
    }
}

/// Store the body unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Verbatim;

impl ContentTransform for Verbatim {
    fn name(&self) -> &'static str {
        "verbatim"
    }

    fn apply(&self, body: &[u8], _content_type: Option<&str>) -> Result<Vec<u8>, FormatError> {
        Ok(body.to_vec())
    }
}

/// Pick a transform from the response media type.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByContentType;

impl ByContentType {
    fn select(content_type: Option<&str>) -> &'static dyn ContentTransform {
        let essence = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match essence.as_str() {
            "application/json" | "text/json" => &JsonIndent,
            "text/html" => &HtmlText,
            "application/xml" | "text/xml" => &XmlIndent,
            ct if ct.ends_with("+json") => &JsonIndent,
            ct if ct.ends_with("+xml") => &XmlIndent,
            _ => &Verbatim,
        }
    }
}

impl ContentTransform for ByContentType {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn apply(&self, body: &[u8], content_type: Option<&str>) -> Result<Vec<u8>, FormatError> {
        Self::select(content_type).apply(body, content_type)
    }
}

/// Transform selector used by configuration and the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformKind {
    #[default]
    Json,
    Xml,
    HtmlText,
    Verbatim,
    Auto,
}

impl TransformKind {
    pub fn build(self) -> Box<dyn ContentTransform> {
        match self {
            TransformKind::Json => Box::new(JsonIndent),
            TransformKind::Xml => Box::new(XmlIndent),
            TransformKind::HtmlText => Box::new(HtmlText),
            TransformKind::Verbatim => Box::new(Verbatim),
            TransformKind::Auto => Box::new(ByContentType),
        }
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.build().name())
    }
}
