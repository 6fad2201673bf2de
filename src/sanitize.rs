//! Extraction and neutralization of the model's query expression.
//!
//! The model is asked to answer with a fenced code block. [`Sanitizer`] pulls
//! out the text between the first pair of fences, strips echoed language tags,
//! normalizes `ISODate` to `Date`, and replaces every known spelling of the
//! collection with [`PLACEHOLDER`].
//!
//! The sanitizer is purely textual. It does not check what the expression
//! does; [`crate::query`] parses and validates it before anything touches the
//! store.

use crate::error::PipelineError;

/// Opaque stand-in for the collection handle.
pub const PLACEHOLDER: &str = "__COLLECTION__";

const FENCE: &str = "```";

/// Language tags models echo at the top of a fenced block.
const LANGUAGE_TAGS: &[&str] = &[
    "javascript",
    "JavaScript",
    "js",
    "json",
    "mongodb",
    "mongo",
    "mongosh",
    "shell",
];

/// Returns the text strictly between the first pair of fences.
pub fn extract_fenced(raw: &str) -> Option<&str> {
    let start = raw.find(FENCE)? + FENCE.len();
    let len = raw[start..].find(FENCE)?;
    Some(&raw[start..start + len])
}

#[derive(Debug, Clone)]
pub struct Sanitizer {
    aliases: Vec<String>,
}

impl Sanitizer {
    /// Creates a sanitizer for the given collection spellings.
    ///
    /// Longer aliases are tried first so that `db.financials` wins over a
    /// shorter alias that happens to be its suffix.
    pub fn new<I, S>(aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut aliases: Vec<String> = aliases
            .into_iter()
            .map(Into::into)
            .filter(|a| !a.is_empty())
            .collect();
        aliases.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        aliases.dedup();
        Self { aliases }
    }

    /// Extracts and neutralizes the fenced expression in `raw`.
    pub fn sanitize(&self, raw: &str) -> Result<String, PipelineError> {
        let fenced = extract_fenced(raw).ok_or_else(|| {
            PipelineError::Format("no fenced code block in model output".to_string())
        })?;
        Ok(self.neutralize(fenced))
    }

    /// The fence-free part of [`sanitize`](Self::sanitize). Idempotent.
    pub fn neutralize(&self, text: &str) -> String {
        let text = strip_language_tags(text.trim());
        let text = replace_until_stable(text, "ISODate", "Date");
        self.replace_aliases(&text).trim().to_string()
    }

    fn replace_aliases(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut quote: Option<char> = None;
        let mut escaped = false;
        let mut comment_end = 0;
        let mut i = 0;

        while i < text.len() {
            let rest = &text[i..];
            let Some(c) = rest.chars().next() else { break };

            if let Some(q) = quote {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
                out.push(c);
                i += c.len_utf8();
                continue;
            }

            if i >= comment_end {
                if let Some(len) = comment_len(rest) {
                    comment_end = i + len;
                }
            }

            if i >= comment_end && matches!(c, '"' | '\'' | '`') {
                quote = Some(c);
                out.push(c);
                i += 1;
                continue;
            }

            let matched = self.aliases.iter().find(|alias| {
                rest.starts_with(alias.as_str())
                    && boundary_before(text, i)
                    && boundary_after(text, i + alias.len())
            });
            match matched {
                Some(alias) => {
                    out.push_str(PLACEHOLDER);
                    i += alias.len();
                }
                None => {
                    out.push(c);
                    i += c.len_utf8();
                }
            }
        }
        out
    }
}

/// Length of a `//` or `/* */` comment starting at `rest`. Quotes inside a
/// comment do not open a string.
fn comment_len(rest: &str) -> Option<usize> {
    if rest.starts_with("//") {
        Some(rest.find('\n').unwrap_or(rest.len()))
    } else if rest.starts_with("/*") {
        Some(rest[2..].find("*/").map_or(rest.len(), |end| end + 4))
    } else {
        None
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

fn boundary_before(text: &str, i: usize) -> bool {
    text[..i]
        .chars()
        .next_back()
        .map_or(true, |c| !is_ident_char(c) && c != '.')
}

fn boundary_after(text: &str, i: usize) -> bool {
    text[i..].chars().next().map_or(true, |c| !is_ident_char(c))
}

fn strip_language_tags(mut text: &str) -> &str {
    'outer: loop {
        for tag in LANGUAGE_TAGS {
            if let Some(rest) = text.strip_prefix(tag) {
                if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                    text = rest.trim_start();
                    continue 'outer;
                }
            }
        }
        return text;
    }
}

fn replace_until_stable(text: &str, from: &str, to: &str) -> String {
    let mut out = text.to_string();
    while out.contains(from) {
        out = out.replace(from, to);
    }
    out
}
