//! Prompt template rendering.
//!
//! Substitutes `{{<step-id>.result}}` placeholders with the results of steps
//! that have already completed. `<step-id>` is one or more of
//! `[A-Za-z0-9_-]`. Anything else inside braces is plain text.

use std::collections::HashMap;

use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = ".result}}";

/// A template referenced step results that were not available.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    /// Every unresolved step ID, in order of first appearance.
    #[error("unresolved placeholders for steps: {}", .missing.join(", "))]
    Unresolved { missing: Vec<String> },
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Try to read a placeholder at the start of `text`.
///
/// Returns the step ID and the placeholder's byte length.
fn match_placeholder(text: &str) -> Option<(&str, usize)> {
    let body = text.strip_prefix(OPEN)?;
    let id_len = body.find(|c: char| !is_id_char(c)).unwrap_or(body.len());
    if id_len == 0 || !body[id_len..].starts_with(CLOSE) {
        return None;
    }
    Some((&body[..id_len], OPEN.len() + id_len + CLOSE.len()))
}

/// Render `template` against completed step results.
///
/// Fails only when a well-formed placeholder names a step with no result; the
/// error lists all such steps so they can be fixed in one pass.
pub fn render_prompt(
    template: &str,
    results: &HashMap<String, String>,
) -> Result<String, RenderError> {
    let mut out = String::with_capacity(template.len());
    let mut missing: Vec<String> = Vec::new();
    let mut rest = template;

    while let Some(pos) = rest.find(OPEN) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        match match_placeholder(rest) {
            Some((id, len)) => {
                match results.get(id) {
                    Some(value) => out.push_str(value),
                    None => {
                        if !missing.iter().any(|m| m == id) {
                            missing.push(id.to_string());
                        }
                    }
                }
                rest = &rest[len..];
            }
            None => {
                // Not a placeholder; keep one brace and rescan from the next.
                out.push('{');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);

    if missing.is_empty() {
        Ok(out)
    } else {
        Err(RenderError::Unresolved { missing })
    }
}

/// Step IDs referenced by placeholders in `template`, deduplicated.
pub fn placeholder_ids(template: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let mut rest = template;
    while let Some(pos) = rest.find(OPEN) {
        rest = &rest[pos..];
        match match_placeholder(rest) {
            Some((id, len)) => {
                if !ids.iter().any(|existing| existing == id) {
                    ids.push(id.to_string());
                }
                rest = &rest[len..];
            }
            None => rest = &rest[1..],
        }
    }
    ids
}
