//! Decoding of structured (JSON) model output.
//!
//! Models wrap JSON in Markdown fences, prefix it with prose, or return it
//! bare. [`decode`] accepts all of those uniformly and reports whether the
//! payload was not JSON at all or was JSON with the wrong shape.

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuredOutputError {
    #[error("output is not JSON: {detail}")]
    NotJson { detail: String },

    #[error("output JSON has an unexpected shape: {detail}")]
    WrongShape { detail: String },
}

pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, StructuredOutputError> {
    let value = decode_value(raw)?;
    serde_json::from_value(value).map_err(|err| StructuredOutputError::WrongShape {
        detail: err.to_string(),
    })
}

/// Decodes to `T`, or substitutes `T::default()` when the output is unusable.
/// For stages whose output is advisory.
pub fn decode_or_default<T: DeserializeOwned + Default>(raw: &str, what: &str) -> T {
    match decode(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(what, error = %err, "model output unusable; using empty default");
            T::default()
        }
    }
}

pub fn decode_value(raw: &str) -> Result<serde_json::Value, StructuredOutputError> {
    let payload = strip_code_fence(raw.trim());
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            let Some(span) = first_json_object(payload) else {
                return Err(StructuredOutputError::NotJson {
                    detail: first_err.to_string(),
                });
            };
            serde_json::from_str(span).map_err(|err| StructuredOutputError::NotJson {
                detail: err.to_string(),
            })
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Skip the info string (`json`, `JSON`, ...) up to the end of the line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim()
}

/// Span of the first balanced top-level `{...}`, honouring string literals.
fn first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if b == b'\\' {
                i += 2;
                continue;
            }
            if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(&text[start..=i]);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Default, PartialEq, Deserialize)]
    struct FactsOnly {
        facts: Vec<String>,
    }

    #[test]
    fn fenced_and_bare_payloads_decode_identically() {
        let fenced: FactsOnly = decode("```json\n{\"facts\":[]}\n```").unwrap();
        let bare: FactsOnly = decode("{\"facts\":[]}").unwrap();
        assert_eq!(fenced, bare);
    }

    #[test]
    fn fence_without_language_tag_is_accepted() {
        let value = decode_value("```\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn prose_around_object_is_tolerated() {
        let value = decode_value("Here you go:\n{\"a\": \"}\"} hope it helps").unwrap();
        assert_eq!(value["a"], "}");
    }

    #[test]
    fn distinguishes_not_json_from_wrong_shape() {
        let not_json = decode::<FactsOnly>("I could not find any facts.").unwrap_err();
        assert!(matches!(not_json, StructuredOutputError::NotJson { .. }));

        let wrong_shape = decode::<FactsOnly>("{\"facts\": 3}").unwrap_err();
        assert!(matches!(wrong_shape, StructuredOutputError::WrongShape { .. }));
    }

    #[test]
    fn decode_or_default_substitutes_empty_value() {
        let out: FactsOnly = decode_or_default("not json", "facts");
        assert_eq!(out, FactsOnly::default());
    }
}
