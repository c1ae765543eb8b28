//! Userscript header parsing.
//!
//! Every userscript starts with a comment block:
//!
//! ```text
//! // ==UserScript==
//! // @name     Example
//! // @match    *://example.com/*
//! // @grant    GM_setValue
//! // @noframes
//! // ==/UserScript==
//! ```
//!
//! Keys are lowercased, repeated keys accumulate their values in order and
//! flag-style keys (`@noframes`) get a single empty value.

use super::error::{RuntimeError, RuntimeResult};
use super::script::Metadata;

const HEADER_START: &str = "==UserScript==";
const HEADER_END: &str = "==/UserScript==";

/// Parse the metadata block of a userscript.
pub fn parse_header(source: &str) -> RuntimeResult<Metadata> {
    let mut metadata = Metadata::new();
    let mut in_header = false;
    let mut closed = false;

    for line in source.lines() {
        let Some(comment) = line.trim().strip_prefix("//") else {
            if in_header && !line.trim().is_empty() {
                return Err(RuntimeError::HeaderInvalid(format!(
                    "unexpected line inside header: {}",
                    line.trim()
                )));
            }
            continue;
        };
        let comment = comment.trim();

        if !in_header {
            if comment == HEADER_START {
                in_header = true;
            }
            continue;
        }

        if comment == HEADER_END {
            closed = true;
            break;
        }

        let Some(entry) = comment.strip_prefix('@') else {
            continue;
        };

        let (key, value) = match entry.split_once(char::is_whitespace) {
            Some((key, value)) => (key, value.trim()),
            None => (entry, ""),
        };
        if key.is_empty() {
            continue;
        }

        metadata
            .entry(key.to_lowercase())
            .or_default()
            .push(value.to_string());
    }

    if !in_header {
        return Err(RuntimeError::HeaderInvalid(
            "missing ==UserScript== block".to_string(),
        ));
    }
    if !closed {
        return Err(RuntimeError::HeaderInvalid(
            "unterminated ==UserScript== block".to_string(),
        ));
    }
    if metadata
        .get("name")
        .and_then(|v| v.first())
        .map_or(true, |name| name.is_empty())
    {
        return Err(RuntimeError::HeaderInvalid("@name is required".to_string()));
    }

    Ok(metadata)
}
