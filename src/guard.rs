//! Pre-flight checks on submitted source and publish requests.
//!
//! Rejects known sandbox-escape constructs and over-quota publishes
//! synchronously, before any job id is created or a queue slot consumed.

use crate::bundler::{
    is_ident_char, is_ident_start, read_string_literal, scan_imports, skip_block_comment,
    skip_line_comment, skip_string, skip_trivia,
};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

/// Module whose import breaks the browser sandbox (SES lockdown freezes
/// intrinsics and white-screens the host page).
const FORBIDDEN_MODULE: &str = "ses";

/// Reject source containing known dangerous constructs.
///
/// Checked: importing (static or dynamic) or requiring the SES module, and
/// calling `lockdown()`. The scan skips comments and string literals, so
/// mentioning these in text is fine.
pub fn check_source(source: &str) -> Result<()> {
    for r in scan_imports(source) {
        if r.specifier == FORBIDDEN_MODULE {
            return Err(PipelineError::DangerousPattern(format!(
                "import of '{FORBIDDEN_MODULE}'"
            )));
        }
    }
    if calls_function(source, "lockdown", None) {
        return Err(PipelineError::DangerousPattern("lockdown()".into()));
    }
    if calls_function(source, "require", Some(FORBIDDEN_MODULE)) {
        return Err(PipelineError::DangerousPattern(format!(
            "require('{FORBIDDEN_MODULE}')"
        )));
    }
    Ok(())
}

/// Per-owner listing quota, applied before a new listing's build is accepted.
pub fn check_app_quota(owned_active: usize, gold: bool, config: &PipelineConfig) -> Result<()> {
    let limit = if gold {
        config.gold_max_apps_per_user
    } else {
        config.max_apps_per_user
    };
    if owned_active >= limit {
        Err(PipelineError::MaxApps { limit })
    } else {
        Ok(())
    }
}

/// True when `name(...)` is called in code position, optionally requiring the
/// first argument to be the given string literal.
fn calls_function(source: &str, name: &str, arg: Option<&str>) -> bool {
    let bytes = source.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                i = skip_line_comment(bytes, i);
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                i = skip_block_comment(bytes, i);
            }
            b'\'' | b'"' | b'`' => {
                i = skip_string(bytes, i);
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                let prev_ok = start == 0 || !is_ident_char(bytes[start - 1]);
                if prev_ok && &source[start..i] == name {
                    let j = skip_trivia(bytes, i);
                    if j < bytes.len() && bytes[j] == b'(' {
                        match arg {
                            None => return true,
                            Some(expected) => {
                                let k = skip_trivia(bytes, j + 1);
                                if k < bytes.len() && (bytes[k] == b'\'' || bytes[k] == b'"') {
                                    if let Some((range, _)) = read_string_literal(bytes, k) {
                                        if &source[range] == expected {
                                            return true;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            _ => i += 1,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_component_source_is_allowed() {
        let src = r#"
            import React from "react";
            export default function App() { return <div>hi</div>; }
        "#;
        assert!(check_source(src).is_ok());
    }

    #[test]
    fn test_blocks_lockdown_call() {
        let src = "lockdown();";
        match check_source(src) {
            Err(PipelineError::DangerousPattern(what)) => assert!(what.contains("lockdown")),
            other => panic!("expected DangerousPattern, got {other:?}"),
        }
    }

    #[test]
    fn test_blocks_ses_imports_in_every_form() {
        for src in [
            r#"import "ses";"#,
            r#"import { lockdown as l } from 'ses';"#,
            r#"const m = import("ses");"#,
            r#"const m = require('ses');"#,
        ] {
            assert!(check_source(src).is_err(), "{src}");
        }
    }

    #[test]
    fn test_mentions_in_strings_and_comments_are_fine() {
        let src = r#"
            // lockdown() would be bad
            const note = "do not call lockdown() or require('ses')";
        "#;
        assert!(check_source(src).is_ok());
    }

    #[test]
    fn test_identifier_prefix_does_not_trip_the_guard() {
        let src = "function unlockdown() {} const x = lockdownish; myrequire('ses');";
        assert!(check_source(src).is_ok());
    }

    #[test]
    fn test_quota_limits_and_gold_tier() {
        let config = PipelineConfig::default(); // 2 normal, 10 gold
        assert!(check_app_quota(1, false, &config).is_ok());
        match check_app_quota(2, false, &config) {
            Err(PipelineError::MaxApps { limit }) => assert_eq!(limit, 2),
            other => panic!("expected MaxApps, got {other:?}"),
        }
        assert!(check_app_quota(2, true, &config).is_ok());
        assert!(check_app_quota(10, true, &config).is_err());
    }
}
