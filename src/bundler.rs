//! Inline bundler: compiles one untrusted source document into a single
//! browser-runnable ES module string.
//!
//! - Bare imports are routed through the [`ImportResolver`] and the resolved
//!   URL is embedded in the output, so the browser fetches the dependency at
//!   runtime instead of the bundle carrying its bytes
//! - Relative imports resolve against a caller-supplied virtual module map
//!   and are inlined as base64 `data:` module URLs
//! - After compilation the output is re-scanned; any surviving bare
//!   specifier aborts the build (defense in depth, independent of resolver
//!   correctness)

use crate::error::{PipelineError, Result};
use crate::resolver::{classify, ImportPolicy, ImportResolver, SpecifierKind};
use base64::Engine;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Range;
use std::pin::Pin;

/// Recursion bound for inlined local modules.
const MAX_INLINE_DEPTH: usize = 8;

/// Options for one bundle invocation.
#[derive(Debug, Clone, Default)]
pub struct BundleOptions {
    /// Local modules addressable from the inline source via relative
    /// specifiers (e.g. `"./ui.js"` -> module source text).
    pub virtual_modules: HashMap<String, String>,
}

/// One import site found in source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    /// Byte range of the specifier text, excluding quotes.
    pub spec_range: Range<usize>,
    pub specifier: String,
    pub dynamic: bool,
}

/// Bundle `source` into a self-contained ES module string.
///
/// Purely functional given its inputs and the resolver cache state; the same
/// source + policy yields byte-identical output.
pub async fn bundle(
    source: &str,
    options: &BundleOptions,
    resolver: &ImportResolver,
    policy: &ImportPolicy,
) -> Result<String> {
    let out = bundle_module(source, options, resolver, policy, 0).await?;
    // Hard failure gate: a resolver bug or a bypass inside nested dynamic
    // code must not silently ship to the browser sandbox.
    check_no_bare_imports(&out)?;
    Ok(out)
}

/// Scan `text` for bare import specifiers and fail listing all of them.
pub fn check_no_bare_imports(text: &str) -> Result<()> {
    let unresolved: Vec<String> = scan_imports(text)
        .into_iter()
        .filter(|r| classify(&r.specifier) == SpecifierKind::Bare)
        .map(|r| r.specifier)
        .collect();
    if unresolved.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::UnresolvedImports(unresolved))
    }
}

fn bundle_module<'a>(
    source: &'a str,
    options: &'a BundleOptions,
    resolver: &'a ImportResolver,
    policy: &'a ImportPolicy,
    depth: usize,
) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_INLINE_DEPTH {
            return Err(PipelineError::UnknownLocalModule(format!(
                "local imports nested deeper than {MAX_INLINE_DEPTH} levels"
            )));
        }

        let refs = scan_imports(source);
        let mut replacements: Vec<(Range<usize>, String)> = Vec::new();

        for r in &refs {
            match classify(&r.specifier) {
                SpecifierKind::Bare => {
                    let resolved = resolver.resolve(&r.specifier, policy).await?;
                    replacements.push((r.spec_range.clone(), resolved.resolved_url));
                }
                SpecifierKind::Relative => {
                    let module = lookup_virtual(options, &r.specifier).ok_or_else(|| {
                        PipelineError::UnknownLocalModule(r.specifier.clone())
                    })?;
                    let inlined =
                        bundle_module(module, options, resolver, policy, depth + 1).await?;
                    // The module body is opaque once encoded, so gate it here.
                    check_no_bare_imports(&inlined)?;
                    let data_url = format!(
                        "data:text/javascript;base64,{}",
                        base64::engine::general_purpose::STANDARD.encode(inlined.as_bytes())
                    );
                    replacements.push((r.spec_range.clone(), data_url));
                }
                // Absolute paths and URLs pass through unchanged.
                SpecifierKind::Absolute | SpecifierKind::Url => {}
            }
        }

        let mut out = source.to_string();
        for (range, replacement) in replacements.into_iter().rev() {
            out.replace_range(range, &replacement);
        }
        Ok(out)
    })
}

fn lookup_virtual<'a>(options: &'a BundleOptions, spec: &str) -> Option<&'a str> {
    options
        .virtual_modules
        .get(spec)
        .or_else(|| spec.strip_prefix("./").and_then(|s| options.virtual_modules.get(s)))
        .map(String::as_str)
}

// ============================================================================
// Import scanner
// ============================================================================

/// Find every static `import`/`export ... from` specifier and every literal
/// dynamic `import("...")` in `src`, skipping comments and string literals.
pub fn scan_imports(src: &str) -> Vec<ImportRef> {
    let bytes = src.as_bytes();
    let mut refs = Vec::new();
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
                // Keyword only at an identifier boundary.
                let prev_ok = start == 0 || !is_ident_char(bytes[start - 1]);
                let word = &src[start..i];
                if prev_ok && (word == "import" || word == "export") {
                    if let Some((r, next)) = parse_clause(src, i, word == "import") {
                        refs.push(r);
                        i = next;
                    }
                }
            }
            _ => i += 1,
        }
    }
    refs
}

/// Parse the clause following an `import`/`export` keyword, returning the
/// specifier reference when the clause names a module.
fn parse_clause(src: &str, mut i: usize, is_import: bool) -> Option<(ImportRef, usize)> {
    let bytes = src.as_bytes();
    i = skip_trivia(bytes, i);

    // Dynamic import: only literal specifiers are recognized.
    if is_import && i < bytes.len() && bytes[i] == b'(' {
        let mut j = skip_trivia(bytes, i + 1);
        if j < bytes.len() && (bytes[j] == b'\'' || bytes[j] == b'"') {
            let (range, end) = read_string_literal(bytes, j)?;
            j = skip_trivia(bytes, end);
            if j < bytes.len() && bytes[j] == b')' {
                return Some((
                    ImportRef {
                        specifier: src[range.clone()].to_string(),
                        spec_range: range,
                        dynamic: true,
                    },
                    j + 1,
                ));
            }
        }
        return None;
    }

    // Static form: walk the clause head. Only identifiers, `*`, braces and
    // commas may precede the specifier; anything else means this is not a
    // module-naming statement (e.g. `export const x = ...`).
    let mut first_token = true;
    let mut last_was_from = false;
    loop {
        i = skip_trivia(bytes, i);
        if i >= bytes.len() {
            return None;
        }
        match bytes[i] {
            b'\'' | b'"' => {
                // `import "side-effect"` or `... from "module"`.
                if (is_import && first_token) || last_was_from {
                    let (range, end) = read_string_literal(bytes, i)?;
                    return Some((
                        ImportRef {
                            specifier: src[range.clone()].to_string(),
                            spec_range: range,
                            dynamic: false,
                        },
                        end,
                    ));
                }
                return None;
            }
            b'{' | b'}' | b',' | b'*' => {
                last_was_from = false;
                first_token = false;
                i += 1;
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                last_was_from = &src[start..i] == "from";
                first_token = false;
            }
            _ => return None,
        }
    }
}

pub(crate) fn skip_trivia(bytes: &[u8], mut i: usize) -> usize {
    loop {
        while i < bytes.len() && (bytes[i] as char).is_whitespace() {
            i += 1;
        }
        if i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'/' {
            i = skip_line_comment(bytes, i);
        } else if i + 1 < bytes.len() && bytes[i] == b'/' && bytes[i + 1] == b'*' {
            i = skip_block_comment(bytes, i);
        } else {
            return i;
        }
    }
}

pub(crate) fn skip_line_comment(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

pub(crate) fn skip_block_comment(bytes: &[u8], mut i: usize) -> usize {
    i += 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

/// Skip a quoted string or template literal starting at `i`.
pub(crate) fn skip_string(bytes: &[u8], i: usize) -> usize {
    let quote = bytes[i];
    let mut j = i + 1;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            c if c == quote => return j + 1,
            _ => j += 1,
        }
    }
    bytes.len()
}

/// Read a `'...'`/`"..."` literal at `i`, returning the content range and
/// the index past the closing quote.
pub(crate) fn read_string_literal(bytes: &[u8], i: usize) -> Option<(Range<usize>, usize)> {
    let quote = bytes[i];
    let start = i + 1;
    let mut j = start;
    while j < bytes.len() {
        match bytes[j] {
            b'\\' => j += 2,
            c if c == quote => return Some((start..j, j + 1)),
            b'\n' => return None,
            _ => j += 1,
        }
    }
    None
}

pub(crate) fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c == b'$'
}

pub(crate) fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::seed_cache;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn specs(src: &str) -> Vec<(String, bool)> {
        scan_imports(src)
            .into_iter()
            .map(|r| (r.specifier, r.dynamic))
            .collect()
    }

    #[test]
    fn test_scanner_finds_static_forms() {
        let src = r#"
            import React from "react";
            import { useState as s } from 'react';
            import * as all from "lodash";
            import "side-effect-pkg";
            export { helper } from "./util.js";
            export * from "https://cdn.example/x.js";
        "#;
        let found = specs(src);
        assert_eq!(
            found,
            vec![
                ("react".to_string(), false),
                ("react".to_string(), false),
                ("lodash".to_string(), false),
                ("side-effect-pkg".to_string(), false),
                ("./util.js".to_string(), false),
                ("https://cdn.example/x.js".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_scanner_finds_dynamic_imports() {
        let src = r#"const m = await import("lazy-pkg"); import('./local.js');"#;
        let found = specs(src);
        assert_eq!(
            found,
            vec![
                ("lazy-pkg".to_string(), true),
                ("./local.js".to_string(), true)
            ]
        );
    }

    #[test]
    fn test_scanner_skips_comments_and_strings() {
        let src = r#"
            // import fake from "commented-out";
            /* import "also-commented"; */
            const s = 'import x from "in-string"';
            const t = `import y from "in-template"`;
            import real from "actual-pkg";
        "#;
        assert_eq!(specs(src), vec![("actual-pkg".to_string(), false)]);
    }

    #[test]
    fn test_scanner_ignores_non_module_statements() {
        let src = r#"
            export const greeting = "hello";
            export default function App() { return null; }
            export function importHelper() {}
            const reimport = 1; const importer = 2;
            import.meta.url;
        "#;
        assert!(specs(src).is_empty());
    }

    #[test]
    fn test_gate_lists_all_offenders() {
        let out = r#"import a from "react"; const b = import("lodash");"#;
        match check_no_bare_imports(out) {
            Err(PipelineError::UnresolvedImports(list)) => {
                assert_eq!(list, vec!["react".to_string(), "lodash".to_string()]);
            }
            other => panic!("expected UnresolvedImports, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bundle_rewrites_bare_imports_to_cdn_urls() {
        let dir = tempdir().unwrap();
        let resolver = ImportResolver::new("https://esm.sh", dir.path(), 0);
        seed_cache(dir.path(), "https://esm.sh/left-pad", b"export default p => p;").unwrap();

        let policy = ImportPolicy {
            allow_any: false,
            allow_list: ["left-pad".to_string()].into_iter().collect(),
            pin_map: Default::default(),
        };
        let src = r#"import pad from "left-pad"; export default () => pad("x");"#;
        let out = bundle(src, &BundleOptions::default(), &resolver, &policy)
            .await
            .unwrap();
        assert!(out.contains(r#"from "https://esm.sh/left-pad""#));
        assert!(check_no_bare_imports(&out).is_ok());
    }

    #[tokio::test]
    async fn test_disallowed_import_fails_and_names_the_package() {
        let dir = tempdir().unwrap();
        let resolver = ImportResolver::new("https://esm.sh", dir.path(), 0);
        seed_cache(dir.path(), "https://esm.sh/left-pad", b"export default 1;").unwrap();

        let policy = ImportPolicy {
            allow_any: false,
            allow_list: HashSet::from(["left-pad".to_string()]),
            pin_map: Default::default(),
        };
        let src = r#"
            import pad from "left-pad";
            import _ from "lodash";
        "#;
        match bundle(src, &BundleOptions::default(), &resolver, &policy).await {
            Err(PipelineError::NotAllowed(name)) => assert_eq!(name, "lodash"),
            other => panic!("expected NotAllowed(lodash), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_relative_imports_inline_as_data_urls() {
        let dir = tempdir().unwrap();
        let resolver = ImportResolver::new("https://esm.sh", dir.path(), 0);
        let policy = ImportPolicy::allow_any();
        let options = BundleOptions {
            virtual_modules: [(
                "./ui.js".to_string(),
                "export const Button = () => null;".to_string(),
            )]
            .into_iter()
            .collect(),
        };

        let src = r#"import { Button } from "./ui.js"; export default Button;"#;
        let out = bundle(src, &options, &resolver, &policy).await.unwrap();
        assert!(out.contains("data:text/javascript;base64,"));
        assert!(!out.contains("./ui.js"));
    }

    #[tokio::test]
    async fn test_unknown_local_module_is_an_error() {
        let dir = tempdir().unwrap();
        let resolver = ImportResolver::new("https://esm.sh", dir.path(), 0);
        let policy = ImportPolicy::allow_any();
        let src = r#"import x from "./missing.js";"#;
        match bundle(src, &BundleOptions::default(), &resolver, &policy).await {
            Err(PipelineError::UnknownLocalModule(m)) => assert_eq!(m, "./missing.js"),
            other => panic!("expected UnknownLocalModule, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bundling_is_idempotent() {
        let dir = tempdir().unwrap();
        let resolver = ImportResolver::new("https://esm.sh", dir.path(), 0);
        seed_cache(dir.path(), "https://esm.sh/react@18.2.0", b"export default {};").unwrap();

        let policy = ImportPolicy {
            allow_any: true,
            allow_list: Default::default(),
            pin_map: [("react".to_string(), "18.2.0".to_string())]
                .into_iter()
                .collect(),
        };
        let src = r#"import React from "react"; export default () => React;"#;
        let a = bundle(src, &BundleOptions::default(), &resolver, &policy)
            .await
            .unwrap();
        let b = bundle(src, &BundleOptions::default(), &resolver, &policy)
            .await
            .unwrap();
        assert_eq!(a, b);
    }
}
