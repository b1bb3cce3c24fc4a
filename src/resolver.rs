//! Import resolver: maps bare module specifiers to pinned, allow-listed CDN
//! URLs and caches the fetched bytes on disk.
//!
//! Security model:
//! - Relative, absolute and URL specifiers pass through unchanged
//! - A pin map entry always wins; otherwise, when unrestricted resolution is
//!   off, the package name must appear in the allow-list
//! - Fetched bytes are hashed and cached keyed by the canonical URL, so
//!   repeated builds get byte-identical content (reproducibility is a
//!   correctness requirement for review, not an optimization)

use crate::error::{PipelineError, Result};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How a specifier should be treated by the bundler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecifierKind {
    Relative,
    Absolute,
    Url,
    Bare,
}

/// Classify an import specifier. Everything that is not relative, absolute,
/// or already a URL is bare and must go through resolution.
pub fn classify(spec: &str) -> SpecifierKind {
    if spec.starts_with("./") || spec.starts_with("../") {
        SpecifierKind::Relative
    } else if spec.starts_with('/') {
        SpecifierKind::Absolute
    } else if spec.contains("://") || spec.starts_with("data:") || spec.starts_with("blob:") {
        SpecifierKind::Url
    } else {
        SpecifierKind::Bare
    }
}

/// Allow-list / pin configuration for one build invocation. Never mutated
/// during a build.
#[derive(Debug, Clone, Default)]
pub struct ImportPolicy {
    pub allow_any: bool,
    pub allow_list: HashSet<String>,
    /// Package name -> exact version or full URL.
    pub pin_map: HashMap<String, String>,
}

impl ImportPolicy {
    pub fn allow_any() -> Self {
        Self {
            allow_any: true,
            ..Default::default()
        }
    }
}

/// A bare specifier split into its parts.
///
/// `@scope/name@1.2.3/sub/path` -> name `@scope/name`, version `1.2.3`,
/// subpath `sub/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BareSpecifier {
    pub name: String,
    pub version: Option<String>,
    pub subpath: Option<String>,
}

impl BareSpecifier {
    pub fn parse(spec: &str) -> Option<Self> {
        if classify(spec) != SpecifierKind::Bare || spec.is_empty() {
            return None;
        }
        // Scoped packages keep their "@scope/name" head.
        let (head, rest) = if let Some(stripped) = spec.strip_prefix('@') {
            let slash = stripped.find('/')?;
            let after_scope = &stripped[slash + 1..];
            let end = after_scope
                .find(|c| c == '@' || c == '/')
                .map(|i| slash + 1 + i)
                .unwrap_or(stripped.len());
            (format!("@{}", &stripped[..end]), &stripped[end..])
        } else {
            let end = spec.find(|c| c == '@' || c == '/').unwrap_or(spec.len());
            (spec[..end].to_string(), &spec[end..])
        };

        let (version, subpath) = if let Some(rest) = rest.strip_prefix('@') {
            match rest.find('/') {
                Some(i) => (Some(rest[..i].to_string()), Some(rest[i + 1..].to_string())),
                None => (Some(rest.to_string()), None),
            }
        } else if let Some(rest) = rest.strip_prefix('/') {
            (None, Some(rest.to_string()))
        } else {
            (None, None)
        };

        Some(Self {
            name: head,
            version: version.filter(|v| !v.is_empty()),
            subpath: subpath.filter(|s| !s.is_empty()),
        })
    }
}

/// Outcome of resolving one specifier. Immutable after creation; cache
/// entries are shared read-only across concurrent builds.
#[derive(Debug, Clone)]
pub struct ResolvedImport {
    pub specifier: String,
    pub resolved_url: String,
    /// sha256 of the fetched bytes (empty for pass-through specifiers).
    pub content_hash: String,
    pub cached_path: Option<PathBuf>,
}

/// Resolver with an on-disk fetch cache keyed by canonical URL.
pub struct ImportResolver {
    cdn_base: String,
    cache_dir: PathBuf,
    client: reqwest::Client,
    max_retries: u32,
}

impl ImportResolver {
    pub fn new(cdn_base: impl Into<String>, cache_dir: impl Into<PathBuf>, max_retries: u32) -> Self {
        Self {
            cdn_base: cdn_base.into().trim_end_matches('/').to_string(),
            cache_dir: cache_dir.into(),
            client: reqwest::Client::new(),
            max_retries,
        }
    }

    /// Canonical fetch URL for a bare specifier under the given policy.
    ///
    /// Pin entries win regardless of `allow_any`; a pinned URL is used as-is,
    /// a pinned version replaces whatever version the specifier carried.
    pub fn canonical_url(&self, spec: &BareSpecifier, policy: &ImportPolicy) -> Result<String> {
        if let Some(pin) = policy.pin_map.get(&spec.name) {
            if pin.contains("://") {
                return Ok(pin.clone());
            }
            return Ok(self.format_url(&spec.name, Some(pin), spec.subpath.as_deref()));
        }
        if !policy.allow_any && !policy.allow_list.contains(&spec.name) {
            return Err(PipelineError::NotAllowed(spec.name.clone()));
        }
        Ok(self.format_url(&spec.name, spec.version.as_deref(), spec.subpath.as_deref()))
    }

    fn format_url(&self, name: &str, version: Option<&str>, subpath: Option<&str>) -> String {
        let mut url = format!("{}/{}", self.cdn_base, name);
        if let Some(v) = version {
            url.push('@');
            url.push_str(v);
        }
        if let Some(s) = subpath {
            url.push('/');
            url.push_str(s);
        }
        url
    }

    /// Resolve one specifier. Non-bare specifiers pass through unchanged.
    pub async fn resolve(&self, specifier: &str, policy: &ImportPolicy) -> Result<ResolvedImport> {
        if classify(specifier) != SpecifierKind::Bare {
            return Ok(ResolvedImport {
                specifier: specifier.to_string(),
                resolved_url: specifier.to_string(),
                content_hash: String::new(),
                cached_path: None,
            });
        }
        let parsed = BareSpecifier::parse(specifier)
            .ok_or_else(|| PipelineError::NotAllowed(specifier.to_string()))?;
        let url = self.canonical_url(&parsed, policy)?;
        let (hash, path) = self.fetch_cached(&url).await?;
        Ok(ResolvedImport {
            specifier: specifier.to_string(),
            resolved_url: url,
            content_hash: hash,
            cached_path: Some(path),
        })
    }

    /// Cache key: sha256 of the canonical URL, hex-encoded.
    fn cache_key(url: &str) -> String {
        hex(&Sha256::digest(url.as_bytes()))
    }

    fn cache_paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = Self::cache_key(url);
        (
            self.cache_dir.join(format!("{key}.js")),
            self.cache_dir.join(format!("{key}.json")),
        )
    }

    /// Return (content hash, cached path), fetching on a cache miss.
    ///
    /// Concurrent writers of the same key race onto identical bytes; the
    /// atomic rename makes last-writer-wins safe.
    async fn fetch_cached(&self, url: &str) -> Result<(String, PathBuf)> {
        let (content_path, meta_path) = self.cache_paths(url);
        if content_path.is_file() {
            if let Ok(meta) = crate::store::read_json::<CacheMeta>(&meta_path) {
                return Ok((meta.content_hash, content_path));
            }
            // Metadata lost; rehash the cached bytes rather than refetch.
            let bytes = std::fs::read(&content_path)?;
            let hash = hex(&Sha256::digest(&bytes));
            let _ = crate::store::write_json_atomic(
                &meta_path,
                &CacheMeta {
                    url: url.to_string(),
                    content_hash: hash.clone(),
                },
            );
            return Ok((hash, content_path));
        }

        let bytes = self.fetch_with_retry(url).await?;
        let hash = hex(&Sha256::digest(&bytes));
        crate::store::write_atomic(&content_path, &bytes)?;
        crate::store::write_json_atomic(
            &meta_path,
            &CacheMeta {
                url: url.to_string(),
                content_hash: hash.clone(),
            },
        )?;
        tracing::debug!(url, hash = %hash, "resolver: cached module");
        Ok((hash, content_path))
    }

    /// Idempotent fetch, retried a bounded number of times on transient
    /// failures. A non-2xx status or unreachable host is a hard error.
    async fn fetch_with_retry(&self, url: &str) -> Result<Vec<u8>> {
        let mut last_reason = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let bytes = resp
                            .bytes()
                            .await
                            .map_err(|e| PipelineError::Unreachable {
                                url: url.to_string(),
                                reason: e.to_string(),
                            })?;
                        return Ok(bytes.to_vec());
                    }
                    last_reason = format!("status {}", status.as_u16());
                    // Only 5xx is transient; 4xx will not get better.
                    if !status.is_server_error() {
                        break;
                    }
                }
                Err(e) => {
                    last_reason = e.to_string();
                    if !(e.is_connect() || e.is_timeout() || e.is_request()) {
                        break;
                    }
                }
            }
        }
        Err(PipelineError::Unreachable {
            url: url.to_string(),
            reason: last_reason,
        })
    }
}

/// Exponential backoff with a little jitter so concurrent builds do not
/// hammer the mirror in lockstep.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 200u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..100);
    Duration::from_millis(base + jitter)
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct CacheMeta {
    url: String,
    #[serde(rename = "contentHash")]
    content_hash: String,
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Pre-seed a cache entry (used by tests and offline mirrors).
pub fn seed_cache(cache_dir: &Path, url: &str, bytes: &[u8]) -> Result<PathBuf> {
    let key = {
        let digest = Sha256::digest(url.as_bytes());
        hex(&digest)
    };
    let content_path = cache_dir.join(format!("{key}.js"));
    let meta_path = cache_dir.join(format!("{key}.json"));
    crate::store::write_atomic(&content_path, bytes)?;
    crate::store::write_json_atomic(
        &meta_path,
        &CacheMeta {
            url: url.to_string(),
            content_hash: hex(&Sha256::digest(bytes)),
        },
    )?;
    Ok(content_path)
}
