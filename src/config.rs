//! Pipeline configuration.
//!
//! Loaded once at startup (or constructed directly in tests) and passed down
//! explicitly; nothing in the pipeline reads the environment after this.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the whole publish pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root directory for build artifacts (`<bundle_root>/builds/<id>/...`).
    pub bundle_root: PathBuf,
    /// On-disk cache for resolved CDN modules, shared across builds.
    pub cache_dir: PathBuf,
    /// CDN mirror base used to canonicalize bare specifiers.
    pub cdn_base: String,
    /// Resolve any bare specifier when true; otherwise enforce `allow_list`.
    pub allow_any: bool,
    /// Package names permitted when `allow_any` is false.
    pub allow_list: Vec<String>,
    /// Per-package pins (exact version or full URL), overriding resolution.
    pub pin_map: HashMap<String, String>,
    /// Bounded retry count for resolver fetches.
    pub fetch_retries: u32,
    /// Wall-clock budget for the entire install+build sequence.
    pub build_timeout: Duration,
    /// Container image used for container-mode builds.
    pub container_image: String,
    /// Whether the asynchronous build worker is configured.
    pub worker_enabled: bool,
    /// Per-owner listing quota, and the raised gold tier.
    pub max_apps_per_user: usize,
    pub gold_max_apps_per_user: usize,
    /// Retention window for archived listing versions.
    pub archive_ttl: Duration,
    /// Web app origin, added to frame-ancestors of served artifacts.
    pub web_base: Option<String>,
    /// Extra origins always permitted in connect-src (e.g. platform APIs).
    pub fixed_connect_origins: Vec<String>,
    /// Optional headless-render command for preview regeneration.
    /// `{url}` and `{out}` placeholders are substituted before spawning.
    pub preview_cmd: Option<Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bundle_root: PathBuf::from("./storage/bundles"),
            cache_dir: PathBuf::from("./storage/cdn-cache"),
            cdn_base: String::from("https://esm.sh"),
            allow_any: true,
            allow_list: Vec::new(),
            pin_map: HashMap::new(),
            fetch_retries: 3,
            build_timeout: Duration::from_secs(600),
            container_image: String::from("buildkit:node20"),
            worker_enabled: false,
            max_apps_per_user: 2,
            gold_max_apps_per_user: 10,
            archive_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            web_base: None,
            fixed_connect_origins: Vec::new(),
            preview_cmd: None,
        }
    }
}

impl PipelineConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("BUNDLE_STORAGE_PATH") {
            cfg.bundle_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CDN_CACHE_PATH") {
            cfg.cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CDN_BASE") {
            cfg.cdn_base = v;
        }
        // Liberal import policy by default; set ALLOW_ANY_NPM=0 to enforce the allow-list
        if let Ok(v) = std::env::var("ALLOW_ANY_NPM") {
            cfg.allow_any = v != "0";
        }
        if let Ok(v) = std::env::var("CDN_ALLOW") {
            cfg.allow_list = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(v) = std::env::var("CDN_PIN") {
            if let Ok(map) = serde_json::from_str::<HashMap<String, String>>(&v) {
                cfg.pin_map = map;
            }
        }
        if let Some(ms) = parse_env_u64("BUILD_TIMEOUT_MS") {
            cfg.build_timeout = Duration::from_millis(ms);
        }
        if let Ok(v) = std::env::var("CONTAINER_IMAGE") {
            cfg.container_image = v;
        }
        if let Ok(v) = std::env::var("BUILD_WORKER_ENABLED") {
            cfg.worker_enabled = v == "true" || v == "1";
        }
        if let Some(n) = parse_env_u64("MAX_APPS_PER_USER") {
            cfg.max_apps_per_user = n as usize;
        }
        if let Some(n) = parse_env_u64("GOLD_MAX_APPS_PER_USER") {
            cfg.gold_max_apps_per_user = n as usize;
        }
        if let Some(ms) = parse_env_u64("ARCHIVE_TTL_MS") {
            cfg.archive_ttl = Duration::from_millis(ms);
        }
        if let Ok(v) = std::env::var("WEB_BASE") {
            cfg.web_base = Some(v);
        }
        cfg
    }

    /// CDN base with any trailing slashes removed.
    pub fn cdn_base_trimmed(&self) -> &str {
        self.cdn_base.trim_end_matches('/')
    }
}

fn parse_env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_restrictive_enough() {
        let cfg = PipelineConfig::default();
        assert!(!cfg.worker_enabled);
        assert_eq!(cfg.max_apps_per_user, 2);
        assert_eq!(cfg.fetch_retries, 3);
    }

    #[test]
    fn test_cdn_base_trimming() {
        let cfg = PipelineConfig {
            cdn_base: "https://esm.sh///".into(),
            ..Default::default()
        };
        assert_eq!(cfg.cdn_base_trimmed(), "https://esm.sh");
    }
}
