//! Policy deriver: computes Content-Security-Policy and Permissions-Policy
//! headers for a build from its on-disk manifest and policy artifacts.
//!
//! Pure function of the artifact files; missing or malformed artifacts fall
//! back to the most restrictive defaults (same-origin only, every optional
//! permission denied). Computed on every serve request - the reads are cheap
//! and build artifacts are immutable once published.

use crate::config::PipelineConfig;
use crate::store::{ArtifactStore, MANIFEST_FILE, POLICY_FILE};
use serde::{Deserialize, Serialize};
use url::Url;

/// Network egress tier declared by a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NetworkPolicy {
    #[default]
    #[serde(rename = "NO_NET")]
    NoNet,
    #[serde(rename = "MEDIA_ONLY")]
    MediaOnly,
    #[serde(rename = "OPEN_NET")]
    OpenNet,
}

/// Build manifest: network tier plus the declared egress domains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    pub network_policy: NetworkPolicy,
    pub network_domains: Vec<String>,
}

/// Opt-in browser permissions; everything defaults to denied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionsPolicy {
    pub camera: bool,
    pub microphone: bool,
    pub geolocation: bool,
    pub clipboard_read: bool,
    pub clipboard_write: bool,
}

/// Derived security headers attached when serving a build's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityHeaders {
    pub csp: String,
    pub permissions_policy: String,
    pub referrer_policy: &'static str,
}

/// Derive headers for one build id from its artifacts on disk.
pub fn derive_headers(store: &ArtifactStore, config: &PipelineConfig, build_id: &str) -> SecurityHeaders {
    let manifest: Manifest = store
        .artifact_path(build_id, MANIFEST_FILE)
        .ok()
        .and_then(|p| crate::store::read_json(&p).ok())
        .unwrap_or_default();
    let permissions: PermissionsPolicy = store
        .artifact_path(build_id, POLICY_FILE)
        .ok()
        .and_then(|p| crate::store::read_json(&p).ok())
        .unwrap_or_default();
    build_headers(&manifest, &permissions, config)
}

/// Header computation, separated for direct testing.
pub fn build_headers(
    manifest: &Manifest,
    permissions: &PermissionsPolicy,
    config: &PipelineConfig,
) -> SecurityHeaders {
    let cdn_origin = origin_of(config.cdn_base_trimmed());

    // Bundles reference pinned CDN URLs at runtime, so scripts may load from
    // the mirror origin in every tier.
    let mut script_src = String::from("'self'");
    if let Some(origin) = &cdn_origin {
        script_src.push(' ');
        script_src.push_str(origin);
    }

    let media_open = matches!(
        manifest.network_policy,
        NetworkPolicy::MediaOnly | NetworkPolicy::OpenNet
    );
    let img_src = if media_open { "* data: blob:" } else { "'self' data: blob:" };
    let media_src = if media_open { "* blob:" } else { "'self' blob:" };

    let mut connect_parts = vec!["'self'".to_string()];
    for fixed in &config.fixed_connect_origins {
        connect_parts.push(fixed.clone());
    }
    if manifest.network_policy == NetworkPolicy::OpenNet {
        if manifest.network_domains.is_empty() {
            // Open tier with no declared list: broad-but-https fallback.
            connect_parts.push("https:".to_string());
        } else {
            for domain in &manifest.network_domains {
                if let Some(origin) = domain_origin(domain) {
                    connect_parts.push(origin);
                }
            }
        }
    }

    let mut frame_ancestors = vec!["'self'".to_string()];
    if let Some(web_base) = &config.web_base {
        if let Some(origin) = origin_of(web_base) {
            if !frame_ancestors.contains(&origin) {
                frame_ancestors.push(origin);
            }
        }
    }

    let csp = [
        "default-src 'self'".to_string(),
        format!("script-src {script_src}"),
        "style-src 'self'".to_string(),
        format!("img-src {img_src}"),
        format!("media-src {media_src}"),
        format!("connect-src {}", connect_parts.join(" ")),
        "base-uri 'none'".to_string(),
        "object-src 'none'".to_string(),
        format!("frame-ancestors {}", frame_ancestors.join(" ")),
    ]
    .join("; ");

    let grant = |on: bool| if on { "(self)" } else { "()" };
    let permissions_policy = [
        format!("camera={}", grant(permissions.camera)),
        format!("microphone={}", grant(permissions.microphone)),
        format!("geolocation={}", grant(permissions.geolocation)),
        format!("clipboard-read={}", grant(permissions.clipboard_read)),
        format!("clipboard-write={}", grant(permissions.clipboard_write)),
        "fullscreen=(self)".to_string(),
    ]
    .join(", ");

    SecurityHeaders {
        csp,
        permissions_policy,
        referrer_policy: "no-referrer",
    }
}

fn origin_of(base: &str) -> Option<String> {
    Url::parse(base).ok().map(|u| u.origin().ascii_serialization())
}

/// Origin of a declared egress domain; a bare hostname is assumed https.
fn domain_origin(domain: &str) -> Option<String> {
    let with_scheme = if domain.contains("://") {
        domain.to_string()
    } else {
        format!("https://{domain}")
    };
    origin_of(&with_scheme)
}
