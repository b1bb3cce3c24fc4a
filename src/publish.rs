//! Publish entry point: accepts one untrusted submission, runs the
//! synchronous pre-flight checks, seeds the build's artifact directory and
//! enqueues the build.
//!
//! Quota and dangerous-pattern rejections happen before a job id is created,
//! so they never consume a queue slot.

use crate::error::Result;
use crate::guard;
use crate::listing::{now_ms, Capabilities, Listing, ListingStore};
use crate::orchestrator::{BuildPayload, BuildRequest, Orchestrator};
use crate::store::{write_atomic, write_json_atomic, MANIFEST_FILE, POLICY_FILE, SOURCE_FILE};
use crate::policy::Manifest;
use crate::bundler::BundleOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{info, warn};

/// One publish submission.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    /// Existing listing to update, by id or slug; absent for a new listing.
    #[serde(default)]
    pub listing: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    pub inline_code: String,
    #[serde(default)]
    pub visibility: Option<String>,
}

/// Accepted response: the build itself is asynchronous.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishOutcome {
    pub build_id: String,
    pub listing_id: String,
    pub slug: String,
}

/// Accept one submission for `owner_uid` and enqueue its build.
///
/// Returns `QUEUE_DISABLED` when no asynchronous backend is configured; the
/// caller should then use [`Orchestrator::run_now`] with the same request.
pub async fn publish(
    orchestrator: &Orchestrator,
    listings: &ListingStore,
    owner_uid: &str,
    gold: bool,
    request: PublishRequest,
) -> Result<PublishOutcome> {
    let (build_request, outcome) =
        accept(orchestrator, listings, owner_uid, gold, request)?;
    orchestrator.enqueue(build_request).await?;
    info!(
        build_id = %outcome.build_id,
        listing_id = %outcome.listing_id,
        slug = %outcome.slug,
        "publish:created"
    );
    Ok(outcome)
}

/// Pre-flight checks plus artifact/listing setup, without touching the
/// queue. Returns the build request so the caller can pick the
/// asynchronous or synchronous path.
pub fn accept(
    orchestrator: &Orchestrator,
    listings: &ListingStore,
    owner_uid: &str,
    gold: bool,
    request: PublishRequest,
) -> Result<(BuildRequest, PublishOutcome)> {
    let config = orchestrator.config();
    let now = now_ms();

    // Dangerous constructs are rejected before any state is created.
    guard::check_source(&request.inline_code)?;

    let all = listings.read_all(now)?;
    let existing = request.listing.as_deref().and_then(|key| {
        all.iter()
            .find(|l| (l.id == key || l.slug == key) && l.owner_uid == owner_uid)
            .cloned()
    });
    if existing.is_none() {
        let owned = all.iter().filter(|l| l.owner_uid == owner_uid).count();
        guard::check_app_quota(owned, gold, config)?;
    }

    let build_id = uuid::Uuid::new_v4().to_string();
    let build_dir = orchestrator.store().ensure_build_dir(&build_id)?;

    // Inputs and policy artifacts are written up front; the manifest is
    // immutable once the build reaches a terminal success state.
    write_atomic(&build_dir.join(SOURCE_FILE), request.inline_code.as_bytes())?;
    write_json_atomic(
        &build_dir.join(MANIFEST_FILE),
        &Manifest {
            network_policy: request.capabilities.network_policy,
            network_domains: request.capabilities.network_domains.clone(),
        },
    )?;
    write_json_atomic(&build_dir.join(POLICY_FILE), &request.capabilities.permissions)?;

    let listing = match existing {
        Some(mut listing) => {
            listing.title = request.title.clone();
            listing.description = request.description.clone();
            if let Some(v) = &request.visibility {
                listing.visibility = v.clone();
            }
            listing.capabilities = request.capabilities.clone();
            listing.pending_build_id = Some(build_id.clone());
            listing.updated_at = now;
            listing
        }
        None => {
            let id = listings.next_id(now)?;
            let slug = listings.unique_slug(&request.title, &format!("app-{id}"), now)?;
            Listing {
                id,
                slug,
                owner_uid: owner_uid.to_string(),
                title: request.title.clone(),
                description: request.description.clone(),
                visibility: request.visibility.clone().unwrap_or_else(|| "public".into()),
                capabilities: request.capabilities.clone(),
                build_id: None,
                pending_build_id: Some(build_id.clone()),
                version: 0,
                archived_versions: Vec::new(),
                created_at: now,
                updated_at: now,
            }
        }
    };
    listings.upsert(listing.clone(), now)?;

    let outcome = PublishOutcome {
        build_id: build_id.clone(),
        listing_id: listing.id,
        slug: listing.slug,
    };
    let build_request = BuildRequest {
        build_id,
        payload: BuildPayload::Inline {
            source: request.inline_code,
            options: BundleOptions::default(),
        },
    };
    Ok((build_request, outcome))
}

// ============================================================================
// Rate limiting
// ============================================================================

/// Per-key publish rate limiter backed by one JSON map on disk.
///
/// A store failure degrades to "not rate limited" - availability of the
/// build path is prioritised over rate-limit strictness.
pub struct RateLimiter {
    path: PathBuf,
    lock: std::sync::Mutex<()>,
}

impl RateLimiter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: std::sync::Mutex::new(()),
        }
    }

    /// True when `key` fired within the last `ttl_ms`; otherwise records the
    /// new timestamp and returns false.
    pub fn is_rate_limited(&self, key: &str, ttl_ms: u64, now: u64) -> bool {
        let _guard = self.lock.lock().expect("rate limiter lock poisoned");
        let mut map: HashMap<String, u64> = if self.path.is_file() {
            match crate::store::read_json(&self.path) {
                Ok(map) => map,
                Err(err) => {
                    warn!(%err, "rate limit store unreadable, allowing request");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        let last = map.get(key).copied().unwrap_or(0);
        if now.saturating_sub(last) < ttl_ms {
            return true;
        }
        map.insert(key.to_string(), now);
        if let Err(err) = write_json_atomic(&self.path, &map) {
            warn!(%err, "rate limit store write failed, allowing request");
        }
        false
    }
}
