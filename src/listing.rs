//! Version lifecycle: the mapping from a logical listing to its current
//! build id plus a bounded history of archived builds.
//!
//! - Publish/attach archives the previous build before swapping in the new id
//! - Archived entries older than the retention TTL are dropped lazily on
//!   every read (no background sweep)
//! - Promote moves an archived build back to current, archiving the build it
//!   replaces; preview regeneration for the promoted build is best-effort
//!
//! Invariant: the currently-referenced build id never appears in
//! `archivedVersions`.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::policy::{NetworkPolicy, PermissionsPolicy};
use crate::store::{read_json, write_json_atomic, ArtifactStore, ENTRY_HTML, PREVIEW_PNG};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// A previously-current build retained for the rollback window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedVersion {
    pub build_id: String,
    pub version: u32,
    pub archived_at: u64,
}

/// Capabilities declared at publish time; they become the build's manifest
/// and permissions-policy artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
    pub permissions: PermissionsPolicy,
    pub network_policy: NetworkPolicy,
    pub network_domains: Vec<String>,
}

/// One published application listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    pub slug: String,
    pub owner_uid: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub visibility: String,
    #[serde(default)]
    pub capabilities: Capabilities,
    /// Current live build, if any version has been approved yet.
    #[serde(default)]
    pub build_id: Option<String>,
    /// Accepted-but-not-yet-approved build.
    #[serde(default)]
    pub pending_build_id: Option<String>,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub archived_versions: Vec<ArchivedVersion>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// File-backed listing store with lazy TTL pruning.
///
/// All mutation happens under one lock as read-modify-write against the
/// whole file; writes are atomic (temp + rename).
pub struct ListingStore {
    path: PathBuf,
    ttl: Duration,
    lock: Mutex<()>,
}

impl ListingStore {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl,
            lock: Mutex::new(()),
        }
    }

    /// Read every listing, dropping expired archive entries; the file is
    /// persisted back when anything was pruned.
    pub fn read_all(&self, now: u64) -> Result<Vec<Listing>> {
        let _guard = self.lock.lock().expect("listing store lock poisoned");
        self.read_all_locked(now)
    }

    fn read_all_locked(&self, now: u64) -> Result<Vec<Listing>> {
        let mut listings: Vec<Listing> = if self.path.is_file() {
            read_json(&self.path)?
        } else {
            Vec::new()
        };
        let expiry = now.saturating_sub(self.ttl.as_millis() as u64);
        let mut changed = false;
        for listing in &mut listings {
            let before = listing.archived_versions.len();
            listing.archived_versions.retain(|v| v.archived_at >= expiry);
            changed |= listing.archived_versions.len() != before;
        }
        if changed {
            write_json_atomic(&self.path, &listings)?;
        }
        Ok(listings)
    }

    fn save_locked(&self, listings: &[Listing]) -> Result<()> {
        write_json_atomic(&self.path, &listings)
    }

    /// Find one listing by id or slug.
    pub fn get(&self, id_or_slug: &str, now: u64) -> Result<Option<Listing>> {
        Ok(self
            .read_all(now)?
            .into_iter()
            .find(|l| l.id == id_or_slug || l.slug == id_or_slug))
    }

    /// Find the listing that references a build id (current or pending).
    pub fn get_by_build_id(&self, build_id: &str, now: u64) -> Result<Option<Listing>> {
        Ok(self.read_all(now)?.into_iter().find(|l| {
            l.build_id.as_deref() == Some(build_id)
                || l.pending_build_id.as_deref() == Some(build_id)
        }))
    }

    /// Insert or replace one listing by id.
    pub fn upsert(&self, listing: Listing, now: u64) -> Result<()> {
        let _guard = self.lock.lock().expect("listing store lock poisoned");
        let mut listings = self.read_all_locked(now)?;
        match listings.iter_mut().find(|l| l.id == listing.id) {
            Some(slot) => *slot = listing,
            None => listings.push(listing),
        }
        self.save_locked(&listings)
    }

    /// Next numeric listing id.
    pub fn next_id(&self, now: u64) -> Result<String> {
        let max = self
            .read_all(now)?
            .iter()
            .filter_map(|l| l.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok((max + 1).to_string())
    }

    /// Slug for a new listing: slugified title, suffixed until unique.
    pub fn unique_slug(&self, title: &str, fallback: &str, now: u64) -> Result<String> {
        let listings = self.read_all(now)?;
        let base = {
            let s = slugify(title);
            if s.is_empty() {
                fallback.to_string()
            } else {
                s
            }
        };
        let mut slug = base.clone();
        let mut counter = 1;
        while listings.iter().any(|l| l.slug == slug) {
            slug = format!("{base}-{counter}");
            counter += 1;
        }
        Ok(slug)
    }

    /// Attach an approved build as the listing's current version.
    ///
    /// Assigns the next version number and archives the previous build (if
    /// any) before the swap.
    pub fn attach_build(&self, listing_id: &str, build_id: &str, now: u64) -> Result<Listing> {
        let _guard = self.lock.lock().expect("listing store lock poisoned");
        let mut listings = self.read_all_locked(now)?;
        let listing = listings
            .iter_mut()
            .find(|l| l.id == listing_id || l.slug == listing_id)
            .ok_or_else(|| PipelineError::NotFound(format!("listing {listing_id}")))?;

        if let Some(previous) = listing.build_id.take() {
            if previous != build_id {
                listing.archived_versions.push(ArchivedVersion {
                    build_id: previous,
                    version: listing.version,
                    archived_at: now,
                });
            }
        }
        // The current build id must never also sit in the archive.
        listing.archived_versions.retain(|v| v.build_id != build_id);
        listing.version += 1;
        listing.build_id = Some(build_id.to_string());
        if listing.pending_build_id.as_deref() == Some(build_id) {
            listing.pending_build_id = None;
        }
        listing.updated_at = now;
        let updated = listing.clone();
        self.save_locked(&listings)?;
        Ok(updated)
    }

    /// Promote an archived build back to current. Owner-only.
    pub fn promote(
        &self,
        listing_id: &str,
        archived_build_id: &str,
        caller_uid: &str,
        now: u64,
    ) -> Result<Listing> {
        let _guard = self.lock.lock().expect("listing store lock poisoned");
        let mut listings = self.read_all_locked(now)?;
        let listing = listings
            .iter_mut()
            .find(|l| l.id == listing_id || l.slug == listing_id)
            .ok_or_else(|| PipelineError::NotFound(format!("listing {listing_id}")))?;
        if listing.owner_uid != caller_uid {
            return Err(PipelineError::Forbidden);
        }
        let idx = listing
            .archived_versions
            .iter()
            .position(|v| v.build_id == archived_build_id)
            .ok_or_else(|| PipelineError::NotFound(format!("archived build {archived_build_id}")))?;

        let selected = listing.archived_versions.remove(idx);
        if let Some(previous) = listing.build_id.take() {
            listing.archived_versions.push(ArchivedVersion {
                build_id: previous,
                version: listing.version,
                archived_at: now,
            });
        }
        listing.build_id = Some(selected.build_id);
        listing.version = selected.version;
        listing.updated_at = now;
        let updated = listing.clone();
        self.save_locked(&listings)?;
        Ok(updated)
    }
}

/// Lowercase alphanumeric-dash slug, capped at 80 chars.
pub fn slugify(input: &str) -> String {
    let mut out = String::new();
    let mut pending_dash = false;
    for c in input.trim().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out.truncate(80);
    out
}

/// Promote an archived build and regenerate its preview if missing.
///
/// The preview side effect is best-effort; the promotion has already been
/// persisted when it runs.
pub async fn promote_with_preview(
    listings: &ListingStore,
    artifacts: &ArtifactStore,
    config: &PipelineConfig,
    listing_id: &str,
    archived_build_id: &str,
    caller_uid: &str,
    now: u64,
) -> Result<Listing> {
    let listing = listings.promote(listing_id, archived_build_id, caller_uid, now)?;
    ensure_preview(config, artifacts, archived_build_id).await;
    Ok(listing)
}

/// Best-effort preview regeneration for a promoted build: spawn the
/// configured headless-render command when the preview image is missing.
/// Failure is logged, never propagated - promotion already succeeded.
pub async fn ensure_preview(config: &PipelineConfig, store: &ArtifactStore, build_id: &str) {
    let Ok(dir) = store.build_dir(build_id) else {
        return;
    };
    let out_png = dir.join(PREVIEW_PNG);
    if out_png.exists() {
        return;
    }
    let Some(cmd) = &config.preview_cmd else {
        return;
    };
    if cmd.is_empty() {
        return;
    }
    let entry = dir.join(ENTRY_HTML);
    let url = format!("file://{}", entry.display());
    let args: Vec<String> = cmd[1..]
        .iter()
        .map(|a| {
            a.replace("{url}", &url)
                .replace("{out}", &out_png.display().to_string())
        })
        .collect();
    match tokio::process::Command::new(&cmd[0])
        .args(&args)
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(build_id, %status, "preview regeneration failed"),
        Err(err) => warn!(build_id, %err, "preview regeneration could not start"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    fn store(dir: &std::path::Path) -> ListingStore {
        ListingStore::new(dir.join("listings.json"), Duration::from_secs(30 * 24 * 60 * 60))
    }

    fn listing(id: &str, owner: &str, now: u64) -> Listing {
        Listing {
            id: id.into(),
            slug: format!("app-{id}"),
            owner_uid: owner.into(),
            title: format!("App {id}"),
            description: String::new(),
            visibility: "public".into(),
            capabilities: Capabilities::default(),
            build_id: None,
            pending_build_id: None,
            version: 0,
            archived_versions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("My Cool App!"), "my-cool-app");
        assert_eq!(slugify("  --Đ--  "), "");
        assert_eq!(slugify("a_b c"), "a-b-c");
    }

    #[test]
    fn test_unique_slug_appends_counter() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let now = 1_000;
        let mut l = listing("1", "u1", now);
        l.slug = "my-app".into();
        s.upsert(l, now).unwrap();

        assert_eq!(s.unique_slug("My App", "app-2", now).unwrap(), "my-app-1");
        assert_eq!(s.unique_slug("", "app-2", now).unwrap(), "app-2");
    }

    #[test]
    fn test_attach_archives_previous_and_bumps_version() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let now = 1_000;
        s.upsert(listing("1", "u1", now), now).unwrap();

        let l = s.attach_build("1", "build-a", now).unwrap();
        assert_eq!(l.build_id.as_deref(), Some("build-a"));
        assert_eq!(l.version, 1);
        assert!(l.archived_versions.is_empty());

        let l = s.attach_build("1", "build-b", now + 1).unwrap();
        assert_eq!(l.build_id.as_deref(), Some("build-b"));
        assert_eq!(l.version, 2);
        assert_eq!(l.archived_versions.len(), 1);
        assert_eq!(l.archived_versions[0].build_id, "build-a");
        assert_eq!(l.archived_versions[0].version, 1);
    }

    #[test]
    fn test_current_build_never_in_archive() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let now = 1_000;
        s.upsert(listing("1", "u1", now), now).unwrap();
        s.attach_build("1", "build-a", now).unwrap();
        s.attach_build("1", "build-b", now).unwrap();
        // Re-attach an archived build id directly.
        let l = s.attach_build("1", "build-a", now).unwrap();
        assert_eq!(l.build_id.as_deref(), Some("build-a"));
        assert!(l.archived_versions.iter().all(|v| v.build_id != "build-a"));
    }

    #[test]
    fn test_ttl_prunes_on_read() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let now = 100 * DAY_MS;
        let mut l = listing("1", "u1", now);
        l.build_id = Some("current".into());
        l.version = 3;
        l.archived_versions = vec![
            ArchivedVersion {
                build_id: "old".into(),
                version: 1,
                archived_at: now - 31 * DAY_MS,
            },
            ArchivedVersion {
                build_id: "recent".into(),
                version: 2,
                archived_at: now - DAY_MS,
            },
        ];
        s.upsert(l, now - 31 * DAY_MS).unwrap();

        let all = s.read_all(now).unwrap();
        assert_eq!(all[0].archived_versions.len(), 1);
        assert_eq!(all[0].archived_versions[0].build_id, "recent");

        // Pruned state was persisted, so a later read is stable.
        let again = s.read_all(now).unwrap();
        assert_eq!(again[0].archived_versions.len(), 1);
    }

    #[test]
    fn test_promote_swaps_current_and_archived() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let now = 1_000;
        let mut l = listing("1", "u1", now);
        l.build_id = Some("build-v3".into());
        l.version = 3;
        l.archived_versions = vec![ArchivedVersion {
            build_id: "build-v2".into(),
            version: 2,
            archived_at: now - 10,
        }];
        s.upsert(l, now).unwrap();

        let updated = s.promote("1", "build-v2", "u1", now).unwrap();
        assert_eq!(updated.build_id.as_deref(), Some("build-v2"));
        assert_eq!(updated.version, 2);
        let archived: Vec<_> = updated
            .archived_versions
            .iter()
            .map(|v| (v.build_id.as_str(), v.version))
            .collect();
        assert_eq!(archived, vec![("build-v3", 3)]);
    }

    #[test]
    fn test_promote_requires_owner() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let now = 1_000;
        let mut l = listing("1", "u1", now);
        l.archived_versions = vec![ArchivedVersion {
            build_id: "b".into(),
            version: 1,
            archived_at: now,
        }];
        s.upsert(l, now).unwrap();

        match s.promote("1", "b", "intruder", now) {
            Err(PipelineError::Forbidden) => {}
            other => panic!("expected Forbidden, got {other:?}"),
        }
    }

    #[test]
    fn test_promote_unknown_archive_entry_is_not_found() {
        let dir = tempdir().unwrap();
        let s = store(dir.path());
        let now = 1_000;
        s.upsert(listing("1", "u1", now), now).unwrap();
        assert!(matches!(
            s.promote("1", "ghost", "u1", now),
            Err(PipelineError::NotFound(_))
        ));
    }
}
