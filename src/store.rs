use crate::config::CONFIG_FILE;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

/// One project document as read from disk, before validation.
#[derive(Debug, Clone)]
pub struct RawProject {
    /// Folder-derived project name.
    pub name: String,
    pub config: Value,
    pub last_modified: SystemTime,
}

/// Observed (project → config mtime) state, the input to change detection.
pub type Listing = BTreeMap<String, SystemTime>;

/// Projects added, changed, or removed between two listings.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StoreChanges {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

impl StoreChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// Read every `{root}/*/config.json` into a raw project document.
///
/// A document that fails to parse is logged and skipped; one broken tenant
/// must not take down the read of the others.
pub fn list_projects(root: &Path) -> Vec<RawProject> {
    let pattern = format!("{}/*/{}", root.display(), CONFIG_FILE);
    let mut projects = Vec::new();

    let entries = match glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(e) => {
            log::error!("bad web-source pattern {}: {}", pattern, e);
            return projects;
        }
    };

    for entry in entries {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                log::error!("glob error under {}: {}", root.display(), e);
                continue;
            }
        };

        let name = match path.parent().and_then(|p| p.file_name()) {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                log::error!("failed to read {}: {}", path.display(), e);
                continue;
            }
        };

        let config = match serde_json::from_str::<Value>(&content) {
            Ok(config) => config,
            Err(e) => {
                log::error!("skipping project '{}', invalid JSON: {}", name, e);
                continue;
            }
        };

        let last_modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        projects.push(RawProject {
            name,
            config,
            last_modified,
        });
    }

    projects
}

/// Listing snapshot of a raw read, for later diffing.
pub fn listing_of(projects: &[RawProject]) -> Listing {
    projects
        .iter()
        .map(|p| (p.name.clone(), p.last_modified))
        .collect()
}

/// Stat-only listing, cheap enough for the poll loop: no documents are
/// read or parsed.
pub fn scan_listing(root: &Path) -> Listing {
    let pattern = format!("{}/*/{}", root.display(), CONFIG_FILE);
    let mut listing = Listing::new();

    let entries = match glob::glob(&pattern) {
        Ok(entries) => entries,
        Err(_) => return listing,
    };

    for path in entries.flatten() {
        let name = match path.parent().and_then(|p| p.file_name()) {
            Some(name) => name.to_string_lossy().into_owned(),
            None => continue,
        };
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        listing.insert(name, modified);
    }

    listing
}

/// Classify what changed between two listings. Drives the incremental
/// refresh trigger; a full rebuild does not need it.
pub fn diff_listing(previous: &Listing, current: &Listing) -> StoreChanges {
    let mut changes = StoreChanges::default();

    for (name, modified) in current {
        match previous.get(name) {
            None => changes.added.push(name.clone()),
            Some(prev) if prev != modified => changes.changed.push(name.clone()),
            Some(_) => {}
        }
    }

    for name in previous.keys() {
        if !current.contains_key(name) {
            changes.removed.push(name.clone());
        }
    }

    changes
}
