use bytes::Bytes;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use pingora_http::ResponseHeader;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Instant, SystemTime};

/// Cached file entry
struct CachedFile {
    body: Bytes,
    mime: String,
    last_modified: String,
    cached_at: Instant,
}

/// Global file cache (canonical path -> cached entry)
static FILE_CACHE: Lazy<RwLock<HashMap<PathBuf, CachedFile>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Cache TTL — re-read the file after this duration
const CACHE_TTL_SECS: u64 = 5;

/// Result of serving a resolved file
pub struct StaticFileResponse {
    pub header: ResponseHeader,
    pub body: Bytes,
}

/// Serve a router-resolved file from disk with in-memory caching.
///
/// The router already chose the exact file; this layer only reads it.
/// - `base_root` bounds the read: a file that canonicalizes outside it is
///   refused (symlinked content escaping the web tree)
/// - MIME type comes from the file extension
/// - `status` is whatever the match decided (200 content, 404/500 when the
///   body is an error document)
/// - Returns 304 Not Modified on an `If-Modified-Since` hit, 200s only
/// - Returns None when the file does not exist or is out of bounds
pub fn serve_resolved_file(
    base_root: &Path,
    file: &Path,
    status: u16,
    if_modified_since: Option<&str>,
) -> Option<StaticFileResponse> {
    let canonical = file.canonicalize().ok()?;
    let base_canonical = base_root.canonicalize().ok()?;
    if !canonical.starts_with(&base_canonical) {
        log::warn!(
            "refusing {}: resolves outside {}",
            file.display(),
            base_root.display()
        );
        return None;
    }

    if !canonical.is_file() {
        return None;
    }

    // Try to serve from cache
    let now = Instant::now();
    {
        let cache = FILE_CACHE.read().unwrap();
        if let Some(cached) = cache.get(&canonical) {
            if now.duration_since(cached.cached_at).as_secs() < CACHE_TTL_SECS {
                if status == 200 {
                    if let Some(ims) = if_modified_since {
                        if ims == cached.last_modified {
                            return not_modified(&cached.last_modified);
                        }
                    }
                }
                return build_response(
                    status,
                    &cached.body,
                    &cached.mime,
                    &cached.last_modified,
                );
            }
        }
    }

    // Cache miss or stale — read from disk
    let metadata = std::fs::metadata(&canonical).ok()?;
    let modified: DateTime<Utc> = metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .into();
    let last_modified_str = modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

    if status == 200 {
        if let Some(ims) = if_modified_since {
            if ims == last_modified_str {
                return not_modified(&last_modified_str);
            }
        }
    }

    let body = Bytes::from(std::fs::read(&canonical).ok()?);
    let mime = mime_guess::from_path(&canonical)
        .first_or_octet_stream()
        .to_string();

    {
        let mut cache = FILE_CACHE.write().unwrap();
        cache.insert(
            canonical,
            CachedFile {
                body: body.clone(),
                mime: mime.clone(),
                last_modified: last_modified_str.clone(),
                cached_at: now,
            },
        );
    }

    build_response(status, &body, &mime, &last_modified_str)
}

fn not_modified(last_modified: &str) -> Option<StaticFileResponse> {
    let mut resp = ResponseHeader::build(304, Some(2)).ok()?;
    resp.insert_header(http::header::LAST_MODIFIED, last_modified)
        .ok()?;
    Some(StaticFileResponse {
        header: resp,
        body: Bytes::new(),
    })
}

fn build_response(
    status: u16,
    body: &Bytes,
    mime: &str,
    last_modified: &str,
) -> Option<StaticFileResponse> {
    let mut resp = ResponseHeader::build(status, Some(4)).ok()?;
    resp.insert_header(http::header::CONTENT_TYPE, mime).ok()?;
    resp.insert_header(http::header::CONTENT_LENGTH, body.len())
        .ok()?;
    resp.insert_header(http::header::LAST_MODIFIED, last_modified)
        .ok()?;

    Some(StaticFileResponse {
        header: resp,
        body: body.clone(),
    })
}
