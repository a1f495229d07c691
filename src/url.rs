use std::collections::BTreeMap;

/// Decoded request query.
///
/// A query that is a single JSON object document decodes structured;
/// anything else decodes as flat `k=v` pairs. Undecodable input degrades,
/// it never errors.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Query {
    #[default]
    Empty,
    Flat(BTreeMap<String, String>),
    Structured(serde_json::Value),
}

/// A raw URL normalized into the pieces the match pipeline works with.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedUrl {
    /// Lowercased, port stripped.
    pub hostname: String,
    /// Always begins with `/`.
    pub path: String,
    /// Directory part of the path, ending with `/`.
    pub basepath: String,
    /// Last segment when it carries an extension, otherwise empty (the
    /// path is then treated as a folder).
    pub filename: String,
    pub extension: String,
    pub query: Query,
}

/// Normalize a raw URL. Accepts both `scheme://host/path?q` and the
/// schemeless `host/path?q` form the proxy layer produces.
pub fn parse_url(raw: &str) -> ParsedUrl {
    let rest = match raw.split_once("://") {
        Some((_, rest)) => rest,
        None => raw,
    };

    let cut = rest.find(['/', '?']).unwrap_or(rest.len());
    let host_part = &rest[..cut];
    let tail = &rest[cut..];

    let (path, query_raw) = if tail.is_empty() {
        ("/", "")
    } else if let Some(stripped) = tail.strip_prefix('?') {
        ("/", stripped)
    } else {
        match tail.split_once('?') {
            Some((path, query)) => (path, query),
            None => (tail, ""),
        }
    };

    let path = path.to_string();
    let (basepath, filename, extension) = split_path(&path);

    ParsedUrl {
        hostname: normalize_host(host_part),
        path,
        basepath,
        filename,
        extension,
        query: parse_query(query_raw),
    }
}

/// Strip the port and lowercase. Bracketed IPv6 literals keep their colons.
fn normalize_host(host: &str) -> String {
    let bare = if let Some(stripped) = host.strip_prefix('[') {
        stripped.split(']').next().unwrap_or(stripped)
    } else {
        host.split(':').next().unwrap_or(host)
    };
    bare.to_ascii_lowercase()
}

/// Split a path into (basepath, filename, extension). The last segment is
/// only a file name when it carries a dot; otherwise the whole path is a
/// folder.
fn split_path(path: &str) -> (String, String, String) {
    let slash = path.rfind('/').unwrap_or(0);
    let last = &path[slash + 1..];

    if let Some(dot) = last.rfind('.') {
        let basepath = path[..=slash].to_string();
        let extension = last[dot + 1..].to_string();
        (basepath, last.to_string(), extension)
    } else {
        let basepath = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        };
        (basepath, String::new(), String::new())
    }
}

/// Best-effort structured-or-flat query decoding.
pub fn parse_query(raw: &str) -> Query {
    if raw.is_empty() {
        return Query::Empty;
    }

    let decoded = percent_decode(raw);
    let trimmed = decoded.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str(trimmed) {
            return Query::Structured(value);
        }
    }

    let mut map = BTreeMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(percent_decode(key), percent_decode(value));
    }
    Query::Flat(map)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
