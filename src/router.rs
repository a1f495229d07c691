use crate::config::MGMT_NAME;
use crate::content;
use crate::index::RoutingSnapshot;
use crate::url::{parse_url, ParsedUrl};
use std::path::PathBuf;

/// Which index resolved the request in stage 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    None,
    MgmtHost,
    VhostPath,
    ProxyPath,
    DnsName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Client,
    Server,
}

/// Content rule that produced the resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    None,
    ApiFixed,
    ApiDynamic,
    StaticServerExec,
    Static,
    SystemAsset,
    ErrorPage,
    MaintenancePage,
}

impl RuleType {
    pub fn is_api(self) -> bool {
        matches!(self, RuleType::ApiFixed | RuleType::ApiDynamic)
    }
}

/// Working record threaded through the match pipeline. Created fresh per
/// request and discarded once the response is produced.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// True once a project/website pair (stage 1) and a content rule
    /// (stage 2) have both resolved.
    pub state: bool,
    pub project: String,
    pub website: String,
    pub matched_by: MatchedBy,
    /// Arrived through an admin vhost preview path.
    pub preview: bool,
    /// Portion of the request path consumed by stage 1 (vhost/proxy
    /// prefix plus any sub-map hop).
    pub uri_prefix: String,
    /// Website-relative remainder, single leading slash.
    pub uri_suffix: String,
    /// Directory of the chosen file.
    pub file_path: PathBuf,
    pub file_name: String,
    pub execution: Execution,
    pub rule: RuleType,
    pub status: u16,
    /// Set when the resolution ended in the fatal missing-system-asset
    /// branch.
    pub error: bool,
    /// Human-readable decision log, consumed by the admin simulate-URL
    /// feature.
    pub trace: Vec<String>,
    pub url: ParsedUrl,
}

impl MatchResult {
    pub(crate) fn new(url: ParsedUrl) -> Self {
        MatchResult {
            state: false,
            project: String::new(),
            website: String::new(),
            matched_by: MatchedBy::None,
            preview: false,
            uri_prefix: String::new(),
            uri_suffix: String::new(),
            file_path: PathBuf::new(),
            file_name: String::new(),
            execution: Execution::Client,
            rule: RuleType::None,
            status: 0,
            error: false,
            trace: Vec::new(),
            url,
        }
    }

    pub fn note(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        log::debug!("match: {}", msg);
        self.trace.push(msg);
    }

    pub fn full_path(&self) -> PathBuf {
        self.file_path.join(&self.file_name)
    }

    pub fn trace_text(&self) -> String {
        self.trace.join("\n")
    }
}

/// Resolve a raw URL against a snapshot: stage 1 (who owns the request)
/// then stage 2 (which content answers it). Total: always returns a
/// MatchResult, absence is data.
pub fn match_url(snapshot: &RoutingSnapshot, raw_url: &str) -> MatchResult {
    let url = parse_url(raw_url);
    let mut result = MatchResult::new(url);
    result.note(format!(
        "match {}{} env={}",
        result.url.hostname,
        result.url.path,
        snapshot.environment.as_str()
    ));
    resolve_site(snapshot, &mut result);
    content::resolve_content(snapshot, &mut result);
    result
}

/// Stage 1: ordered host/path checks, first success wins.
fn resolve_site(snapshot: &RoutingSnapshot, m: &mut MatchResult) {
    // 1. Management UI hostname, with optional vhost preview override.
    if let Some(mgmt) = &snapshot.mgmt {
        if mgmt.hostnames.contains(&m.url.hostname) {
            m.state = true;
            m.matched_by = MatchedBy::MgmtHost;
            m.project = MGMT_NAME.to_string();
            m.website = MGMT_NAME.to_string();
            m.note(format!("hostname '{}' is a management UI host", m.url.hostname));

            for entry in &mgmt.vhost_paths {
                if m.url.path.starts_with(&entry.pattern) {
                    m.matched_by = MatchedBy::VhostPath;
                    m.preview = true;
                    m.project = entry.target.project.clone();
                    m.website = entry.target.website.clone();
                    m.uri_prefix = entry.pattern.clone();
                    m.note(format!(
                        "vhost preview '{}' selects {}/{}",
                        entry.pattern, m.project, m.website
                    ));
                    break;
                }
            }
        }
    }

    // 2. Proxy path prefix over hostname+path.
    if !m.state {
        let host_path = format!("{}{}", m.url.hostname, m.url.path);
        for entry in &snapshot.proxy_index {
            if !host_path.starts_with(&entry.pattern) {
                continue;
            }
            if resolvable(snapshot, &entry.target.project, &entry.target.website) {
                m.state = true;
                m.matched_by = MatchedBy::ProxyPath;
                m.project = entry.target.project.clone();
                m.website = entry.target.website.clone();
                m.uri_prefix = path_part(&entry.pattern).to_string();
                m.note(format!(
                    "proxy pattern '{}' selects {}/{}",
                    entry.pattern, m.project, m.website
                ));
            } else {
                // An explicitly-unmapped entry must fall through to the
                // next stage, not dead-end the request.
                m.note(format!(
                    "proxy pattern '{}' is present but unresolved",
                    entry.pattern
                ));
            }
            // The longest matching prefix decides this stage either way.
            break;
        }
    }

    // 3. DNS name, exact hostname match.
    if !m.state {
        for entry in &snapshot.dns_index {
            if entry.pattern != m.url.hostname {
                continue;
            }
            if resolvable(snapshot, &entry.target.project, &entry.target.website) {
                m.state = true;
                m.matched_by = MatchedBy::DnsName;
                m.project = entry.target.project.clone();
                m.website = entry.target.website.clone();
                m.note(format!(
                    "dns name '{}' selects {}/{}",
                    entry.pattern, m.project, m.website
                ));
            } else {
                m.note(format!(
                    "dns name '{}' is present but unresolved",
                    entry.pattern
                ));
            }
            break;
        }
    }

    if !m.state {
        if m.matched_by == MatchedBy::None {
            m.note("no index matched; falling to system handling");
        }
        return;
    }

    // 4. Sub-map hop within the project, real projects only.
    if m.project != MGMT_NAME {
        apply_sub_map(snapshot, m);
    }
}

/// A target is resolvable when it names a website that actually exists in
/// the snapshot. Blank targets and validator-flagged unknowns both count
/// as present-but-unresolved.
fn resolvable(snapshot: &RoutingSnapshot, project: &str, website: &str) -> bool {
    !website.is_empty() && snapshot.website(project, website).is_some()
}

/// Path portion of a proxy pattern (everything from the first slash).
fn path_part(pattern: &str) -> &str {
    match pattern.find('/') {
        Some(idx) => &pattern[idx..],
        None => "",
    }
}

/// Strip the stage-1 prefix and scan the website's sub-map for an
/// intra-project redirect to a sibling website.
fn apply_sub_map(snapshot: &RoutingSnapshot, m: &mut MatchResult) {
    let site = match snapshot.website(&m.project, &m.website) {
        Some(site) => site,
        None => return,
    };
    if site.sub_map.is_empty() {
        return;
    }

    let rest = m.url.path.strip_prefix(&m.uri_prefix).unwrap_or(&m.url.path);
    let rest = if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    };

    let mut entries: Vec<(&String, &String)> = site.sub_map.iter().collect();
    entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));

    for (pattern, target) in entries {
        if !rest.starts_with(pattern.as_str()) {
            continue;
        }
        if target.is_empty() {
            m.note(format!("sub_map '{}' has a blank target, ignored", pattern));
        } else if target != &m.website && snapshot.website(&m.project, target).is_some() {
            m.note(format!(
                "sub_map '{}' redirects {} -> {}",
                pattern, m.website, target
            ));
            m.website = target.clone();
            m.uri_prefix = join_prefix(&m.uri_prefix, pattern);
        } else {
            m.note(format!(
                "sub_map '{}' target '{}' is not a usable sibling, ignored",
                pattern, target
            ));
        }
        break;
    }
}

fn join_prefix(prefix: &str, sub: &str) -> String {
    if prefix.ends_with('/') && sub.starts_with('/') {
        format!("{}{}", prefix, &sub[1..])
    } else {
        format!("{}{}", prefix, sub)
    }
}
