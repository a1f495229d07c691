use crate::config::{
    is_script_file, join_rel, RuleTable, Website, ERROR_PAGES_DIR, MAINTENANCE_DIR, MGMT_NAME,
    SCRIPT_EXT_DEFAULT, SYSTEM_404, SYSTEM_500, SYSTEM_API_404, SYSTEM_DEFAULT_DOC,
    SYSTEM_DIR_MARKER, SYSTEM_FILES, SYSTEM_GENERIC_ERROR, SYSTEM_MAINTENANCE, SYSTEM_NAME,
};
use crate::index::RoutingSnapshot;
use crate::router::{Execution, MatchResult, RuleType};
use std::path::{Path, PathBuf};

/// Stage 2: turn a stage-1 (project, website) resolution into a concrete
/// content descriptor, then run the missing-content fallback cascade.
pub fn resolve_content(snapshot: &RoutingSnapshot, m: &mut MatchResult) {
    if !m.state {
        // Nothing claimed the request; system-default handling.
        m.project = SYSTEM_NAME.to_string();
        m.website = SYSTEM_NAME.to_string();
        system_not_found(snapshot, m, false);
        finalize(snapshot, None, m);
        return;
    }

    let site = match snapshot.website(&m.project, &m.website) {
        Some(site) => site,
        None => {
            m.note(format!(
                "website {}/{} absent from snapshot",
                m.project, m.website
            ));
            m.state = false;
            system_not_found(snapshot, m, false);
            finalize(snapshot, None, m);
            return;
        }
    };

    // Stage 1 established ownership; stage 2 re-establishes state once a
    // content rule resolves.
    m.state = false;

    let suffix = collapse_markers(&strip_prefix(&m.url.path, &m.uri_prefix));
    m.uri_suffix = suffix.clone();
    m.note(format!("website uri suffix '{}'", suffix));

    // Special folders are intercepted before ordinary rule matching.
    if let Some(remainder) = after_marker(&suffix, SYSTEM_DIR_MARKER) {
        serve_system_marker(snapshot, m, &remainder);
        finalize(snapshot, Some(site), m);
        return;
    }
    if let Some(remainder) = after_marker(&suffix, ERROR_PAGES_DIR) {
        serve_error_pages_marker(snapshot, site, m, &remainder);
        finalize(snapshot, Some(site), m);
        return;
    }
    if let Some(remainder) = after_marker(&suffix, MAINTENANCE_DIR) {
        serve_maintenance_marker(snapshot, site, m, &remainder);
        finalize(snapshot, Some(site), m);
        return;
    }

    let project_root = snapshot.project_root(&m.project);
    let matched = try_apis_fixed(&project_root, site, &suffix, m)
        || try_apis_dynamic(&project_root, site, &suffix, m)
        || try_static_server_exec(&project_root, site, &suffix, m)
        || try_path_static(&project_root, site, &suffix, m);

    if matched {
        m.state = true;
        m.status = 200;
    } else {
        m.note("no routing rule matched");
        website_not_found(snapshot, site, m);
    }

    // Maintenance overlays hosted websites only, never admin previews, and
    // never requests already inside the maintenance folder.
    if m.project != MGMT_NAME
        && site.maintenance.get(snapshot.environment)
        && !m.preview
    {
        apply_maintenance(snapshot, site, m);
    }

    finalize(snapshot, Some(site), m);
}

/// `match_file_exists`: the single blocking existence probe of the match
/// path.
pub fn match_file_exists(path: &Path) -> bool {
    path.is_file()
}

/// Strip the stage-1 prefix and normalize to a single leading slash.
fn strip_prefix(path: &str, prefix: &str) -> String {
    let rest = path.strip_prefix(prefix).unwrap_or(path);
    format!("/{}", rest.trim_start_matches('/'))
}

/// Collapse duplicated adjacent special-folder markers.
///
/// Relative asset links inside a maintenance or error page resolve against
/// a URL that already contains the marker, producing
/// `_maintenance_page/_maintenance_page/...`; each such run collapses to a
/// single occurrence.
fn collapse_markers(suffix: &str) -> String {
    let mut out = suffix.to_string();
    for marker in [MAINTENANCE_DIR, ERROR_PAGES_DIR, SYSTEM_DIR_MARKER] {
        let doubled = format!("{0}/{0}/", marker);
        let single = format!("{}/", marker);
        while out.contains(&doubled) {
            out = out.replace(&doubled, &single);
        }
    }
    out
}

/// Remainder after `{marker}/` when the marker occurs anywhere in the
/// suffix.
fn after_marker(suffix: &str, marker: &str) -> Option<String> {
    let needle = format!("{}/", marker);
    suffix
        .find(&needle)
        .map(|pos| suffix[pos + needle.len()..].to_string())
}

/// Split a relative path into (directory, file name). The last segment is
/// only a file when it carries a dot.
fn split_dir_file(rel: &str) -> (String, Option<String>) {
    let rel = rel.trim_start_matches('/');
    match rel.rfind('/') {
        Some(idx) => {
            let last = &rel[idx + 1..];
            if last.contains('.') {
                (rel[..idx].to_string(), Some(last.to_string()))
            } else {
                (rel.to_string(), None)
            }
        }
        None => {
            if rel.contains('.') {
                (String::new(), Some(rel.to_string()))
            } else {
                (rel.to_string(), None)
            }
        }
    }
}

fn set_file(m: &mut MatchResult, full: PathBuf) {
    m.file_name = full
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    m.file_path = full
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
}

fn by_length_desc(table: &RuleTable) -> Vec<(&String, &String)> {
    let mut entries: Vec<_> = table.iter().collect();
    entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(b.0)));
    entries
}

// ─── Special folders ────────────────────────────────────────

fn serve_system_marker(snapshot: &RoutingSnapshot, m: &mut MatchResult, remainder: &str) {
    let (dir, file) = split_dir_file(remainder);
    let name = file.unwrap_or_else(|| SYSTEM_DEFAULT_DOC.to_string());
    m.file_path = join_rel(&snapshot.system_root, &dir);
    m.file_name = name;
    m.execution = if is_script_file(&m.file_name) {
        Execution::Server
    } else {
        Execution::Client
    };
    m.rule = RuleType::SystemAsset;
    m.state = true;
    m.status = 200;
    m.note(format!("system folder request '{}'", remainder));
}

fn serve_error_pages_marker(
    snapshot: &RoutingSnapshot,
    site: &Website,
    m: &mut MatchResult,
    remainder: &str,
) {
    let api_like = remainder.trim_start_matches('/').starts_with("api/");
    let (dir, file) = split_dir_file(remainder);
    let name = file.unwrap_or_else(|| {
        if site.default_errors.user.not_found.is_empty() {
            SYSTEM_404.to_string()
        } else {
            site.default_errors.user.not_found.clone()
        }
    });

    let folder = snapshot
        .website_root(&m.project, &m.website)
        .join(ERROR_PAGES_DIR);
    m.file_path = join_rel(&folder, &dir);
    m.file_name = name;
    m.execution = if api_like && is_script_file(&m.file_name) {
        Execution::Server
    } else {
        Execution::Client
    };
    m.rule = RuleType::ErrorPage;
    m.state = true;
    m.status = 200;
    m.note(format!("error-pages folder request '{}'", remainder));
}

fn serve_maintenance_marker(
    snapshot: &RoutingSnapshot,
    site: &Website,
    m: &mut MatchResult,
    remainder: &str,
) {
    let (dir, file) = split_dir_file(remainder);
    let name = match file {
        Some(file) => file,
        None if !site.maintenance_page.is_empty() => site.maintenance_page.clone(),
        None => SYSTEM_MAINTENANCE.to_string(),
    };

    let folder = snapshot
        .website_root(&m.project, &m.website)
        .join(MAINTENANCE_DIR);
    m.file_path = join_rel(&folder, &dir);
    m.file_name = name;
    m.execution = if is_script_file(&m.file_name) {
        Execution::Server
    } else {
        Execution::Client
    };
    m.rule = RuleType::MaintenancePage;
    m.state = true;
    m.status = 200;
    m.note(format!("maintenance folder request '{}'", remainder));
}

// ─── Ordinary rules, fixed priority ─────────────────────────

fn try_apis_fixed(
    project_root: &Path,
    site: &Website,
    suffix: &str,
    m: &mut MatchResult,
) -> bool {
    for (pattern, target) in by_length_desc(&site.apis_fixed_path) {
        if suffix.starts_with(pattern.as_str()) {
            set_file(m, join_rel(project_root, target));
            m.execution = Execution::Server;
            m.rule = RuleType::ApiFixed;
            m.note(format!("apis_fixed_path '{}' -> {}", pattern, target));
            return true;
        }
    }
    false
}

fn try_apis_dynamic(
    project_root: &Path,
    site: &Website,
    suffix: &str,
    m: &mut MatchResult,
) -> bool {
    for (pattern, target) in by_length_desc(&site.apis_dynamic_path) {
        if !suffix.starts_with(pattern.as_str()) {
            continue;
        }
        let tail = suffix[pattern.len()..].trim_matches('/');
        if tail.is_empty() {
            // Bare prefix with nothing further would expose the handler
            // folder itself.
            m.note(format!(
                "apis_dynamic_path '{}' matched with no target, rejected",
                pattern
            ));
            return false;
        }
        let (dir, last) = match tail.rfind('/') {
            Some(idx) => (&tail[..idx], &tail[idx + 1..]),
            None => ("", tail),
        };
        let name = if last.contains('.') {
            last.to_string()
        } else {
            format!("{}.{}", last, SCRIPT_EXT_DEFAULT)
        };
        m.file_path = join_rel(&join_rel(project_root, target), dir);
        m.file_name = name;
        m.execution = Execution::Server;
        m.rule = RuleType::ApiDynamic;
        m.note(format!(
            "apis_dynamic_path '{}' -> {} tail '{}'",
            pattern, target, tail
        ));
        return true;
    }
    false
}

fn try_static_server_exec(
    project_root: &Path,
    site: &Website,
    suffix: &str,
    m: &mut MatchResult,
) -> bool {
    for (pattern, target) in by_length_desc(&site.path_static_server_exec) {
        // Exact match including the file name, never a prefix match.
        if suffix == pattern.as_str() {
            set_file(m, join_rel(project_root, target));
            m.execution = Execution::Server;
            m.rule = RuleType::StaticServerExec;
            m.note(format!("path_static_server_exec '{}' -> {}", pattern, target));
            return true;
        }
    }
    false
}

fn try_path_static(
    project_root: &Path,
    site: &Website,
    suffix: &str,
    m: &mut MatchResult,
) -> bool {
    for (pattern, target) in by_length_desc(&site.path_static) {
        if !suffix.starts_with(pattern.as_str()) {
            continue;
        }
        let remainder = &suffix[pattern.len()..];
        let (dir, file) = split_dir_file(remainder);
        let name = match file {
            Some(file) => file,
            None if !site.default_doc.is_empty() => site.default_doc.clone(),
            None => SYSTEM_DEFAULT_DOC.to_string(),
        };
        m.file_path = join_rel(&join_rel(project_root, target), &dir);
        m.file_name = name;
        if is_script_file(&m.file_name) {
            // A script default document turns the rule into a server-exec
            // override.
            m.execution = Execution::Server;
            m.rule = RuleType::StaticServerExec;
        } else {
            m.execution = Execution::Client;
            m.rule = RuleType::Static;
        }
        m.note(format!("path_static '{}' -> {}", pattern, target));
        return true;
    }
    false
}

// ─── Not-found and maintenance overlays ─────────────────────

/// Point the result at the website's configured 404 (stage-2 failure).
fn website_not_found(snapshot: &RoutingSnapshot, site: &Website, m: &mut MatchResult) {
    m.status = 404;
    let name = &site.default_errors.user.not_found;
    if name.is_empty() {
        system_not_found(snapshot, m, false);
        return;
    }
    let folder = snapshot
        .website_root(&m.project, &m.website)
        .join(ERROR_PAGES_DIR);
    m.file_path = folder;
    m.file_name = name.clone();
    m.execution = if is_script_file(name) {
        Execution::Server
    } else {
        Execution::Client
    };
    m.rule = RuleType::ErrorPage;
    m.note(format!("serving website 404 document '{}'", name));
}

/// Point the result at the system 404 document.
fn system_not_found(snapshot: &RoutingSnapshot, m: &mut MatchResult, api: bool) {
    let rel = if api { SYSTEM_API_404 } else { SYSTEM_404 };
    set_file(m, snapshot.system_file(rel));
    m.status = 404;
    m.execution = Execution::Client;
    m.rule = RuleType::SystemAsset;
    m.note(format!("serving system 404 '{}'", rel));
}

/// Maintenance-mode override: replace whatever resolved with the
/// website's maintenance document, API or user variant per the rule type
/// that was active.
fn apply_maintenance(snapshot: &RoutingSnapshot, site: &Website, m: &mut MatchResult) {
    let doc = if m.rule.is_api() {
        &site.maintenance_page_api
    } else {
        &site.maintenance_page
    };

    if doc.is_empty() {
        set_file(m, snapshot.system_file(SYSTEM_MAINTENANCE));
        m.note("maintenance mode active, serving system maintenance page");
    } else {
        m.file_path = snapshot
            .website_root(&m.project, &m.website)
            .join(MAINTENANCE_DIR);
        m.file_name = doc.clone();
        m.note(format!("maintenance mode active, serving '{}'", doc));
    }

    m.execution = if is_script_file(&m.file_name) {
        Execution::Server
    } else {
        Execution::Client
    };
    m.rule = RuleType::MaintenancePage;
    m.state = true;
    m.status = 200;
}

// ─── Missing-content fallback ───────────────────────────────

/// Existence check plus the location-dependent fallback cascade. Straight
/// line code on purpose: every branch bottoms out at a system document,
/// and the system documents themselves never re-enter the cascade.
fn finalize(snapshot: &RoutingSnapshot, site: Option<&Website>, m: &mut MatchResult) {
    if m.file_name.is_empty() {
        system_not_found(snapshot, m, false);
    }

    let full = m.full_path();
    if match_file_exists(&full) {
        m.note(format!("serving {}", full.display()));
        return;
    }
    m.note(format!("content file missing: {}", full.display()));

    if has_component(&full, MAINTENANCE_DIR) {
        // Keep the 200: the visitor still sees a maintenance notice.
        set_file(m, snapshot.system_file(SYSTEM_MAINTENANCE));
        m.execution = Execution::Client;
        m.rule = RuleType::MaintenancePage;
        m.note("falling back to system maintenance page");
        ensure_system_bottom(snapshot, m, SYSTEM_MAINTENANCE);
        return;
    }

    if has_component(&full, ERROR_PAGES_DIR) {
        if m.project == MGMT_NAME {
            set_file(m, snapshot.system_file(SYSTEM_GENERIC_ERROR));
            m.execution = Execution::Client;
            m.rule = RuleType::ErrorPage;
            m.note("falling back to the management generic error page");
            ensure_system_bottom(snapshot, m, SYSTEM_GENERIC_ERROR);
        } else {
            // Never recurse into the website's own error pages; they may
            // be the thing that is missing.
            m.status = 404;
            system_not_found(snapshot, m, m.rule.is_api());
            let rel = if m.rule.is_api() { SYSTEM_API_404 } else { SYSTEM_404 };
            ensure_system_bottom(snapshot, m, rel);
        }
        return;
    }

    if full.starts_with(&snapshot.system_root) {
        let rel = full
            .strip_prefix(&snapshot.system_root)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        if SYSTEM_FILES.contains(&rel.as_str()) {
            fatal_system(snapshot, m, &rel);
        } else {
            system_not_found(snapshot, m, false);
            m.note("unrecognized system path");
            ensure_system_bottom(snapshot, m, SYSTEM_404);
        }
        return;
    }

    // Ordinary website content.
    let api = m.rule.is_api();
    m.status = 404;
    if let Some(site) = site {
        let name = if api {
            &site.default_errors.api.not_found
        } else {
            &site.default_errors.user.not_found
        };
        if !name.is_empty() {
            let file = snapshot
                .website_root(&m.project, &m.website)
                .join(ERROR_PAGES_DIR)
                .join(name);
            if match_file_exists(&file) {
                set_file(m, file);
                m.execution = if is_script_file(name) {
                    Execution::Server
                } else {
                    Execution::Client
                };
                m.rule = RuleType::ErrorPage;
                m.note(format!("serving website 404 document '{}'", name));
                return;
            }
            m.note(format!("website 404 document '{}' missing too", name));
        }
    }
    system_not_found(snapshot, m, api);
    let rel = if api { SYSTEM_API_404 } else { SYSTEM_404 };
    ensure_system_bottom(snapshot, m, rel);
}

fn has_component(path: &Path, name: &str) -> bool {
    path.components().any(|c| c.as_os_str() == name)
}

/// A system document chosen by the cascade is the bottom: if it is
/// missing, the installation itself is broken.
fn ensure_system_bottom(snapshot: &RoutingSnapshot, m: &mut MatchResult, rel: &str) {
    if !match_file_exists(&m.full_path()) {
        fatal_system(snapshot, m, rel);
    }
}

fn fatal_system(snapshot: &RoutingSnapshot, m: &mut MatchResult, rel: &str) {
    m.error = true;
    m.state = false;
    m.status = 500;
    m.execution = Execution::Client;
    m.rule = RuleType::SystemAsset;
    m.note(format!(
        "required system file '{}' is missing; installation broken",
        rel
    ));
    // Point at the system 500 page; the serving layer generates a built-in
    // document when even that is gone.
    set_file(m, snapshot.system_file(SYSTEM_500));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvTable, Environment, Project, ServerConf};
    use crate::router::{match_url, MatchedBy};
    use crate::store::Listing;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        conf: ServerConf,
    }

    fn write(path: &Path, body: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    /// System folder with the full required file set, plus a p1/shop tree.
    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let system = tmp.path().join("system");
        for rel in SYSTEM_FILES {
            write(&join_rel(&system, rel), rel);
        }
        write(&system.join("mgmt").join("app.css"), "css");

        let shop = tmp.path().join("web").join("p1").join("shop");
        write(&shop.join("cart-ui").join("index.html"), "cart");
        write(&shop.join("cart-ui").join("style.css"), "css");
        write(&shop.join("api").join("ping.js"), "pong");
        write(&shop.join("api").join("handlers").join("users.js"), "users");
        write(
            &shop.join("api").join("handlers").join("v2").join("orders.js"),
            "orders",
        );
        write(&shop.join("exec").join("report.js"), "report");
        write(&shop.join(MAINTENANCE_DIR).join("closed.html"), "closed");
        write(&shop.join(MAINTENANCE_DIR).join("style.css"), "css");
        write(&shop.join(ERROR_PAGES_DIR).join("notfound.html"), "nf");
        write(&shop.join(ERROR_PAGES_DIR).join("api404.js"), "nf-api");

        let eu = tmp.path().join("web").join("p1").join("storefront-eu");
        write(&eu.join("home.html"), "eu");

        let conf = ServerConf {
            web_source: tmp.path().join("web").display().to_string(),
            system_root: system.display().to_string(),
            environment: "prod".to_string(),
            mgmt_ui: vec!["admin.local".to_string()],
            ..ServerConf::default()
        };

        Fixture { _tmp: tmp, conf }
    }

    fn shop_project() -> Project {
        let mut proxy_map = EnvTable::default();
        proxy_map
            .get_mut(Environment::Prod)
            .insert("demo.test/shop/".to_string(), "shop".to_string());
        proxy_map
            .get_mut(Environment::Prod)
            .insert("demo.test/".to_string(), "shop".to_string());

        let mut dns_names = EnvTable::default();
        dns_names
            .get_mut(Environment::Prod)
            .insert("www.demo.test".to_string(), "".to_string());

        let mut shop = crate::config::Website::default();
        shop.default_doc = "index.html".to_string();
        shop.maintenance_page = "closed.html".to_string();
        shop.maintenance_page_api = "closed.js".to_string();
        shop.default_errors.user.not_found = "notfound.html".to_string();
        shop.default_errors.api.not_found = "api404.js".to_string();
        shop.path_static
            .insert("/cart".to_string(), "/shop/cart-ui/".to_string());
        shop.apis_fixed_path
            .insert("/api/ping".to_string(), "/shop/api/ping.js".to_string());
        shop.apis_dynamic_path
            .insert("/api/app/".to_string(), "/shop/api/handlers/".to_string());
        shop.path_static_server_exec
            .insert("/report".to_string(), "/shop/exec/report.js".to_string());
        shop.sub_map
            .insert("/eu/".to_string(), "storefront-eu".to_string());

        let mut eu = crate::config::Website::default();
        eu.path_static
            .insert("/".to_string(), "/storefront-eu/".to_string());

        let mut websites = BTreeMap::new();
        websites.insert("shop".to_string(), shop);
        websites.insert("storefront-eu".to_string(), eu);

        Project {
            name: "p1".to_string(),
            enabled: true,
            proxy_map,
            dns_names,
            websites,
            ..Project::default()
        }
    }

    fn snapshot(fixture: &Fixture, mgmt_mode: bool) -> RoutingSnapshot {
        let mut conf = fixture.conf.clone();
        conf.mgmt_mode = mgmt_mode;
        let project = shop_project();
        let mut projects = BTreeMap::new();
        projects.insert(project.name.clone(), project);
        RoutingSnapshot::build(projects, BTreeMap::new(), Listing::new(), &conf)
    }

    fn snapshot_with(fixture: &Fixture, project: Project, mgmt_mode: bool) -> RoutingSnapshot {
        let mut conf = fixture.conf.clone();
        conf.mgmt_mode = mgmt_mode;
        let mut projects = BTreeMap::new();
        projects.insert(project.name.clone(), project);
        RoutingSnapshot::build(projects, BTreeMap::new(), Listing::new(), &conf)
    }

    // ─── path_static resolution ─────────────────────────────

    #[test]
    fn test_static_path_with_default_doc() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/cart");
        assert!(m.state, "{}", m.trace_text());
        assert_eq!(m.status, 200);
        assert_eq!(m.execution, Execution::Client);
        assert_eq!(m.rule, RuleType::Static);
        assert!(m
            .full_path()
            .ends_with(Path::new("p1/shop/cart-ui/index.html")));
    }

    #[test]
    fn test_static_path_explicit_file() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/cart/style.css");
        assert!(m.state);
        assert_eq!(m.file_name, "style.css");
        assert_eq!(m.execution, Execution::Client);
    }

    #[test]
    fn test_script_default_doc_flips_to_server_exec() {
        let f = fixture();
        let mut project = shop_project();
        {
            let site = project.websites.get_mut("shop").unwrap();
            site.default_doc = "index.js".to_string();
        }
        write(
            &Path::new(&f.conf.web_source).join("p1/shop/cart-ui/index.js"),
            "app",
        );
        let s = snapshot_with(&f, project, false);
        let m = match_url(&s, "https://demo.test/shop/cart");
        assert_eq!(m.rule, RuleType::StaticServerExec);
        assert_eq!(m.execution, Execution::Server);
    }

    // ─── API rules ──────────────────────────────────────────

    #[test]
    fn test_api_fixed_path() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/api/ping");
        assert!(m.state);
        assert_eq!(m.rule, RuleType::ApiFixed);
        assert_eq!(m.execution, Execution::Server);
        assert!(m.full_path().ends_with(Path::new("shop/api/ping.js")));
    }

    #[test]
    fn test_api_dynamic_extension_substituted() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/api/app/users");
        assert!(m.state, "{}", m.trace_text());
        assert_eq!(m.rule, RuleType::ApiDynamic);
        assert_eq!(m.file_name, "users.js");
        assert!(m
            .full_path()
            .ends_with(Path::new("shop/api/handlers/users.js")));
    }

    #[test]
    fn test_api_dynamic_nested_tail() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/api/app/v2/orders.js");
        assert!(m.state);
        assert!(m
            .full_path()
            .ends_with(Path::new("shop/api/handlers/v2/orders.js")));
    }

    #[test]
    fn test_api_dynamic_bare_prefix_rejected() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/api/app/");
        // no target: rejected, falls through the remaining rules to 404
        assert!(!m.state);
        assert_eq!(m.status, 404);
    }

    #[test]
    fn test_longest_api_prefix_wins() {
        let f = fixture();
        let mut project = shop_project();
        {
            let site = project.websites.get_mut("shop").unwrap();
            site.apis_dynamic_path.insert(
                "/api/app/v2/".to_string(),
                "/shop/api/handlers/v2/".to_string(),
            );
        }
        let s = snapshot_with(&f, project, false);
        let m = match_url(&s, "https://demo.test/shop/api/app/v2/orders");
        assert!(m.state, "{}", m.trace_text());
        assert!(m
            .full_path()
            .ends_with(Path::new("shop/api/handlers/v2/orders.js")));
    }

    // ─── Server-exec override ───────────────────────────────

    #[test]
    fn test_server_exec_exact_match() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/report");
        assert!(m.state);
        assert_eq!(m.rule, RuleType::StaticServerExec);
        assert_eq!(m.execution, Execution::Server);
    }

    #[test]
    fn test_server_exec_requires_exact_not_prefix() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/report/extra");
        assert_ne!(m.rule, RuleType::StaticServerExec);
    }

    // ─── Sub-map end to end ─────────────────────────────────

    #[test]
    fn test_sub_map_resolution_end_to_end() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/eu/home.html");
        assert!(m.state, "{}", m.trace_text());
        assert_eq!(m.website, "storefront-eu");
        assert!(m
            .full_path()
            .ends_with(Path::new("p1/storefront-eu/home.html")));
    }

    // ─── Stage-1 failure → system 404 ───────────────────────

    #[test]
    fn test_unknown_host_serves_system_404() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://unknown.test/x");
        assert!(!m.state);
        assert_eq!(m.status, 404);
        assert_eq!(m.project, SYSTEM_NAME);
        assert!(m.full_path().ends_with(Path::new("system/404.html")));
    }

    #[test]
    fn test_blank_dns_target_serves_system_404() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://www.demo.test/anything");
        assert!(!m.state);
        assert_eq!(m.status, 404);
        assert!(m.full_path().ends_with(Path::new("system/404.html")));
    }

    // ─── Missing content fallbacks ──────────────────────────

    #[test]
    fn test_missing_file_serves_website_404() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/cart/missing.png");
        assert_eq!(m.status, 404);
        assert_eq!(m.rule, RuleType::ErrorPage);
        assert!(m.full_path().ends_with(Path::new("_error_pages/notfound.html")));
    }

    #[test]
    fn test_missing_api_file_serves_api_404_variant() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/api/app/nosuch");
        assert_eq!(m.status, 404);
        assert!(m.full_path().ends_with(Path::new("_error_pages/api404.js")));
    }

    #[test]
    fn test_missing_file_without_website_404_serves_system_404() {
        let f = fixture();
        let mut project = shop_project();
        {
            let site = project.websites.get_mut("shop").unwrap();
            site.default_errors = Default::default();
        }
        let s = snapshot_with(&f, project, false);
        let m = match_url(&s, "https://demo.test/shop/cart/missing.png");
        assert_eq!(m.status, 404);
        assert!(m.full_path().ends_with(Path::new("system/404.html")));
    }

    #[test]
    fn test_missing_website_404_falls_to_system_404() {
        let f = fixture();
        let mut project = shop_project();
        {
            let site = project.websites.get_mut("shop").unwrap();
            site.default_errors.user.not_found = "ghost.html".to_string();
        }
        let s = snapshot_with(&f, project, false);
        let m = match_url(&s, "https://demo.test/shop/cart/missing.png");
        assert_eq!(m.status, 404);
        assert!(m.full_path().ends_with(Path::new("system/404.html")));
    }

    #[test]
    fn test_missing_system_file_is_fatal_500() {
        let f = fixture();
        let s = snapshot(&f, false);
        std::fs::remove_file(s.system_file(SYSTEM_404)).unwrap();
        let m = match_url(&s, "https://unknown.test/x");
        assert!(m.error);
        assert_eq!(m.status, 500);
    }

    #[test]
    fn test_missing_maintenance_page_falls_to_system() {
        let f = fixture();
        let mut project = shop_project();
        {
            let site = project.websites.get_mut("shop").unwrap();
            site.maintenance.set(Environment::Prod, true);
            site.maintenance_page = "ghost.html".to_string();
        }
        let s = snapshot_with(&f, project, false);
        let m = match_url(&s, "https://demo.test/shop/cart");
        assert_eq!(m.status, 200);
        assert!(m
            .full_path()
            .ends_with(Path::new("system/maintenance.html")));
    }

    // ─── Maintenance mode ───────────────────────────────────

    fn maintenance_project() -> Project {
        let mut project = shop_project();
        project
            .websites
            .get_mut("shop")
            .unwrap()
            .maintenance
            .set(Environment::Prod, true);
        project
    }

    #[test]
    fn test_maintenance_overrides_static_content() {
        let f = fixture();
        let s = snapshot_with(&f, maintenance_project(), false);
        let m = match_url(&s, "https://demo.test/shop/cart");
        assert!(m.state);
        assert_eq!(m.status, 200);
        assert_eq!(m.rule, RuleType::MaintenancePage);
        assert_eq!(m.execution, Execution::Client);
        assert!(m
            .full_path()
            .ends_with(Path::new("_maintenance_page/closed.html")));
    }

    #[test]
    fn test_maintenance_api_variant_for_api_rules() {
        let f = fixture();
        let s = snapshot_with(&f, maintenance_project(), false);
        write(
            &Path::new(&f.conf.web_source).join("p1/shop/_maintenance_page/closed.js"),
            "api closed",
        );
        let m = match_url(&s, "https://demo.test/shop/api/ping");
        assert_eq!(m.rule, RuleType::MaintenancePage);
        assert_eq!(m.execution, Execution::Server);
        assert_eq!(m.file_name, "closed.js");
    }

    #[test]
    fn test_maintenance_does_not_intercept_maintenance_folder() {
        let f = fixture();
        let s = snapshot_with(&f, maintenance_project(), false);
        let m = match_url(&s, "https://demo.test/shop/_maintenance_page/style.css");
        assert!(m.state);
        assert_eq!(m.file_name, "style.css");
        assert!(m
            .full_path()
            .ends_with(Path::new("_maintenance_page/style.css")));
    }

    #[test]
    fn test_maintenance_skipped_for_other_environment() {
        let f = fixture();
        let mut project = shop_project();
        project
            .websites
            .get_mut("shop")
            .unwrap()
            .maintenance
            .set(Environment::Qa, true);
        let s = snapshot_with(&f, project, false);
        let m = match_url(&s, "https://demo.test/shop/cart");
        assert_eq!(m.rule, RuleType::Static);
    }

    #[test]
    fn test_maintenance_skipped_for_vhost_preview() {
        let f = fixture();
        let s = snapshot_with(&f, maintenance_project(), true);
        let m = match_url(&s, "http://admin.local/vhost/p1::shop/cart");
        assert!(m.preview);
        assert_eq!(m.rule, RuleType::Static);
        assert_eq!(m.status, 200);
    }

    #[test]
    fn test_maintenance_blank_page_uses_system_document() {
        let f = fixture();
        let mut project = maintenance_project();
        project.websites.get_mut("shop").unwrap().maintenance_page = String::new();
        let s = snapshot_with(&f, project, false);
        let m = match_url(&s, "https://demo.test/shop/cart");
        assert_eq!(m.status, 200);
        assert!(m
            .full_path()
            .ends_with(Path::new("system/maintenance.html")));
    }

    // ─── Special folders ────────────────────────────────────

    #[test]
    fn test_default_system_marker() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/_default_system/index.html");
        assert!(m.state);
        assert_eq!(m.rule, RuleType::SystemAsset);
        assert!(m.full_path().ends_with(Path::new("system/index.html")));
    }

    #[test]
    fn test_error_pages_marker_serves_site_error_asset() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/_error_pages/notfound.html");
        assert!(m.state);
        assert_eq!(m.rule, RuleType::ErrorPage);
        assert!(m
            .full_path()
            .ends_with(Path::new("shop/_error_pages/notfound.html")));
    }

    #[test]
    fn test_duplicated_marker_collapsed() {
        let f = fixture();
        let s = snapshot_with(&f, maintenance_project(), false);
        let m = match_url(
            &s,
            "https://demo.test/shop/_maintenance_page/_maintenance_page/style.css",
        );
        assert!(m.state, "{}", m.trace_text());
        assert!(m
            .full_path()
            .ends_with(Path::new("shop/_maintenance_page/style.css")));
    }

    #[test]
    fn test_collapse_markers_helper() {
        assert_eq!(
            collapse_markers("/_error_pages/_error_pages/_error_pages/x.css"),
            "/_error_pages/x.css"
        );
        assert_eq!(collapse_markers("/a/_error_pages/x"), "/a/_error_pages/x");
    }

    // ─── Management UI ──────────────────────────────────────

    #[test]
    fn test_mgmt_ui_serves_system_content() {
        let f = fixture();
        let s = snapshot(&f, true);
        let m = match_url(&s, "http://admin.local/mgmt/app.css");
        assert!(m.state, "{}", m.trace_text());
        assert_eq!(m.matched_by, MatchedBy::MgmtHost);
        assert!(m.full_path().ends_with(Path::new("system/mgmt/app.css")));
    }

    #[test]
    fn test_mgmt_ui_root_serves_default_doc() {
        let f = fixture();
        let s = snapshot(&f, true);
        let m = match_url(&s, "http://admin.local/");
        assert!(m.state);
        assert!(m.full_path().ends_with(Path::new("system/index.html")));
    }

    #[test]
    fn test_mgmt_missing_error_page_falls_to_generic() {
        let f = fixture();
        let s = snapshot(&f, true);
        let m = match_url(&s, "http://admin.local/_error_pages/ghost.css");
        assert!(m.full_path().ends_with(Path::new("system/error.html")));
    }

    #[test]
    fn test_vhost_preview_serves_target_site() {
        let f = fixture();
        let s = snapshot(&f, true);
        let m = match_url(&s, "http://admin.local/vhost/p1::shop/cart");
        assert!(m.state, "{}", m.trace_text());
        assert!(m
            .full_path()
            .ends_with(Path::new("p1/shop/cart-ui/index.html")));
    }

    // ─── Trace ──────────────────────────────────────────────

    #[test]
    fn test_trace_records_each_decision() {
        let f = fixture();
        let s = snapshot(&f, false);
        let m = match_url(&s, "https://demo.test/shop/cart");
        let text = m.trace_text();
        assert!(text.contains("proxy pattern"));
        assert!(text.contains("path_static"));
        assert!(text.contains("serving"));
    }
}
