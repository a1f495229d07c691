use crate::config::{
    join_rel, DefaultErrors, EnvFlags, EnvTable, Environment, ErrorDocs, Project, RuleTable,
    Website, ENVIRONMENTS, ERROR_PAGES_DIR, MAINTENANCE_DIR,
};
use crate::store::RawProject;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Diagnostic severity. Error dominates: once a project or website is at
/// error, later warnings never downgrade it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

/// Severity plus free-text messages for one project or website.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    pub level: Option<Severity>,
    pub messages: Vec<String>,
}

impl Diagnostics {
    pub fn warn(&mut self, msg: impl Into<String>) {
        self.record(Severity::Warning, msg);
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.record(Severity::Error, msg);
    }

    fn record(&mut self, severity: Severity, msg: impl Into<String>) {
        self.level = Some(match self.level {
            Some(level) => level.max(severity),
            None => severity,
        });
        self.messages.push(msg.into());
    }

    pub fn is_clean(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Per-website diagnostics, including the existence flags the
/// administration UI renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebsiteDiagnostics {
    pub diag: Diagnostics,
    pub maintenance_page_exists: bool,
    pub default_doc_exists: bool,
    pub default_errors_exists: bool,
}

impl Default for WebsiteDiagnostics {
    fn default() -> Self {
        WebsiteDiagnostics {
            diag: Diagnostics::default(),
            maintenance_page_exists: true,
            default_doc_exists: true,
            default_errors_exists: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectDiagnostics {
    pub diag: Diagnostics,
    pub websites: BTreeMap<String, WebsiteDiagnostics>,
}

impl ProjectDiagnostics {
    /// Worst severity across the project and its websites.
    pub fn level(&self) -> Option<Severity> {
        self.websites
            .values()
            .filter_map(|w| w.diag.level)
            .chain(self.diag.level)
            .max()
    }

    pub fn is_clean(&self) -> bool {
        self.diag.is_clean() && self.websites.values().all(|w| w.diag.is_clean())
    }
}

/// Normalize every raw project document into a well-formed `Project`.
///
/// This is a self-healing step, not a strict validator: whatever the input
/// looks like, the output is complete and usable, and everything repaired
/// or dropped is recorded in the diagnostics.
pub fn validate_and_repair(
    raw: &[RawProject],
    web_root: &Path,
) -> (BTreeMap<String, Project>, BTreeMap<String, ProjectDiagnostics>) {
    let mut projects = BTreeMap::new();
    let mut diagnostics = BTreeMap::new();

    for raw_project in raw {
        let (project, diag) = validate_project(&raw_project.name, &raw_project.config, web_root);
        if let Some(level) = diag.level() {
            log::warn!(
                "project '{}' validated with {:?}: {} message(s)",
                raw_project.name,
                level,
                diag.diag.messages.len()
                    + diag.websites.values().map(|w| w.diag.messages.len()).sum::<usize>()
            );
        }
        projects.insert(raw_project.name.clone(), project);
        diagnostics.insert(raw_project.name.clone(), diag);
    }

    (projects, diagnostics)
}

/// Normalize a single project document.
pub fn validate_project(
    name: &str,
    value: &Value,
    web_root: &Path,
) -> (Project, ProjectDiagnostics) {
    let mut diag = ProjectDiagnostics::default();
    let mut project = Project {
        name: name.to_string(),
        ..Project::default()
    };

    let obj = match value.as_object() {
        Some(obj) => obj,
        None => {
            diag.diag
                .warn("config root is not an object; using defaults");
            return (project, diag);
        }
    };

    project.project_desc = obj
        .get("project_desc")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    project.enabled = obj.get("enabled").and_then(Value::as_bool).unwrap_or(false);

    // Website names come from the raw document so proxy/DNS targets can be
    // checked before the websites themselves are normalized.
    let website_names: BTreeSet<String> = obj
        .get("websites")
        .and_then(Value::as_object)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();

    project.proxy_map = repair_env_table(obj.get("proxy_map"), "proxy_map", &website_names, &mut diag.diag);
    project.dns_names = repair_env_table(obj.get("dns_names"), "dns_names", &website_names, &mut diag.diag);

    match obj.get("websites") {
        Some(Value::Object(map)) => {
            for (website_name, website_value) in map {
                let website_obj = match website_value.as_object() {
                    Some(website_obj) => website_obj,
                    None => {
                        diag.diag.error(format!(
                            "website '{}' is not an object, dropped",
                            website_name
                        ));
                        continue;
                    }
                };
                let (site, wdiag) =
                    repair_website(name, website_name, website_obj, web_root, &website_names);
                project.websites.insert(website_name.clone(), site);
                diag.websites.insert(website_name.clone(), wdiag);
            }
        }
        Some(_) => diag
            .diag
            .warn("'websites' is not an object; no websites loaded"),
        None => {}
    }

    (project, diag)
}

/// Repair a proxy_map/dns_names value into a complete four-environment
/// table. Blank targets and targets naming unknown websites are kept but
/// flagged; the matcher treats them as present-but-unresolved.
fn repair_env_table(
    value: Option<&Value>,
    field: &str,
    website_names: &BTreeSet<String>,
    diag: &mut Diagnostics,
) -> EnvTable {
    let mut table = EnvTable::default();

    let map = match value {
        Some(Value::Object(map)) => map,
        Some(_) => {
            diag.warn(format!("'{}' is not an object; using empty maps", field));
            return table;
        }
        None => return table,
    };

    for key in map.keys() {
        if Environment::parse(key).is_none() {
            diag.warn(format!("{}: unknown environment '{}' dropped", field, key));
        }
    }

    for env in ENVIRONMENTS {
        let entries = match map.get(env.as_str()) {
            Some(Value::Object(entries)) => entries,
            Some(_) => {
                diag.warn(format!(
                    "{}.{} is not an object; using empty map",
                    field,
                    env.as_str()
                ));
                continue;
            }
            None => continue,
        };

        let out = table.get_mut(env);
        for (pattern, target) in entries {
            let target = match target.as_str() {
                Some(target) => target,
                None => {
                    diag.warn(format!(
                        "{}.{}: entry '{}' target is not a string, dropped",
                        field,
                        env.as_str(),
                        pattern
                    ));
                    continue;
                }
            };
            if pattern.is_empty() {
                // An empty pattern would prefix-match every request.
                diag.warn(format!("{}.{}: empty pattern dropped", field, env.as_str()));
                continue;
            }
            if target.is_empty() {
                diag.warn(format!(
                    "{}.{}: pattern '{}' has no target website",
                    field,
                    env.as_str(),
                    pattern
                ));
            } else if !website_names.contains(target) {
                diag.warn(format!(
                    "{}.{}: pattern '{}' targets unknown website '{}'",
                    field,
                    env.as_str(),
                    pattern,
                    target
                ));
            }
            out.insert(pattern.clone(), target.to_string());
        }
    }

    table
}

fn repair_website(
    project_name: &str,
    website_name: &str,
    obj: &serde_json::Map<String, Value>,
    web_root: &Path,
    website_names: &BTreeSet<String>,
) -> (Website, WebsiteDiagnostics) {
    let mut wdiag = WebsiteDiagnostics::default();
    let mut site = Website::default();

    site.ssl_redirect = obj
        .get("ssl_redirect")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    site.maintenance = repair_env_flags(obj.get("maintenance"));
    site.maintenance_page = string_field(obj.get("maintenance_page"));
    site.maintenance_page_api = string_field(obj.get("maintenance_page_api"));
    site.default_doc = string_field(obj.get("default_doc"));
    site.default_errors = repair_default_errors(obj.get("default_errors"), &mut wdiag.diag);

    site.apis_fixed_path = repair_rule_table(obj.get("apis_fixed_path"), "apis_fixed_path", &mut wdiag.diag);
    site.apis_dynamic_path =
        repair_rule_table(obj.get("apis_dynamic_path"), "apis_dynamic_path", &mut wdiag.diag);
    site.path_static = repair_rule_table(obj.get("path_static"), "path_static", &mut wdiag.diag);
    site.path_static_server_exec = repair_rule_table(
        obj.get("path_static_server_exec"),
        "path_static_server_exec",
        &mut wdiag.diag,
    );
    site.sub_map = repair_rule_table(obj.get("sub_map"), "sub_map", &mut wdiag.diag);

    // A sub-map hop must land on a different, existing sibling. Anything
    // else is deleted so resolution can never loop or dead-end.
    site.sub_map.retain(|pattern, target| {
        if target.as_str() == website_name {
            wdiag.diag.error(format!(
                "sub_map '{}' targets the website itself, dropped",
                pattern
            ));
            return false;
        }
        if !website_names.contains(target.as_str()) {
            wdiag.diag.error(format!(
                "sub_map '{}' targets unknown sibling '{}', dropped",
                pattern, target
            ));
            return false;
        }
        true
    });

    let project_root = web_root.join(project_name);
    let site_root = project_root.join(website_name);
    if site_root.is_dir() {
        check_website_files(&project_root, &site_root, &site, &mut wdiag);
    } else {
        wdiag
            .diag
            .error(format!("website folder missing: {}", site_root.display()));
        wdiag.maintenance_page_exists = false;
        wdiag.default_doc_exists = false;
        wdiag.default_errors_exists = false;
    }

    (site, wdiag)
}

fn string_field(value: Option<&Value>) -> String {
    value.and_then(Value::as_str).unwrap_or("").to_string()
}

fn repair_env_flags(value: Option<&Value>) -> EnvFlags {
    let mut flags = EnvFlags::default();
    if let Some(Value::Object(map)) = value {
        for env in ENVIRONMENTS {
            let on = map
                .get(env.as_str())
                .and_then(Value::as_bool)
                .unwrap_or(false);
            flags.set(env, on);
        }
    }
    flags
}

fn repair_default_errors(value: Option<&Value>, diag: &mut Diagnostics) -> DefaultErrors {
    let mut out = DefaultErrors::default();
    if let Some(Value::Object(map)) = value {
        for (class, docs) in map {
            match class.as_str() {
                "user" => out.user = repair_error_docs(docs),
                "api" => out.api = repair_error_docs(docs),
                other => diag.warn(format!(
                    "default_errors: unknown response type '{}' deleted",
                    other
                )),
            }
        }
    }
    out
}

fn repair_error_docs(value: &Value) -> ErrorDocs {
    let mut docs = ErrorDocs::default();
    if let Some(map) = value.as_object() {
        docs.not_found = map.get("404").and_then(Value::as_str).unwrap_or("").to_string();
        docs.server_error = map.get("500").and_then(Value::as_str).unwrap_or("").to_string();
    }
    docs
}

/// Repair one routing table. Entries with an empty pattern or target are
/// errors and get deleted; the rest pass through.
fn repair_rule_table(value: Option<&Value>, field: &str, diag: &mut Diagnostics) -> RuleTable {
    let mut out = RuleTable::new();

    let map = match value {
        Some(Value::Object(map)) => map,
        Some(_) => {
            diag.warn(format!("'{}' is not an object; using empty table", field));
            return out;
        }
        None => return out,
    };

    for (pattern, target) in map {
        let target = match target.as_str() {
            Some(target) => target,
            None => {
                diag.error(format!(
                    "{}: entry '{}' target is not a string, dropped",
                    field, pattern
                ));
                continue;
            }
        };
        if pattern.is_empty() || target.is_empty() {
            diag.error(format!(
                "{}: entry with empty pattern or target dropped",
                field
            ));
            continue;
        }
        out.insert(pattern.clone(), target.to_string());
    }

    out
}

/// Verify everything the website references on disk. Missing files are
/// warnings and clear the corresponding existence flag; the router keeps
/// serving around them.
fn check_website_files(
    project_root: &Path,
    site_root: &Path,
    site: &Website,
    wdiag: &mut WebsiteDiagnostics,
) {
    if !site.default_doc.is_empty() {
        for (pattern, target) in &site.path_static {
            let doc = join_rel(project_root, target).join(&site.default_doc);
            if !doc.is_file() {
                wdiag.diag.warn(format!(
                    "path_static '{}': default document {} missing",
                    pattern,
                    doc.display()
                ));
                wdiag.default_doc_exists = false;
            }
        }
    }

    for (label, page) in [
        ("maintenance_page", &site.maintenance_page),
        ("maintenance_page_api", &site.maintenance_page_api),
    ] {
        if page.is_empty() {
            continue;
        }
        let file = site_root.join(MAINTENANCE_DIR).join(page);
        if !file.is_file() {
            wdiag
                .diag
                .warn(format!("{} missing: {}", label, file.display()));
            wdiag.maintenance_page_exists = false;
        }
    }

    for (class, docs) in [("user", &site.default_errors.user), ("api", &site.default_errors.api)] {
        for (code, name) in [("404", &docs.not_found), ("500", &docs.server_error)] {
            if name.is_empty() {
                continue;
            }
            let file = site_root.join(ERROR_PAGES_DIR).join(name);
            if !file.is_file() {
                wdiag.diag.warn(format!(
                    "default_errors.{}.{} missing: {}",
                    class,
                    code,
                    file.display()
                ));
                wdiag.default_errors_exists = false;
            }
        }
    }

    for (pattern, target) in &site.apis_fixed_path {
        if !join_rel(project_root, target).is_file() {
            wdiag
                .diag
                .warn(format!("apis_fixed_path '{}': target {} missing", pattern, target));
        }
    }
    for (pattern, target) in &site.apis_dynamic_path {
        if !join_rel(project_root, target).is_dir() {
            wdiag.diag.warn(format!(
                "apis_dynamic_path '{}': target folder {} missing",
                pattern, target
            ));
        }
    }
    for (pattern, target) in &site.path_static_server_exec {
        if !join_rel(project_root, target).is_file() {
            wdiag.diag.warn(format!(
                "path_static_server_exec '{}': target {} missing",
                pattern, target
            ));
        }
    }
}
