use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Name of the synthetic management-UI project and website.
pub const MGMT_NAME: &str = "mgmtui";
/// Name reported for requests no project claimed.
pub const SYSTEM_NAME: &str = "system";

/// Per-project configuration document inside the web-source tree.
pub const CONFIG_FILE: &str = "config.json";

/// Per-website overlay folders.
pub const MAINTENANCE_DIR: &str = "_maintenance_page";
pub const ERROR_PAGES_DIR: &str = "_error_pages";
/// URI marker routing into the built-in system asset folder.
pub const SYSTEM_DIR_MARKER: &str = "_default_system";

/// Default document name when a website configures none.
pub const SYSTEM_DEFAULT_DOC: &str = "index.html";
pub const SYSTEM_404: &str = "404.html";
pub const SYSTEM_500: &str = "500.html";
pub const SYSTEM_API_404: &str = "api/404.json";
pub const SYSTEM_API_500: &str = "api/500.json";
pub const SYSTEM_MAINTENANCE: &str = "maintenance.html";
pub const SYSTEM_GENERIC_ERROR: &str = "error.html";

/// Relative paths the system installation is required to ship. A missing
/// file from this set means the installation is broken (500), not that the
/// request was wrong (404).
pub const SYSTEM_FILES: &[&str] = &[
    SYSTEM_DEFAULT_DOC,
    SYSTEM_404,
    SYSTEM_500,
    SYSTEM_API_404,
    SYSTEM_API_500,
    SYSTEM_MAINTENANCE,
    SYSTEM_GENERIC_ERROR,
];

/// Extensions executed server-side; everything else is client content.
pub const SCRIPT_EXTENSIONS: &[&str] = &["js", "mjs", "cjs"];
/// Extension substituted for extension-less dynamic-API tails.
pub const SCRIPT_EXT_DEFAULT: &str = "js";

/// Admin preview path prefix: `/vhost/{project}::{website}/`.
pub const VHOST_PREFIX: &str = "/vhost/";
pub const VHOST_SEPARATOR: &str = "::";

/// True when the file name carries a server-executed extension.
pub fn is_script_file(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((_, ext)) => SCRIPT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()),
        None => false,
    }
}

/// Join a config-supplied relative path onto a base directory, segment by
/// segment. Empty, `.` and `..` segments are discarded, so a document can
/// never name a file outside its root.
pub fn join_rel(base: &Path, rel: &str) -> std::path::PathBuf {
    let mut out = base.to_path_buf();
    for seg in rel.split('/') {
        if !seg.is_empty() && seg != "." && seg != ".." {
            out.push(seg);
        }
    }
    out
}

/// Deployment environment selecting which proxy/DNS sub-table and
/// maintenance flag apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Qa,
    Stage,
    Prod,
}

pub const ENVIRONMENTS: [Environment; 4] = [
    Environment::Dev,
    Environment::Qa,
    Environment::Stage,
    Environment::Prod,
];

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Qa => "qa",
            Environment::Stage => "stage",
            Environment::Prod => "prod",
        }
    }

    pub fn parse(s: &str) -> Option<Environment> {
        match s {
            "dev" => Some(Environment::Dev),
            "qa" => Some(Environment::Qa),
            "stage" => Some(Environment::Stage),
            "prod" => Some(Environment::Prod),
            _ => None,
        }
    }
}

/// Pattern → target table. BTreeMap keeps normalized output stable.
pub type RuleTable = BTreeMap<String, String>;

/// One rule table per environment. The validator guarantees all four
/// environments are present even when the source document omits them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvTable {
    #[serde(default)]
    pub dev: RuleTable,
    #[serde(default)]
    pub qa: RuleTable,
    #[serde(default)]
    pub stage: RuleTable,
    #[serde(default)]
    pub prod: RuleTable,
}

impl EnvTable {
    pub fn get(&self, env: Environment) -> &RuleTable {
        match env {
            Environment::Dev => &self.dev,
            Environment::Qa => &self.qa,
            Environment::Stage => &self.stage,
            Environment::Prod => &self.prod,
        }
    }

    pub fn get_mut(&mut self, env: Environment) -> &mut RuleTable {
        match env {
            Environment::Dev => &mut self.dev,
            Environment::Qa => &mut self.qa,
            Environment::Stage => &mut self.stage,
            Environment::Prod => &mut self.prod,
        }
    }
}

/// One boolean per environment (maintenance mode).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvFlags {
    #[serde(default)]
    pub dev: bool,
    #[serde(default)]
    pub qa: bool,
    #[serde(default)]
    pub stage: bool,
    #[serde(default)]
    pub prod: bool,
}

impl EnvFlags {
    pub fn get(&self, env: Environment) -> bool {
        match env {
            Environment::Dev => self.dev,
            Environment::Qa => self.qa,
            Environment::Stage => self.stage,
            Environment::Prod => self.prod,
        }
    }

    pub fn set(&mut self, env: Environment, value: bool) {
        match env {
            Environment::Dev => self.dev = value,
            Environment::Qa => self.qa = value,
            Environment::Stage => self.stage = value,
            Environment::Prod => self.prod = value,
        }
    }
}

/// 404/500 document names for one response class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorDocs {
    #[serde(rename = "404", default)]
    pub not_found: String,
    #[serde(rename = "500", default)]
    pub server_error: String,
}

/// Error documents per response class. Only `user` and `api` exist; the
/// validator deletes anything else.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultErrors {
    #[serde(default)]
    pub user: ErrorDocs,
    #[serde(default)]
    pub api: ErrorDocs,
}

/// A named content unit within a project: routing tables plus
/// maintenance/error settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Website {
    #[serde(default = "default_true")]
    pub ssl_redirect: bool,
    #[serde(default)]
    pub maintenance: EnvFlags,
    #[serde(default)]
    pub maintenance_page: String,
    #[serde(default)]
    pub maintenance_page_api: String,
    #[serde(default)]
    pub default_doc: String,
    #[serde(default)]
    pub default_errors: DefaultErrors,
    #[serde(default)]
    pub apis_fixed_path: RuleTable,
    #[serde(default)]
    pub apis_dynamic_path: RuleTable,
    #[serde(default)]
    pub path_static: RuleTable,
    #[serde(default)]
    pub path_static_server_exec: RuleTable,
    #[serde(default)]
    pub sub_map: RuleTable,
}

fn default_true() -> bool {
    true
}

impl Default for Website {
    fn default() -> Self {
        Website {
            ssl_redirect: true,
            maintenance: EnvFlags::default(),
            maintenance_page: String::new(),
            maintenance_page_api: String::new(),
            default_doc: String::new(),
            default_errors: DefaultErrors::default(),
            apis_fixed_path: RuleTable::new(),
            apis_dynamic_path: RuleTable::new(),
            path_static: RuleTable::new(),
            path_static_server_exec: RuleTable::new(),
            sub_map: RuleTable::new(),
        }
    }
}

/// A top-level tenant: one folder under the web-source root, owning one or
/// more websites plus proxy/DNS mappings. The name is folder-derived and
/// never serialized back into the document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub project_desc: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub proxy_map: EnvTable,
    #[serde(default)]
    pub dns_names: EnvTable,
    #[serde(default)]
    pub websites: BTreeMap<String, Website>,
}

/// Global server configuration from server_conf.json.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConf {
    #[serde(default)]
    pub listen: ListenConf,
    #[serde(default = "web_source_dir")]
    pub web_source: String,
    #[serde(default = "system_dir")]
    pub system_root: String,
    #[serde(default = "logs_dir")]
    pub logs_dir: String,
    #[serde(default = "exec_upstream")]
    pub exec_upstream: String,
    #[serde(default)]
    pub mgmt_mode: bool,
    #[serde(default)]
    pub mgmt_ui: Vec<String>,
    #[serde(default = "environment_name")]
    pub environment: String,
    #[serde(default = "poll_interval")]
    pub poll_interval_secs: u64,
}

fn web_source_dir() -> String {
    "/data/web_source".to_string()
}
fn system_dir() -> String {
    "/data/system".to_string()
}
fn logs_dir() -> String {
    "/data/logs".to_string()
}
fn exec_upstream() -> String {
    "127.0.0.1:3100".to_string()
}
fn environment_name() -> String {
    "prod".to_string()
}
fn poll_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenConf {
    #[serde(default = "default_http_port")]
    pub http: u16,
    #[serde(default = "default_https_port")]
    pub https: u16,
}

fn default_http_port() -> u16 {
    80
}
fn default_https_port() -> u16 {
    443
}

impl Default for ListenConf {
    fn default() -> Self {
        ListenConf {
            http: default_http_port(),
            https: default_https_port(),
        }
    }
}

impl Default for ServerConf {
    fn default() -> Self {
        ServerConf {
            listen: ListenConf::default(),
            web_source: web_source_dir(),
            system_root: system_dir(),
            logs_dir: logs_dir(),
            exec_upstream: exec_upstream(),
            mgmt_mode: false,
            mgmt_ui: Vec::new(),
            environment: environment_name(),
            poll_interval_secs: poll_interval(),
        }
    }
}

impl ServerConf {
    /// Load the server configuration, falling back to defaults when the
    /// file is absent. A present-but-broken file is an error: silently
    /// routing every tenant with defaults would mask it.
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.is_file() {
            log::warn!("{} not found, using defaults", path.display());
            return Ok(ServerConf::default());
        }
        let content = std::fs::read_to_string(path)?;
        let conf: ServerConf = serde_json::from_str(&content)?;
        Ok(conf)
    }

    /// Active environment, defaulting to prod when the name is unknown.
    pub fn active_environment(&self) -> Environment {
        match Environment::parse(&self.environment) {
            Some(env) => env,
            None => {
                log::warn!(
                    "unknown environment '{}', assuming prod",
                    self.environment
                );
                Environment::Prod
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_file_detection() {
        assert!(is_script_file("handler.js"));
        assert!(is_script_file("worker.MJS"));
        assert!(is_script_file("a.b.cjs"));
        assert!(!is_script_file("index.html"));
        assert!(!is_script_file("no_extension"));
        assert!(!is_script_file("js"));
    }

    #[test]
    fn test_environment_parse_roundtrip() {
        for env in ENVIRONMENTS {
            assert_eq!(Environment::parse(env.as_str()), Some(env));
        }
        assert_eq!(Environment::parse("production"), None);
    }

    #[test]
    fn test_env_table_access() {
        let mut table = EnvTable::default();
        table
            .get_mut(Environment::Qa)
            .insert("/a/".to_string(), "site".to_string());
        assert_eq!(table.get(Environment::Qa).len(), 1);
        assert!(table.get(Environment::Prod).is_empty());
    }

    #[test]
    fn test_website_defaults() {
        let site = Website::default();
        assert!(site.ssl_redirect);
        assert!(!site.maintenance.get(Environment::Prod));
        assert!(site.default_doc.is_empty());
        assert!(site.sub_map.is_empty());
    }

    #[test]
    fn test_website_deserialize_fills_defaults() {
        let site: Website = serde_json::from_str("{}").unwrap();
        assert_eq!(site, Website::default());
    }

    #[test]
    fn test_error_docs_numeric_keys() {
        let docs: ErrorDocs =
            serde_json::from_str(r#"{"404": "nf.html", "500": "err.html"}"#).unwrap();
        assert_eq!(docs.not_found, "nf.html");
        assert_eq!(docs.server_error, "err.html");
    }

    #[test]
    fn test_server_conf_defaults() {
        let conf: ServerConf = serde_json::from_str("{}").unwrap();
        assert_eq!(conf.listen.http, 80);
        assert_eq!(conf.listen.https, 443);
        assert!(!conf.mgmt_mode);
        assert_eq!(conf.active_environment(), Environment::Prod);
        assert_eq!(conf.poll_interval_secs, 5);
    }

    #[test]
    fn test_server_conf_partial_listen() {
        let conf: ServerConf =
            serde_json::from_str(r#"{"listen": {"http": 8080}, "environment": "qa"}"#).unwrap();
        assert_eq!(conf.listen.http, 8080);
        assert_eq!(conf.listen.https, 443);
        assert_eq!(conf.active_environment(), Environment::Qa);
    }

    #[test]
    fn test_server_conf_unknown_environment_falls_back() {
        let conf: ServerConf = serde_json::from_str(r#"{"environment": "uat"}"#).unwrap();
        assert_eq!(conf.active_environment(), Environment::Prod);
    }

    #[test]
    fn test_server_conf_missing_file_uses_defaults() {
        let conf = ServerConf::load(Path::new("/nonexistent/server_conf.json")).unwrap();
        assert_eq!(conf.web_source, "/data/web_source");
    }

    #[test]
    fn test_system_files_cover_error_assets() {
        assert!(SYSTEM_FILES.contains(&SYSTEM_404));
        assert!(SYSTEM_FILES.contains(&SYSTEM_500));
        assert!(SYSTEM_FILES.contains(&SYSTEM_MAINTENANCE));
    }
}
