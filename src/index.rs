use crate::config::{
    join_rel, Environment, Project, ServerConf, Website, MGMT_NAME, SYSTEM_DEFAULT_DOC,
    VHOST_PREFIX, VHOST_SEPARATOR,
};
use crate::store::{self, Listing};
use crate::validate::{self, ProjectDiagnostics};
use std::collections::{BTreeMap, BTreeSet};
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

/// Owning (project, website) pair an index entry resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapTarget {
    pub project: String,
    pub website: String,
}

/// One pattern in a flattened lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternEntry {
    pub pattern: String,
    pub target: MapTarget,
}

/// Management-UI lookup tables, present only when management mode is on.
#[derive(Debug, Clone, Default)]
pub struct MgmtIndex {
    /// Hostnames that select the management UI (exact match, lowercase).
    pub hostnames: BTreeSet<String>,
    /// `/vhost/{project}::{website}/` preview paths, longest first.
    pub vhost_paths: Vec<PatternEntry>,
}

/// The immutable routing state one worker serves from. Rebuilds produce a
/// fresh value; publication is a pointer swap, never an in-place edit.
#[derive(Debug, Clone)]
pub struct RoutingSnapshot {
    pub environment: Environment,
    pub projects: BTreeMap<String, Project>,
    pub diagnostics: BTreeMap<String, ProjectDiagnostics>,
    pub mgmt: Option<MgmtIndex>,
    /// hostname+path prefix → target, longest pattern first.
    pub proxy_index: Vec<PatternEntry>,
    /// hostname → target, longest pattern first.
    pub dns_index: Vec<PatternEntry>,
    pub web_root: PathBuf,
    pub system_root: PathBuf,
    /// Store listing observed at build time, for change polling.
    pub listing: Listing,
}

impl RoutingSnapshot {
    /// Read, validate and index the whole web-source tree.
    pub fn rebuild(conf: &ServerConf) -> RoutingSnapshot {
        let web_root = Path::new(&conf.web_source);
        let raw = store::list_projects(web_root);
        let listing = store::listing_of(&raw);
        let (projects, diagnostics) = validate::validate_and_repair(&raw, web_root);
        RoutingSnapshot::build(projects, diagnostics, listing, conf)
    }

    /// Derive the lookup tables from validated projects.
    pub fn build(
        mut projects: BTreeMap<String, Project>,
        diagnostics: BTreeMap<String, ProjectDiagnostics>,
        listing: Listing,
        conf: &ServerConf,
    ) -> RoutingSnapshot {
        let environment = conf.active_environment();

        let mut proxy_index = Vec::new();
        let mut dns_index = Vec::new();
        for (name, project) in &projects {
            if !project.enabled {
                continue;
            }
            for (pattern, website) in project.proxy_map.get(environment) {
                proxy_index.push(PatternEntry {
                    pattern: pattern.clone(),
                    target: MapTarget {
                        project: name.clone(),
                        website: website.clone(),
                    },
                });
            }
            for (pattern, website) in project.dns_names.get(environment) {
                dns_index.push(PatternEntry {
                    pattern: pattern.clone(),
                    target: MapTarget {
                        project: name.clone(),
                        website: website.clone(),
                    },
                });
            }
        }
        sort_longest_first(&mut proxy_index);
        sort_longest_first(&mut dns_index);

        let mgmt = if conf.mgmt_mode {
            // Preview paths cover every pair, disabled projects included:
            // preview is how an administrator inspects a site that is not
            // live yet.
            let mut vhost_paths = Vec::new();
            for (name, project) in &projects {
                for website in project.websites.keys() {
                    vhost_paths.push(PatternEntry {
                        pattern: vhost_path(name, website),
                        target: MapTarget {
                            project: name.clone(),
                            website: website.clone(),
                        },
                    });
                }
            }
            sort_longest_first(&mut vhost_paths);

            projects.insert(MGMT_NAME.to_string(), mgmt_project());

            Some(MgmtIndex {
                hostnames: mgmt_hostnames(&conf.mgmt_ui),
                vhost_paths,
            })
        } else {
            None
        };

        RoutingSnapshot {
            environment,
            projects,
            diagnostics,
            mgmt,
            proxy_index,
            dns_index,
            web_root: PathBuf::from(&conf.web_source),
            system_root: PathBuf::from(&conf.system_root),
            listing,
        }
    }

    pub fn website(&self, project: &str, website: &str) -> Option<&Website> {
        self.projects
            .get(project)
            .and_then(|p| p.websites.get(website))
    }

    /// Root directory routing-table targets of this project resolve under.
    /// The synthetic management project serves out of the system folder.
    pub fn project_root(&self, project: &str) -> PathBuf {
        if project == MGMT_NAME {
            self.system_root.clone()
        } else {
            self.web_root.join(project)
        }
    }

    pub fn website_root(&self, project: &str, website: &str) -> PathBuf {
        if project == MGMT_NAME {
            self.system_root.clone()
        } else {
            self.web_root.join(project).join(website)
        }
    }

    pub fn system_file(&self, rel: &str) -> PathBuf {
        join_rel(&self.system_root, rel)
    }
}

/// `/vhost/{project}::{website}/`
pub fn vhost_path(project: &str, website: &str) -> String {
    format!("{}{}{}{}/", VHOST_PREFIX, project, VHOST_SEPARATOR, website)
}

/// The synthetic management-UI project: one website serving the management
/// application out of the system folder.
fn mgmt_project() -> Project {
    let mut site = Website::default();
    site.default_doc = SYSTEM_DEFAULT_DOC.to_string();
    site.path_static.insert("/".to_string(), "/".to_string());

    let mut websites = BTreeMap::new();
    websites.insert(MGMT_NAME.to_string(), site);

    Project {
        name: MGMT_NAME.to_string(),
        project_desc: "built-in management UI".to_string(),
        enabled: true,
        websites,
        ..Project::default()
    }
}

/// Hostnames that reach the management UI: machine hostname, loopback
/// names, whatever the hostname resolves to locally, plus configured
/// extras. Deduplicated and lowercased.
fn mgmt_hostnames(extra: &[String]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    names.insert("localhost".to_string());
    names.insert("127.0.0.1".to_string());
    names.insert("::1".to_string());

    if let Some(host) = local_hostname() {
        if let Ok(addrs) = (host.as_str(), 0u16).to_socket_addrs() {
            for addr in addrs {
                names.insert(addr.ip().to_string());
            }
        }
        names.insert(host.to_lowercase());
    }

    for name in extra {
        if !name.is_empty() {
            names.insert(name.to_lowercase());
        }
    }

    names
}

fn local_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec()).ok()
}

/// Longest pattern first, so a more specific prefix is always tried before
/// one that would shadow it. Ties break lexicographically to keep rebuild
/// output deterministic.
fn sort_longest_first(entries: &mut [PatternEntry]) {
    entries.sort_by(|a, b| {
        b.pattern
            .len()
            .cmp(&a.pattern.len())
            .then_with(|| a.pattern.cmp(&b.pattern))
    });
}
