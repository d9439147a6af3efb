//! Per-distro shell templates for every orchestration step.
//!
//! Templates are keyed `{distro}_{step}`. Defaults are compiled into the binary from
//! `scripts/`; edits made at runtime are persisted and overlay the defaults on load.
//!
//! Rendering does two passes over the template text:
//! 1. every `# >>> repo:<name>` .. `# <<< repo:<name>` block is replaced wholesale by the
//!    repository configuration for the distro's package family. Official and mirror
//!    sources differ in path layout, so the block is regenerated rather than patched.
//! 2. `${placeholder}` names are substituted. Names that are not supplied stay verbatim.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};

use crate::database::{RecordStore, TEMPLATES};
use crate::error::TemplateError;

pub const PREFLIGHT: &str = "preflight";
pub const INSTALL_DOCKER: &str = "install_docker";
pub const INSTALL_CONTAINERD: &str = "install_containerd";
pub const INSTALL_KUBEADM: &str = "install_kubeadm";
pub const PULL_IMAGES: &str = "pull_images";
pub const INIT_MASTER: &str = "init_master";
pub const INSTALL_NETWORK: &str = "install_network";
pub const JOIN_WORKER: &str = "join_worker";
pub const RESET: &str = "reset";
pub const DETECT_RUNTIME: &str = "detect_runtime";

const APT_DISTROS: &[&str] = &["ubuntu", "debian"];
const RPM_DISTROS: &[&str] = &["centos", "rocky"];

const OFFICIAL_DOCKER: &str = "https://download.docker.com";
const OFFICIAL_KUBERNETES: &str = "https://pkgs.k8s.io";

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\$\{([a-z][a-z0-9_]*)\}").unwrap();
    static ref VERSION: Regex = Regex::new(r"^v?(\d+\.\d+\.\d+)$").unwrap();
}

#[derive(RustEmbed)]
#[folder = "scripts/"]
struct DefaultScripts;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFamily {
    Apt,
    Rpm,
}

impl PackageFamily {
    pub fn for_distro(distro: &str) -> Option<Self> {
        match distro {
            "ubuntu" | "debian" => Some(PackageFamily::Apt),
            "centos" | "rocky" | "rhel" | "almalinux" | "fedora" => Some(PackageFamily::Rpm),
            _ => None,
        }
    }
}

/// Values substituted into a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderParams {
    /// Kubernetes version without the leading `v`, e.g. `1.30.2`.
    #[serde(default)]
    pub version: String,
    /// Mirror site root; `None` renders the official sources.
    #[serde(default)]
    pub repo_url: Option<String>,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl RenderParams {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Self::default()
        }
    }

    pub fn with_repo(mut self, repo_url: Option<String>) -> Self {
        self.repo_url = repo_url;
        self
    }

    pub fn var(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.insert(name.to_string(), value.into());
        self
    }
}

pub fn template_key(distro: &str, step: &str) -> String {
    format!("{distro}_{step}")
}

/// Split `{distro}_{step}`. Distro names never contain `_`; step ids may.
pub fn parse_key(key: &str) -> Result<(&str, &str), TemplateError> {
    match key.split_once('_') {
        Some((distro, step)) if !distro.is_empty() && !step.is_empty() => Ok((distro, step)),
        _ => Err(TemplateError::MalformedKey(key.to_string())),
    }
}

pub struct ScriptTemplateStore {
    store: Arc<dyn RecordStore>,
    templates: RwLock<BTreeMap<String, String>>,
}

impl ScriptTemplateStore {
    /// A store holding only the compiled-in defaults. Call [`load`](Self::load) to overlay
    /// persisted edits.
    pub fn with_defaults(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            templates: RwLock::new(default_templates()),
        }
    }

    /// Overlay persisted templates on the in-memory set. Returns how many were loaded.
    pub fn load(&self) -> anyhow::Result<usize> {
        let persisted = self.store.list(TEMPLATES)?;
        let mut templates = self.write();
        let mut count = 0;
        for (key, value) in persisted {
            match value.as_str() {
                Some(text) if parse_key(&key).is_ok() => {
                    templates.insert(key, text.to_string());
                    count += 1;
                }
                _ => tracing::warn!("Skipping malformed stored template '{}'", key),
            }
        }
        tracing::info!("Loaded {} persisted script templates", count);
        Ok(count)
    }

    /// Persist the whole in-memory set.
    pub fn save(&self) -> anyhow::Result<()> {
        let templates = self.read().clone();
        for (key, text) in &templates {
            self.store.put(TEMPLATES, key, &serde_json::Value::String(text.clone()))?;
        }
        Ok(())
    }

    /// Replace the given templates. New text applies to renders from now on; commands
    /// already rendered are unaffected.
    pub fn update(&self, changes: BTreeMap<String, String>) -> Result<usize, TemplateError> {
        for key in changes.keys() {
            parse_key(key)?;
        }
        let mut templates = self.write();
        for (key, text) in &changes {
            self.store
                .put(TEMPLATES, key, &serde_json::Value::String(text.clone()))
                .map_err(|e| TemplateError::Persist(e.to_string()))?;
            templates.insert(key.clone(), text.clone());
        }
        tracing::info!("Updated {} script templates", changes.len());
        Ok(changes.len())
    }

    pub fn get(&self, distro: &str, step: &str) -> Option<String> {
        self.read().get(&template_key(distro, step)).cloned()
    }

    pub fn all(&self) -> BTreeMap<String, String> {
        self.read().clone()
    }

    pub fn render(
        &self,
        distro: &str,
        step: &str,
        params: &RenderParams,
    ) -> Result<String, TemplateError> {
        let text = self.get(distro, step).ok_or_else(|| TemplateError::NotFound {
            distro: distro.to_string(),
            step: step.to_string(),
        })?;
        render_text(&text, distro, params)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, String>> {
        match self.templates.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, String>> {
        match self.templates.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Expand the embedded `scripts/{apt,rpm,common}/<step>.sh` files into per-distro keys.
fn default_templates() -> BTreeMap<String, String> {
    let mut templates = BTreeMap::new();
    for path in DefaultScripts::iter() {
        let Some(file) = DefaultScripts::get(&path) else {
            continue;
        };
        let Some((group, name)) = path.split_once('/') else {
            continue;
        };
        let Some(step) = name.strip_suffix(".sh") else {
            continue;
        };
        let text = String::from_utf8_lossy(&file.data).into_owned();

        let distros: Vec<&str> = match group {
            "apt" => APT_DISTROS.to_vec(),
            "rpm" => RPM_DISTROS.to_vec(),
            "common" => APT_DISTROS.iter().chain(RPM_DISTROS).copied().collect(),
            _ => continue,
        };
        for distro in distros {
            templates.insert(template_key(distro, step), text.clone());
        }
    }
    templates
}

/// Pure rendering of one template text.
pub fn render_text(text: &str, distro: &str, params: &RenderParams) -> Result<String, TemplateError> {
    let with_repos = replace_repo_blocks(text, distro, params)?;
    Ok(substitute(&with_repos, params))
}

fn substitute(text: &str, params: &RenderParams) -> String {
    PLACEHOLDER
        .replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            match name {
                "version" => params.version.clone(),
                "kube_minor" => kube_minor(&params.version),
                _ => params
                    .vars
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| caps[0].to_string()),
            }
        })
        .into_owned()
}

fn replace_repo_blocks(text: &str, distro: &str, params: &RenderParams) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let Some(name) = line.trim().strip_prefix("# >>> repo:") else {
            out.push_str(line);
            out.push('\n');
            continue;
        };
        let name = name.trim().to_string();
        let end = format!("# <<< repo:{name}");

        let mut body = Vec::new();
        let mut terminated = false;
        for inner in lines.by_ref() {
            if inner.trim() == end {
                terminated = true;
                break;
            }
            body.push(inner);
        }
        if !terminated {
            return Err(TemplateError::UnterminatedBlock(name));
        }

        let family = PackageFamily::for_distro(distro)
            .ok_or_else(|| TemplateError::UnsupportedDistro(distro.to_string()))?;
        match repo_block(family, distro, &name, params) {
            Some(generated) => out.push_str(&generated),
            None => {
                // Unknown repository names keep their hand-written body.
                for inner in body {
                    out.push_str(inner);
                    out.push('\n');
                }
            }
        }
    }

    if !text.ends_with('\n') && out.ends_with('\n') {
        out.pop();
    }
    Ok(out)
}

fn repo_block(family: PackageFamily, distro: &str, name: &str, params: &RenderParams) -> Option<String> {
    let mirror = params
        .repo_url
        .as_deref()
        .map(|u| u.trim_end_matches('/'))
        .filter(|u| !u.is_empty());

    match name {
        "docker" => {
            // Docker publishes RHEL-family packages under the centos tree.
            let tree = match family {
                PackageFamily::Apt => distro,
                PackageFamily::Rpm => "centos",
            };
            let base = match mirror {
                Some(root) => format!("{root}/docker-ce/linux/{tree}"),
                None => format!("{OFFICIAL_DOCKER}/linux/{tree}"),
            };
            Some(match family {
                PackageFamily::Apt => format!(
                    "install -m 0755 -d /etc/apt/keyrings\n\
                     curl -fsSL {base}/gpg | gpg --dearmor --yes -o /etc/apt/keyrings/docker.gpg\n\
                     echo \"deb [arch=$(dpkg --print-architecture) signed-by=/etc/apt/keyrings/docker.gpg] {base} $(. /etc/os-release && echo \"$VERSION_CODENAME\") stable\" > /etc/apt/sources.list.d/docker.list\n"
                ),
                PackageFamily::Rpm => format!(
                    "cat > /etc/yum.repos.d/docker-ce.repo <<'REPO'\n\
                     [docker-ce-stable]\n\
                     name=Docker CE Stable\n\
                     baseurl={base}/$releasever/$basearch/stable\n\
                     enabled=1\n\
                     gpgcheck=1\n\
                     gpgkey={base}/gpg\n\
                     REPO\n"
                ),
            })
        }
        "kubernetes" => {
            let minor = kube_minor(&params.version);
            let format = match family {
                PackageFamily::Apt => "deb",
                PackageFamily::Rpm => "rpm",
            };
            // pkgs.k8s.io uses `core:/stable:/` segments; mirrors flatten them.
            let base = match mirror {
                Some(root) => format!("{root}/kubernetes-new/core/stable/{minor}/{format}/"),
                None => format!("{OFFICIAL_KUBERNETES}/core:/stable:/{minor}/{format}/"),
            };
            Some(match family {
                PackageFamily::Apt => format!(
                    "install -m 0755 -d /etc/apt/keyrings\n\
                     curl -fsSL {base}Release.key | gpg --dearmor --yes -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg\n\
                     echo \"deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] {base} /\" > /etc/apt/sources.list.d/kubernetes.list\n"
                ),
                PackageFamily::Rpm => format!(
                    "cat > /etc/yum.repos.d/kubernetes.repo <<'REPO'\n\
                     [kubernetes]\n\
                     name=Kubernetes\n\
                     baseurl={base}\n\
                     enabled=1\n\
                     gpgcheck=1\n\
                     gpgkey={base}repodata/repomd.xml.key\n\
                     exclude=kubelet kubeadm kubectl cri-tools kubernetes-cni\n\
                     REPO\n"
                ),
            })
        }
        _ => None,
    }
}

/// `1.30.2` or `v1.30.2` -> `1.30.2`; anything else is `None`.
pub fn normalize_version(version: &str) -> Option<String> {
    VERSION
        .captures(version.trim())
        .map(|caps| caps[1].to_string())
}

/// `1.30.2` or `v1.30.2` -> `v1.30`.
pub fn kube_minor(version: &str) -> String {
    let trimmed = version.trim().trim_start_matches('v');
    let mut parts = trimmed.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("v{major}.{minor}"),
        _ => format!("v{trimmed}"),
    }
}
