//! Guest script module bundle.
//!
//! A bundle directory holds a `versions.json` index and one subdirectory per
//! version set:
//!
//! ```text
//! modules/
//!   versions.json          {"default": "v5", "versions": {"v5": {...}}}
//!   v5/manifest.json       {"modules": [{"name", "filename", "sha256", "dependencies"}]}
//!   v5/vega.js
//!   v5/bridge.js
//! ```
//!
//! Modules are ordered once, here, with Kahn's algorithm. Ties between ready
//! modules are broken by name so the registration order is reproducible.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Module every bundle must provide; render calls import it.
pub const BRIDGE_MODULE: &str = "bridge";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionIndex {
    pub default: String,
    pub versions: BTreeMap<String, VersionInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    #[serde(default)]
    pub vega_version: String,
    #[serde(default)]
    pub vega_lite_version: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    modules: Vec<ManifestModule>,
}

#[derive(Debug, Deserialize)]
struct ManifestModule {
    name: String,
    filename: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// One guest module with its declared dependency edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSource {
    pub name: String,
    pub source: String,
    pub dependencies: Vec<String>,
}

impl ModuleSource {
    pub fn new(name: impl Into<String>, source: impl Into<String>, dependencies: &[&str]) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
        }
    }
}

/// Guest modules in registration order.
#[derive(Debug, Clone)]
pub struct ModuleBundle {
    version: String,
    modules: Vec<ModuleSource>,
}

impl ModuleBundle {
    /// Order in-memory modules by their dependency edges.
    pub fn from_sources(version: impl Into<String>, modules: Vec<ModuleSource>) -> Result<Self, Error> {
        let order = load_order(&modules)?;
        let mut slots: Vec<Option<ModuleSource>> = modules.into_iter().map(Some).collect();
        let modules = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(Self {
            version: version.into(),
            modules,
        })
    }

    /// Read a version set from a bundle directory. `version = None` picks the
    /// index default.
    pub fn from_dir(dir: impl AsRef<Path>, version: Option<&str>) -> Result<Self, Error> {
        let dir = dir.as_ref();
        let index = read_index(dir)?;
        let version = version.unwrap_or(&index.default).to_string();
        if !index.versions.contains_key(&version) {
            return Err(Error::Construction(format!(
                "unknown version {:?} (available: {:?})",
                version,
                index.versions.keys().collect::<Vec<_>>()
            )));
        }

        let version_dir = dir.join(&version);
        let manifest: Manifest = read_json(&version_dir.join("manifest.json"))?;

        let mut modules = Vec::with_capacity(manifest.modules.len());
        for entry in manifest.modules {
            let path = version_dir.join(&entry.filename);
            let source = std::fs::read_to_string(&path).map_err(|e| {
                Error::Construction(format!("reading module {}: {}", entry.name, e))
            })?;
            if let Some(expected) = &entry.sha256 {
                verify_checksum(&entry.name, &source, expected)?;
            }
            modules.push(ModuleSource {
                name: entry.name,
                source,
                dependencies: entry.dependencies,
            });
        }

        Self::from_sources(version, modules)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn modules(&self) -> &[ModuleSource] {
        &self.modules
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m.name == name)
    }
}

/// Version sets available in a bundle directory.
pub fn available_versions(dir: impl AsRef<Path>) -> Result<BTreeMap<String, VersionInfo>, Error> {
    Ok(read_index(dir.as_ref())?.versions)
}

fn read_index(dir: &Path) -> Result<VersionIndex, Error> {
    read_json(&dir.join("versions.json"))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, Error> {
    let data = std::fs::read(path)
        .map_err(|e| Error::Construction(format!("reading {}: {}", path.display(), e)))?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::Construction(format!("parsing {}: {}", path.display(), e)))
}

fn verify_checksum(name: &str, source: &str, expected: &str) -> Result<(), Error> {
    let digest = Sha256::digest(source.as_bytes());
    let actual: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(Error::Construction(format!(
            "checksum mismatch for module {}: expected {}, got {}",
            name, expected, actual
        )));
    }
    Ok(())
}

/// Topological order (indices into `modules`), dependencies first.
///
/// Errors on duplicate names, dependencies outside the set, and cycles.
pub fn load_order(modules: &[ModuleSource]) -> Result<Vec<usize>, Error> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(modules.len());
    for (i, module) in modules.iter().enumerate() {
        if index.insert(module.name.as_str(), i).is_some() {
            return Err(Error::Construction(format!("duplicate module {}", module.name)));
        }
    }

    let mut in_degree = vec![0usize; modules.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); modules.len()];
    for (i, module) in modules.iter().enumerate() {
        for dep in &module.dependencies {
            let &d = index.get(dep.as_str()).ok_or_else(|| {
                Error::Construction(format!(
                    "module {} depends on unknown module {}",
                    module.name, dep
                ))
            })?;
            dependents[d].push(i);
            in_degree[i] += 1;
        }
    }

    let mut ready: BTreeSet<(&str, usize)> = modules
        .iter()
        .enumerate()
        .filter(|(i, _)| in_degree[*i] == 0)
        .map(|(i, m)| (m.name.as_str(), i))
        .collect();

    let mut order = Vec::with_capacity(modules.len());
    while let Some((_, node)) = ready.pop_first() {
        order.push(node);
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert((modules[dependent].name.as_str(), dependent));
            }
        }
    }

    if order.len() != modules.len() {
        let stuck: Vec<&str> = modules
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, m)| m.name.as_str())
            .collect();
        return Err(Error::Construction(format!(
            "module dependency cycle among {:?}",
            stuck
        )));
    }

    Ok(order)
}
