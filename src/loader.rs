//! Module loader that only serves modules from the guest bundle.
//! Blocks all network and filesystem imports.

use anyhow::{anyhow, Error};
use deno_core::{
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::modules::ModuleBundle;

/// Scheme used for bundle module specifiers (`guest:vega`).
pub const GUEST_SCHEME: &str = "guest";

pub fn guest_specifier(name: &str) -> Result<ModuleSpecifier, Error> {
    ModuleSpecifier::parse(&format!("{}:{}", GUEST_SCHEME, name))
        .map_err(|e| anyhow!("Invalid module name '{}': {}", name, e))
}

/// A module loader that resolves bare names to bundle modules.
///
/// Security guarantees:
/// - No remote imports (http/https/data/blob rejected)
/// - No filesystem imports (file URLs and paths rejected)
/// - A module can only be imported once it has been registered, so every
///   import must follow a declared dependency edge
pub struct BundleLoader {
    sources: HashMap<String, String>,
    registered: RefCell<HashSet<String>>,
}

impl BundleLoader {
    pub fn new(bundle: &ModuleBundle) -> Self {
        Self {
            sources: bundle
                .modules()
                .iter()
                .map(|m| (m.name.clone(), m.source.clone()))
                .collect(),
            registered: RefCell::new(HashSet::new()),
        }
    }

    /// Record that `name` has been registered with the engine.
    pub fn mark_registered(&self, name: &str) {
        self.registered.borrow_mut().insert(name.to_string());
    }

    fn module_name(specifier: &ModuleSpecifier) -> Option<&str> {
        (specifier.scheme() == GUEST_SCHEME).then(|| specifier.path())
    }
}

impl ModuleLoader for BundleLoader {
    fn resolve(
        &self,
        specifier: &str,
        _referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        if let Ok(url) = ModuleSpecifier::parse(specifier) {
            if url.scheme() == GUEST_SCHEME {
                return Ok(url);
            }
            return Err(anyhow!("Imports outside the guest bundle are forbidden: {}", specifier));
        }

        if specifier.starts_with('.') || specifier.starts_with('/') {
            return Err(anyhow!("Path imports are forbidden: {}", specifier));
        }

        if !self.sources.contains_key(specifier) {
            return Err(anyhow!("Unknown guest module: {}", specifier));
        }

        guest_specifier(specifier)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let specifier = module_specifier.clone();

        let Some(name) = Self::module_name(&specifier) else {
            return ModuleLoadResponse::Sync(Err(anyhow!("Access denied: {}", specifier)));
        };

        if !self.registered.borrow().contains(name) {
            return ModuleLoadResponse::Sync(Err(anyhow!(
                "Module '{}' imported before registration; declare it as a dependency",
                name
            )));
        }

        let code = match self.sources.get(name) {
            Some(code) => code.clone(),
            None => {
                return ModuleLoadResponse::Sync(Err(anyhow!("Unknown guest module: {}", name)));
            }
        };

        ModuleLoadResponse::Sync(Ok(ModuleSource::new(
            ModuleType::JavaScript,
            ModuleSourceCode::String(code.into()),
            &specifier,
            None,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::ModuleSource;

    fn loader() -> BundleLoader {
        let bundle = ModuleBundle::from_sources(
            "v1",
            vec![
                ModuleSource::new("vega", "export default 1;", &[]),
                ModuleSource::new("bridge", "import 'vega';", &["vega"]),
            ],
        )
        .unwrap();
        BundleLoader::new(&bundle)
    }

    fn load_sync(loader: &BundleLoader, specifier: &ModuleSpecifier) -> Result<deno_core::ModuleSource, Error> {
        match loader.load(specifier, None, false, RequestedModuleType::None) {
            ModuleLoadResponse::Sync(result) => result,
            ModuleLoadResponse::Async(_) => panic!("bundle loads are synchronous"),
        }
    }

    #[test]
    fn test_resolves_bundle_names() {
        let loader = loader();
        let resolved = loader.resolve("vega", "guest:bridge", ResolutionKind::Import).unwrap();
        assert_eq!(resolved.as_str(), "guest:vega");
    }

    #[test]
    fn test_blocks_remote_and_path_imports() {
        let loader = loader();
        for specifier in [
            "https://evil.com/payload.js",
            "file:///etc/passwd",
            "data:text/javascript,export default 1",
            "./vega.js",
            "../../etc/passwd",
            "/etc/passwd",
            "unknown-module",
        ] {
            let result = loader.resolve(specifier, "guest:bridge", ResolutionKind::Import);
            assert!(result.is_err(), "{specifier}");
        }
    }

    #[test]
    fn test_load_requires_registration() {
        let loader = loader();
        let specifier = guest_specifier("vega").unwrap();

        let err = load_sync(&loader, &specifier).err().unwrap();
        assert!(err.to_string().contains("before registration"));

        loader.mark_registered("vega");
        assert!(load_sync(&loader, &specifier).is_ok());
    }
}
