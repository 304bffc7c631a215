//! Extension loader: process-global name→implementation discovery for
//! codecs, compressors, and balancers via `META-INF`-style descriptor
//! resources (spec.md §4.4, §6).

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};

use crate::RpcError;

/// Parses one descriptor file's body: `name=impl` lines, blank/`#` lines
/// ignored, duplicate names resolve to the first occurrence (spec.md §4.4,
/// §6). Pure function so it's testable without touching the filesystem.
pub fn parse_descriptor(body: &str) -> Vec<(String, String)> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name, implementation)) = line.split_once('=') else {
            continue;
        };
        let name = name.trim().to_string();
        if seen.insert(name.clone()) {
            out.push((name, implementation.trim().to_string()));
        }
    }
    out
}

/// A single capability's registered implementations, keyed by name. The
/// first-declared entry is the default extension (spec.md §4.4; resolved to
/// "random" as the default load-balancer extension per SPEC_FULL §9).
pub struct Capability<T> {
    by_name: HashMap<String, Arc<T>>,
    default_name: Option<String>,
}

impl<T> Capability<T> {
    pub fn new() -> Self {
        Self {
            by_name: HashMap::new(),
            default_name: None,
        }
    }

    pub fn register(&mut self, name: impl Into<String>, implementation: Arc<T>) {
        let name = name.into();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.by_name.insert(name, implementation);
    }

    pub fn get(&self, name: &str) -> crate::Result<Arc<T>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::ExtensionNotFound(name.to_string()))
    }

    pub fn get_default(&self) -> crate::Result<Arc<T>> {
        let name = self
            .default_name
            .as_ref()
            .ok_or_else(|| RpcError::ExtensionNotFound("<no default>".to_string()))?;
        self.get(name)
    }
}

impl<T> Default for Capability<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-global registry keyed by capability interface (spec.md §4.4).
/// Instantiation errors surface at first lookup, not at load time, since
/// loading only parses descriptor text.
pub struct ExtensionLoader {
    descriptors: RwLock<HashMap<String, Vec<(String, String)>>>,
}

impl ExtensionLoader {
    pub fn new() -> Self {
        Self {
            descriptors: RwLock::new(HashMap::new()),
        }
    }

    /// Loads every descriptor file under `dir`, one file per capability,
    /// named after the capability (spec.md §4.4 "one descriptor file
    /// mapping names to implementations for one capability").
    pub fn load_from_dir(&self, dir: &Path) -> crate::Result<()> {
        let entries = fs::read_dir(dir).map_err(RpcError::Io)?;
        let mut guard = self.descriptors.write().unwrap();
        for entry in entries {
            let entry = entry.map_err(RpcError::Io)?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let capability = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let body = fs::read_to_string(&path).map_err(RpcError::Io)?;
            guard.insert(capability, parse_descriptor(&body));
        }
        Ok(())
    }

    pub fn names_for(&self, capability: &str) -> Vec<(String, String)> {
        self.descriptors
            .read()
            .unwrap()
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for ExtensionLoader {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_EXTENSION_LOADER: OnceLock<ExtensionLoader> = OnceLock::new();

/// The single process-wide extension loader (spec.md §6: "process-wide
/// state ... `ExtensionLoader` ... process-singletons"). Callers that want
/// explicit lifetime control should construct their own `ExtensionLoader`
/// instead of using this accessor.
pub fn global() -> &'static ExtensionLoader {
    GLOBAL_EXTENSION_LOADER.get_or_init(ExtensionLoader::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_equals_impl_lines_skipping_comments_and_blanks() {
        let body = "# comment\n\nrandom=balancer::Random\nround_robin=balancer::RoundRobin\n";
        let parsed = parse_descriptor(body);
        assert_eq!(
            parsed,
            vec![
                ("random".to_string(), "balancer::Random".to_string()),
                ("round_robin".to_string(), "balancer::RoundRobin".to_string()),
            ]
        );
    }

    #[test]
    fn duplicate_names_resolve_to_first_occurrence() {
        let body = "random=First\nrandom=Second\n";
        let parsed = parse_descriptor(body);
        assert_eq!(parsed, vec![("random".to_string(), "First".to_string())]);
    }

    #[test]
    fn capability_default_is_first_registered() {
        let mut cap: Capability<u32> = Capability::new();
        cap.register("a", Arc::new(1));
        cap.register("b", Arc::new(2));
        assert_eq!(*cap.get_default().unwrap(), 1);
        assert_eq!(*cap.get("b").unwrap(), 2);
    }

    #[test]
    fn missing_name_is_extension_not_found() {
        let cap: Capability<u32> = Capability::new();
        assert!(matches!(
            cap.get("missing"),
            Err(RpcError::ExtensionNotFound(_))
        ));
    }
}
