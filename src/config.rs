//! Factory configuration.
//!
//! | Variable                 | Field       | Default                 |
//! |--------------------------|-------------|-------------------------|
//! | `AUTODIFF_JIT_CACHE_DIR` | `cache_dir` | `<tmp>/autodiff-jit`    |
//! | `AUTODIFF_JIT_LINKER`    | `linker`    | `$CC`, then `cc`        |

use std::env;
use std::path::{Path, PathBuf};

use crate::compiler::Toolchain;

pub const CACHE_DIR_VAR: &str = "AUTODIFF_JIT_CACHE_DIR";
pub const LINKER_VAR: &str = "AUTODIFF_JIT_LINKER";

/// Configuration of a [`FunctionFactory`](crate::FunctionFactory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryConfig {
    /// Root of the persistent compilation cache
    pub cache_dir: PathBuf,
    /// C compiler driver used to link shared libraries
    pub linker: String,
    /// Extra arguments passed to the linker
    pub link_args: Vec<String>,
    /// Keep the intermediate object file next to the library
    pub keep_objects: bool,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            cache_dir: env::temp_dir().join("autodiff-jit"),
            linker: "cc".to_string(),
            link_args: Vec::new(),
            keep_objects: false,
        }
    }
}

impl FactoryConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Defaults overridden by `lookup`; empty values are ignored.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();
        if let Some(dir) = get(CACHE_DIR_VAR) {
            config.cache_dir = PathBuf::from(dir);
        }
        if let Some(linker) = get(LINKER_VAR).or_else(|| get("CC")) {
            config.linker = linker;
        }
        config
    }

    pub fn with_cache_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cache_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_linker(mut self, linker: impl Into<String>) -> Self {
        self.linker = linker.into();
        self
    }

    pub fn with_link_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.link_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keep_objects(mut self, keep: bool) -> Self {
        self.keep_objects = keep;
        self
    }

    pub fn toolchain(&self) -> Toolchain {
        Toolchain::new(self.linker.clone(), self.link_args.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FactoryConfig::from_vars(vars(&[]));
        assert_eq!(config, FactoryConfig::default());
        assert!(config.cache_dir.ends_with("autodiff-jit"));
        assert_eq!(config.linker, "cc");
    }

    #[test]
    fn test_overrides() {
        let config = FactoryConfig::from_vars(vars(&[
            (CACHE_DIR_VAR, "/var/cache/adjit"),
            ("CC", "clang"),
        ]));
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/adjit"));
        assert_eq!(config.linker, "clang");

        let config = FactoryConfig::from_vars(vars(&[(LINKER_VAR, "gcc"), ("CC", "clang")]));
        assert_eq!(config.linker, "gcc");
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config = FactoryConfig::from_vars(vars(&[(CACHE_DIR_VAR, "  "), (LINKER_VAR, "")]));
        assert_eq!(config, FactoryConfig::default());
    }

    #[test]
    fn test_builder() {
        let config = FactoryConfig::default()
            .with_cache_dir("/tmp/x")
            .with_linker("clang")
            .with_link_args(["-Wl,-s"])
            .with_keep_objects(true);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/x"));
        assert!(config.keep_objects);
        assert_eq!(config.toolchain(), Toolchain::new("clang", vec!["-Wl,-s".into()]));
    }
}
