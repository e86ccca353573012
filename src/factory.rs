//! Turning blueprints into loaded functions.
//!
//! [`FunctionFactory::make`] runs the whole pipeline for one blueprint:
//!
//! 1. take the in-process writer lock of the blueprint's fingerprint
//! 2. reuse a structurally valid cache entry unless a rebuild is forced
//! 3. otherwise trace the body, derive the requested derivative graphs, lower them to
//!    Cranelift IR, link a shared library and publish it in the cache
//! 4. load the library with a fresh handle and check it against the blueprint
//!
//! A process-wide factory configured from the environment backs [`make`].

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{OnceLock, PoisonError};
use std::time::Instant;

use crate::ad::{self, reverse};
use crate::artifact::{EntryPoint, Layout, LoadedArtifact};
use crate::blueprint::{Blueprint, Body};
use crate::cache::{CacheEntry, CompilationCache, Manifest};
use crate::codegen;
use crate::compiler::{library_file_name, Toolchain};
use crate::config::FactoryConfig;
use crate::errors::{CacheError, FunctionError};
use crate::function::Function;

/// Counters of a [`FunctionFactory`] since its creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FactoryStats {
    /// Artifacts built and published
    pub compilations: usize,
    /// Requests served from the cache
    pub cache_hits: usize,
    /// Libraries loaded
    pub loads: usize,
}

/// Builds [`Function`]s from [`Blueprint`]s, backed by a persistent cache.
#[derive(Debug)]
pub struct FunctionFactory {
    config: FactoryConfig,
    cache: CompilationCache,
    toolchain: Toolchain,
    compilations: AtomicUsize,
    cache_hits: AtomicUsize,
    loads: AtomicUsize,
}

impl FunctionFactory {
    pub fn new(config: FactoryConfig) -> Self {
        Self {
            cache: CompilationCache::new(&config.cache_dir),
            toolchain: config.toolchain(),
            config,
            compilations: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
        }
    }

    /// Factory configured by [`FactoryConfig::from_env`].
    pub fn from_env() -> Self {
        Self::new(FactoryConfig::from_env())
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    pub fn cache(&self) -> &CompilationCache {
        &self.cache
    }

    pub fn stats(&self) -> FactoryStats {
        FactoryStats {
            compilations: self.compilations.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
        }
    }

    /// Returns a loaded [`Function`] for `blueprint`, compiling it first if needed.
    ///
    /// With `force_rebuild` the cache is bypassed and the published entry replaced.
    /// Concurrent calls for the same fingerprint build once; the others wait and then hit
    /// the cache.
    ///
    /// # Errors
    /// - `TracingError` if the body cannot be traced or behaves differently for `f64`
    /// - `InvalidBlueprint` if HESSIAN is enabled for a body with more than one output
    /// - `CodeGenError`, `CompilationError` or `Cache` if building or publishing fails
    /// - `LoadError` or `ArtifactMismatch` if the library cannot be loaded or does not
    ///   match the blueprint
    ///
    /// # Example
    /// ```no_run
    /// use autodiff_jit::prelude::*;
    ///
    /// struct Norm;
    ///
    /// impl Body for Norm {
    ///     fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
    ///         vec![squared_norm(x)]
    ///     }
    /// }
    ///
    /// let factory = FunctionFactory::from_env();
    /// let blueprint = Blueprint::new(Norm, 3, 0, "norm", EnabledDerivatives::JACOBIAN).unwrap();
    /// let function = factory.make(&blueprint, false).unwrap();
    /// let jacobian: Vec<Vec<f64>> = function.jacobian(&[1.0, 2.0, 3.0]).unwrap();
    /// assert_eq!(jacobian, vec![vec![2.0, 4.0, 6.0]]);
    /// ```
    pub fn make<B: Body>(
        &self,
        blueprint: &Blueprint<B>,
        force_rebuild: bool,
    ) -> Result<Function, FunctionError> {
        let fingerprint = blueprint.fingerprint();
        let writer = self.cache.writer_lock(&fingerprint);
        let _guard = writer.lock().unwrap_or_else(PoisonError::into_inner);

        let cached = if force_rebuild {
            None
        } else {
            self.cache.lookup(blueprint)
        };
        let entry = match cached {
            Some(entry) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "cache hit for `{}` ({})",
                    blueprint.name(),
                    fingerprint.short()
                );
                entry
            }
            None => {
                let entry = self.build(blueprint)?;
                self.compilations.fetch_add(1, Ordering::Relaxed);
                entry
            }
        };

        let artifact = LoadedArtifact::load(&entry.library)?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        artifact.verify(
            &entry.manifest.layout(),
            blueprint.enabled_derivatives().entry_points(),
        )?;

        Ok(Function::new(
            artifact,
            blueprint.name(),
            fingerprint,
            blueprint.enabled_derivatives(),
        ))
    }

    fn build<B: Body>(&self, blueprint: &Blueprint<B>) -> Result<CacheEntry, FunctionError> {
        let start = Instant::now();
        let name = blueprint.name();
        let variable_size = blueprint.variable_size();
        let enabled = blueprint.enabled_derivatives();

        let mut trace = ad::trace(blueprint.body(), blueprint.input_size())?;
        let probe = ad::probe_point(blueprint.input_size());
        ad::cross_check(blueprint.body(), &trace, &probe)?;

        if enabled.has_hessian() && trace.output_size() != 1 {
            return Err(FunctionError::InvalidBlueprint(format!(
                "`{name}` enables HESSIAN but produces {} outputs; \
                 the Hessian requires a scalar output",
                trace.output_size()
            )));
        }

        let layout = Layout {
            variable_size,
            parameter_size: blueprint.parameter_size(),
            output_size: trace.output_size(),
        };
        let mut entry_points = vec![(EntryPoint::Primal, trace.outputs.clone())];
        if enabled.has_jacobian() {
            let nodes = reverse::jacobian(&mut trace.graph, &trace.outputs, variable_size);
            entry_points.push((EntryPoint::Jacobian, nodes));
        }
        if enabled.has_hessian() {
            let nodes = reverse::hessian(&mut trace.graph, trace.outputs[0], variable_size);
            entry_points.push((EntryPoint::Hessian, nodes));
        }
        log::debug!(
            "traced `{name}`: {} nodes, {layout}, entry points {}",
            trace.graph.len(),
            enabled.entry_points()
        );

        let mut module = codegen::create_object_module(name)?;
        let sources = codegen::emit_entry_points(&mut module, &trace.graph, &entry_points, &layout)?;

        let staging = self.cache.stage(name)?;
        for source in &sources {
            let path = staging.path().join(format!("{name}_{}.clif", source.label));
            fs::write(path, &source.clif).map_err(CacheError::from)?;
        }

        let products = self.toolchain.compile(module, staging.path(), name)?;
        if !self.config.keep_objects {
            if let Err(e) = fs::remove_file(&products.object) {
                log::debug!("could not remove {}: {e}", products.object.display());
            }
        }

        let manifest = Manifest::new(blueprint, layout.output_size, &library_file_name(name));
        let entry = self.cache.publish(staging, manifest)?;
        log::info!(
            "compiled `{name}` ({}) in {:.2?}",
            blueprint.fingerprint().short(),
            start.elapsed()
        );
        Ok(entry)
    }
}

impl Default for FunctionFactory {
    fn default() -> Self {
        Self::from_env()
    }
}

static DEFAULT_FACTORY: OnceLock<FunctionFactory> = OnceLock::new();

/// The process-wide factory behind [`make`], configured from the environment on first use.
pub fn default_factory() -> &'static FunctionFactory {
    DEFAULT_FACTORY.get_or_init(FunctionFactory::from_env)
}

/// Builds `blueprint` with the process-wide factory; see [`FunctionFactory::make`].
pub fn make<B: Body>(
    blueprint: &Blueprint<B>,
    force_rebuild: bool,
) -> Result<Function, FunctionError> {
    default_factory().make(blueprint, force_rebuild)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ad::{squared_norm, Scalar};
    use crate::blueprint::EnabledDerivatives;
    use crate::errors::TraceError;
    use std::sync::atomic::AtomicUsize;

    struct Norm;

    impl Body for Norm {
        fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
            vec![squared_norm(x)]
        }
    }

    struct Pair;

    impl Body for Pair {
        fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
            vec![x[0].clone() * x[1].clone(), x[0].clone() - x[1].clone()]
        }
    }

    /// Scales by the number of previous calls, so the traced and plain runs disagree.
    struct Stateful(AtomicUsize);

    impl Body for Stateful {
        fn eval<S: Scalar>(&self, x: &[S]) -> Vec<S> {
            let calls = self.0.fetch_add(1, Ordering::SeqCst);
            vec![x[0].clone() * (calls + 1) as f64]
        }
    }

    fn factory(dir: &tempfile::TempDir) -> FunctionFactory {
        FunctionFactory::new(FactoryConfig::default().with_cache_dir(dir.path()))
    }

    #[test]
    fn test_make_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(&dir);
        let blueprint =
            Blueprint::new(Norm, 3, 0, "norm", EnabledDerivatives::JACOBIAN).unwrap();

        let first = factory.make(&blueprint, false).unwrap();
        assert_eq!(first.eval(&[1.0, 2.0, 3.0]).unwrap(), vec![14.0]);
        let second = factory.make(&blueprint, false).unwrap();
        assert_eq!(second.artifact_path(), first.artifact_path());
        assert_eq!(
            factory.stats(),
            FactoryStats {
                compilations: 1,
                cache_hits: 1,
                loads: 2,
            }
        );
    }

    #[test]
    fn test_generated_sources_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(&dir);
        let blueprint = Blueprint::new(Norm, 2, 0, "norm", EnabledDerivatives::HESSIAN).unwrap();
        let function = factory.make(&blueprint, false).unwrap();

        let build_dir = function.artifact_path().parent().unwrap();
        for label in ["layout", "primal", "jacobian", "hessian"] {
            assert!(build_dir.join(format!("norm_{label}.clif")).is_file());
        }
        assert!(!build_dir.join("norm.o").exists());
    }

    #[test]
    fn test_hessian_requires_scalar_output() {
        let dir = tempfile::tempdir().unwrap();
        let blueprint = Blueprint::new(Pair, 2, 0, "pair", EnabledDerivatives::HESSIAN).unwrap();
        let result = factory(&dir).make(&blueprint, false);
        assert!(matches!(result, Err(FunctionError::InvalidBlueprint(_))));
    }

    #[test]
    fn test_scalar_divergent_body() {
        let dir = tempfile::tempdir().unwrap();
        let blueprint = Blueprint::new(
            Stateful(AtomicUsize::new(0)),
            1,
            0,
            "stateful",
            EnabledDerivatives::NONE,
        )
        .unwrap();
        let result = factory(&dir).make(&blueprint, false);
        assert!(matches!(
            result,
            Err(FunctionError::TracingError(TraceError::ValueDivergence { .. }))
        ));
    }

    #[test]
    fn test_missing_linker() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FunctionFactory::new(
            FactoryConfig::default()
                .with_cache_dir(dir.path())
                .with_linker("autodiff-jit-no-such-linker"),
        );
        let blueprint = Blueprint::new(Norm, 1, 0, "norm", EnabledDerivatives::NONE).unwrap();
        let result = factory.make(&blueprint, false);
        assert!(matches!(result, Err(FunctionError::CompilationError(_))));
        assert_eq!(factory.stats(), FactoryStats::default());
        assert!(factory.cache().lookup(&blueprint).is_none());
    }
}
