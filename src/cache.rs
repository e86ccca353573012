//! Persistent compilation cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<name>/<fingerprint>.json     manifest
//! <root>/<name>/<build-id>/            generated sources, object file, shared library
//! <root>/<name>/.staging-*/            builds in progress
//! ```
//!
//! A build happens in a private staging directory, which is renamed to a fresh build id
//! once complete; the manifest is then replaced atomically. A reader therefore either sees
//! the previous complete entry or the new one. Build ids are unique per build, so a library
//! that is still mapped by a live `Function` is never overwritten in place.

use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempDir};

use crate::artifact::{EntryPoint, EntryPoints, Layout, FORMAT_VERSION};
use crate::blueprint::{Blueprint, Body, Fingerprint};
use crate::errors::CacheError;

/// Description of a published artifact, stored as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: i64,
    pub fingerprint: String,
    pub name: String,
    pub target: String,
    pub variable_size: usize,
    pub parameter_size: usize,
    pub output_size: usize,
    pub entry_points: Vec<EntryPoint>,
    /// Shared library, relative to the function directory
    pub library: PathBuf,
    /// Seconds since the Unix epoch
    pub created_at: u64,
}

impl Manifest {
    /// Manifest for an artifact of `blueprint`; `library` is the file name inside the
    /// build directory and is rebased on publication.
    pub fn new<B: Body>(blueprint: &Blueprint<B>, output_size: usize, library: &str) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            fingerprint: blueprint.fingerprint().to_string(),
            name: blueprint.name().to_string(),
            target: target_lexicon::HOST.to_string(),
            variable_size: blueprint.variable_size(),
            parameter_size: blueprint.parameter_size(),
            output_size,
            entry_points: blueprint.enabled_derivatives().entry_points().iter().collect(),
            library: PathBuf::from(library),
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        }
    }

    pub fn layout(&self) -> Layout {
        Layout {
            variable_size: self.variable_size,
            parameter_size: self.parameter_size,
            output_size: self.output_size,
        }
    }

    pub fn entry_point_set(&self) -> EntryPoints {
        self.entry_points.iter().copied().collect()
    }

    /// Explains why the manifest cannot serve `blueprint`, if it cannot.
    fn mismatch<B: Body>(&self, blueprint: &Blueprint<B>) -> Option<String> {
        let fingerprint = blueprint.fingerprint();
        if self.format_version != FORMAT_VERSION {
            return Some(format!("format version {}", self.format_version));
        }
        if self.fingerprint != fingerprint.as_str() {
            return Some(format!("fingerprint {}", self.fingerprint));
        }
        if self.name != blueprint.name()
            || self.variable_size != blueprint.variable_size()
            || self.parameter_size != blueprint.parameter_size()
        {
            return Some(format!(
                "`{}` with {} variables and {} parameters",
                self.name, self.variable_size, self.parameter_size
            ));
        }
        let expected = blueprint.enabled_derivatives().entry_points();
        if self.entry_point_set() != expected {
            return Some(format!("entry points {}", self.entry_point_set()));
        }
        None
    }
}

/// A cache entry that passed the structural checks.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub manifest: Manifest,
    /// Absolute path of the shared library
    pub library: PathBuf,
}

/// A build in progress. Dropping it without publishing removes the directory.
#[derive(Debug)]
pub struct Staging {
    dir: TempDir,
    name: String,
}

impl Staging {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// On-disk cache of compiled artifacts keyed by fingerprint.
#[derive(Debug)]
pub struct CompilationCache {
    root: PathBuf,
    writers: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

static BUILD_COUNTER: AtomicU64 = AtomicU64::new(0);

impl CompilationCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn function_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn manifest_path(&self, name: &str, fingerprint: &Fingerprint) -> PathBuf {
        self.function_dir(name).join(format!("{fingerprint}.json"))
    }

    /// The in-process writer lock of `fingerprint`.
    ///
    /// Hold it across lookup, build and publication so that concurrent requests for the
    /// same fingerprint build once and then hit the cache.
    pub fn writer_lock(&self, fingerprint: &Fingerprint) -> Arc<Mutex<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        writers.entry(fingerprint.clone()).or_default().clone()
    }

    /// Returns the published entry for `blueprint` if it is structurally valid.
    ///
    /// A missing, unreadable or mismatching manifest and a missing library are all misses;
    /// the entry is rebuilt and replaced.
    pub fn lookup<B: Body>(&self, blueprint: &Blueprint<B>) -> Option<CacheEntry> {
        let path = self.manifest_path(blueprint.name(), &blueprint.fingerprint());
        let manifest = match read_manifest(&path) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("ignoring unreadable manifest {}: {e}", path.display());
                return None;
            }
        };
        if let Some(reason) = manifest.mismatch(blueprint) {
            log::warn!("ignoring manifest {} for {reason}", path.display());
            return None;
        }

        let library = self.function_dir(blueprint.name()).join(&manifest.library);
        if !library.is_file() {
            log::warn!("cached library {} is missing", library.display());
            return None;
        }
        Some(CacheEntry { manifest, library })
    }

    /// Creates a private staging directory for a build of `name`.
    pub fn stage(&self, name: &str) -> Result<Staging, CacheError> {
        let dir = self.function_dir(name);
        fs::create_dir_all(&dir)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&dir)?;
        Ok(Staging {
            dir: staging,
            name: name.to_string(),
        })
    }

    /// Publishes a completed build under a fresh build id and replaces the manifest.
    ///
    /// `manifest.library` is the library file name inside the staging directory. The build
    /// directory of the replaced manifest is removed on a best-effort basis.
    pub fn publish(
        &self,
        staging: Staging,
        mut manifest: Manifest,
    ) -> Result<CacheEntry, CacheError> {
        let function_dir = self.function_dir(&staging.name);
        let fingerprint = manifest.fingerprint.clone();
        let build_id = new_build_id(&fingerprint);
        let build_dir = function_dir.join(&build_id);

        fs::rename(staging.path(), &build_dir).map_err(|e| CacheError::Publish {
            path: build_dir.clone(),
            reason: e.to_string(),
        })?;
        manifest.library = Path::new(&build_id).join(&manifest.library);

        let manifest_path = function_dir.join(format!("{fingerprint}.json"));
        let previous = read_manifest(&manifest_path).ok().flatten();
        write_manifest(&function_dir, &manifest_path, &manifest)?;

        if let Some(previous) = previous {
            remove_build_dir(&function_dir, &previous.library, &build_dir);
        }

        log::debug!("published {}", build_dir.display());
        Ok(CacheEntry {
            library: function_dir.join(&manifest.library),
            manifest,
        })
    }
}

fn read_manifest(path: &Path) -> Result<Option<Manifest>, CacheError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_manifest(dir: &Path, path: &Path, manifest: &Manifest) -> Result<(), CacheError> {
    let file = NamedTempFile::new_in(dir)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, manifest)?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| CacheError::Publish {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    file.persist(path).map_err(|e| CacheError::Publish {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(())
}

fn remove_build_dir(function_dir: &Path, library: &Path, current: &Path) {
    let Some(build_id) = library.components().next() else {
        return;
    };
    let dir = function_dir.join(build_id);
    if dir == current || !dir.is_dir() {
        return;
    }
    if let Err(e) = fs::remove_dir_all(&dir) {
        log::debug!("could not remove stale build {}: {e}", dir.display());
    }
}

fn new_build_id(fingerprint: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!(
        "{}-{nanos:x}-{}-{}",
        &fingerprint[..fingerprint.len().min(16)],
        std::process::id(),
        BUILD_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}
