//! Loading compiled artifacts and calling their entry points.
//!
//! This is the only module with `unsafe` code. A [`LoadedArtifact`] owns the
//! `libloading::Library` handle of one shared library together with the entry points
//! resolved from it. The entry point pointers are only reachable through
//! [`LoadedArtifact::call`], which checks buffer lengths first, and they cannot outlive the
//! handle because both live in the same value.

use std::fmt;
use std::path::{Path, PathBuf};

use itertools::Itertools;
use libloading::Library;
use serde::{Deserialize, Serialize};

use crate::errors::FunctionError;
use crate::types::{EntryPointFn, LayoutFn};

/// Version of the artifact ABI. Bumped whenever generated code changes shape, which also
/// changes every fingerprint.
pub const FORMAT_VERSION: i64 = 1;

/// Symbol of the layout query.
pub const LAYOUT_SYMBOL: &str = "adjit_layout";

/// A callable exported by an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryPoint {
    Primal,
    Jacobian,
    Hessian,
}

impl EntryPoint {
    pub const ALL: [EntryPoint; 3] = [EntryPoint::Primal, EntryPoint::Jacobian, EntryPoint::Hessian];

    /// Exported C symbol.
    pub fn symbol(self) -> &'static str {
        match self {
            EntryPoint::Primal => "adjit_primal",
            EntryPoint::Jacobian => "adjit_jacobian",
            EntryPoint::Hessian => "adjit_hessian",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntryPoint::Primal => "primal",
            EntryPoint::Jacobian => "jacobian",
            EntryPoint::Hessian => "hessian",
        }
    }

    fn bit(self) -> u8 {
        1 << self as u8
    }

    /// Number of values the entry point writes for `layout`.
    pub fn output_len(self, layout: &Layout) -> usize {
        match self {
            EntryPoint::Primal => layout.output_size,
            EntryPoint::Jacobian => layout.output_size * layout.variable_size,
            EntryPoint::Hessian => layout.variable_size * layout.variable_size,
        }
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Set of entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EntryPoints(u8);

impl EntryPoints {
    pub fn insert(&mut self, entry: EntryPoint) {
        self.0 |= entry.bit();
    }

    pub fn contains(&self, entry: EntryPoint) -> bool {
        self.0 & entry.bit() != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = EntryPoint> + '_ {
        EntryPoint::ALL.into_iter().filter(|e| self.contains(*e))
    }
}

impl From<EntryPoint> for EntryPoints {
    fn from(entry: EntryPoint) -> Self {
        Self(entry.bit())
    }
}

impl FromIterator<EntryPoint> for EntryPoints {
    fn from_iter<I: IntoIterator<Item = EntryPoint>>(iter: I) -> Self {
        let mut points = Self::default();
        for entry in iter {
            points.insert(entry);
        }
        points
    }
}

impl fmt::Display for EntryPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.iter().join(", "))
    }
}

/// Shape information an artifact reports through [`LAYOUT_SYMBOL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub variable_size: usize,
    pub parameter_size: usize,
    pub output_size: usize,
}

impl Layout {
    pub fn input_size(&self) -> usize {
        self.variable_size + self.parameter_size
    }

    /// The four `i64` values the layout query writes.
    pub fn to_raw(self) -> [i64; 4] {
        [
            FORMAT_VERSION,
            self.variable_size as i64,
            self.parameter_size as i64,
            self.output_size as i64,
        ]
    }

    fn from_raw(raw: [i64; 4]) -> Result<Self, String> {
        if raw[0] != FORMAT_VERSION {
            return Err(format!(
                "format version {} (expected {FORMAT_VERSION})",
                raw[0]
            ));
        }
        let size = |v: i64| usize::try_from(v).map_err(|_| format!("negative size {v}"));
        Ok(Self {
            variable_size: size(raw[1])?,
            parameter_size: size(raw[2])?,
            output_size: size(raw[3])?,
        })
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} variables, {} parameters, {} outputs",
            self.variable_size, self.parameter_size, self.output_size
        )
    }
}

/// A dynamically loaded artifact.
///
/// Dropping it releases the library handle.
pub struct LoadedArtifact {
    path: PathBuf,
    layout: Layout,
    entries: [Option<EntryPointFn>; 3],
    _library: Library,
}

impl LoadedArtifact {
    /// Loads the shared library at `path` and resolves its entry points.
    ///
    /// # Errors
    /// - `FunctionError::LoadError` if the library cannot be opened
    /// - `FunctionError::ArtifactMismatch` if it does not export a valid layout
    pub fn load(path: &Path) -> Result<Self, FunctionError> {
        // SAFETY: artifacts are produced by `compiler::Toolchain` from generated code only.
        // They have no initialisers and no global state.
        let library = unsafe { Library::new(path) }.map_err(|e| FunctionError::LoadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // SAFETY: the layout symbol has the `LayoutFn` signature in every artifact of this
        // format version; the version itself is checked right after the call.
        let layout_fn: LayoutFn = unsafe { library.get::<LayoutFn>(LAYOUT_SYMBOL.as_bytes()) }
            .map(|symbol| *symbol)
            .map_err(|e| {
                FunctionError::ArtifactMismatch(format!(
                    "{} has no `{LAYOUT_SYMBOL}`: {e}",
                    path.display()
                ))
            })?;
        let mut raw = [0_i64; 4];
        // SAFETY: `raw` holds exactly the four values the layout query writes.
        unsafe { layout_fn(raw.as_mut_ptr()) };
        let layout = Layout::from_raw(raw).map_err(|reason| {
            FunctionError::ArtifactMismatch(format!("{}: {reason}", path.display()))
        })?;

        let mut entries = [None; 3];
        for entry in EntryPoint::ALL {
            // SAFETY: every `adjit_*` entry point has the `EntryPointFn` signature.
            if let Ok(symbol) = unsafe { library.get::<EntryPointFn>(entry.symbol().as_bytes()) }
            {
                entries[entry as usize] = Some(*symbol);
            }
        }

        let artifact = Self {
            path: path.to_path_buf(),
            layout,
            entries,
            _library: library,
        };
        log::debug!(
            "loaded {} ({layout}, entry points {})",
            path.display(),
            artifact.entry_points()
        );
        Ok(artifact)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn entry_points(&self) -> EntryPoints {
        EntryPoint::ALL
            .into_iter()
            .filter(|e| self.entries[*e as usize].is_some())
            .collect()
    }

    /// Checks that the artifact was built for the manifest layout `expected` and exports
    /// exactly the blueprint's `entries`.
    ///
    /// # Errors
    /// Returns `FunctionError::ArtifactMismatch` describing the first difference.
    pub fn verify(&self, expected: &Layout, entries: EntryPoints) -> Result<(), FunctionError> {
        if self.layout != *expected {
            return Err(FunctionError::ArtifactMismatch(format!(
                "{} reports {} but the manifest expects {}",
                self.path.display(),
                self.layout,
                expected
            )));
        }
        if self.entry_points() != entries {
            return Err(FunctionError::ArtifactMismatch(format!(
                "{} exports {} but the blueprint expects {}",
                self.path.display(),
                self.entry_points(),
                entries
            )));
        }
        Ok(())
    }

    /// Calls `entry` on `input`, writing into `output`.
    ///
    /// # Errors
    /// - `FunctionError::DerivativeUnavailable` if the artifact does not export `entry`
    /// - `FunctionError::DimensionMismatch` if a buffer has the wrong length
    pub fn call(
        &self,
        entry: EntryPoint,
        input: &[f64],
        output: &mut [f64],
    ) -> Result<(), FunctionError> {
        let function = self.entries[entry as usize]
            .ok_or(FunctionError::DerivativeUnavailable(entry))?;
        if input.len() != self.layout.input_size() {
            return Err(FunctionError::DimensionMismatch {
                expected: self.layout.input_size(),
                got: input.len(),
            });
        }
        let expected = entry.output_len(&self.layout);
        if output.len() != expected {
            return Err(FunctionError::DimensionMismatch {
                expected,
                got: output.len(),
            });
        }
        // SAFETY: both buffers have the lengths the generated code reads and writes, and
        // the library stays loaded for as long as `self` lives.
        unsafe { function(input.as_ptr(), output.as_mut_ptr()) };
        Ok(())
    }
}

impl fmt::Debug for LoadedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedArtifact")
            .field("path", &self.path)
            .field("layout", &self.layout)
            .field("entry_points", &self.entry_points())
            .finish()
    }
}

impl Drop for LoadedArtifact {
    fn drop(&mut self) {
        log::debug!("unloading {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_point_set() {
        let mut points = EntryPoints::from(EntryPoint::Primal);
        assert_eq!(points.len(), 1);
        points.insert(EntryPoint::Hessian);
        assert!(points.contains(EntryPoint::Hessian));
        assert!(!points.contains(EntryPoint::Jacobian));
        assert_eq!(
            points.iter().collect::<Vec<_>>(),
            vec![EntryPoint::Primal, EntryPoint::Hessian]
        );
        assert_eq!(points.to_string(), "{primal, hessian}");
        assert_eq!(
            EntryPoint::ALL.into_iter().collect::<EntryPoints>().len(),
            3
        );
    }

    #[test]
    fn test_output_lengths() {
        let layout = Layout {
            variable_size: 4,
            parameter_size: 1,
            output_size: 2,
        };
        assert_eq!(EntryPoint::Primal.output_len(&layout), 2);
        assert_eq!(EntryPoint::Jacobian.output_len(&layout), 8);
        assert_eq!(EntryPoint::Hessian.output_len(&layout), 16);
        assert_eq!(layout.input_size(), 5);
    }

    #[test]
    fn test_layout_raw() {
        let layout = Layout {
            variable_size: 3,
            parameter_size: 0,
            output_size: 1,
        };
        assert_eq!(Layout::from_raw(layout.to_raw()), Ok(layout));
        assert!(Layout::from_raw([FORMAT_VERSION + 1, 3, 0, 1]).is_err());
        assert!(Layout::from_raw([FORMAT_VERSION, -1, 0, 1]).is_err());
    }

    #[test]
    fn test_entry_point_serde() {
        let json = serde_json::to_string(&vec![EntryPoint::Primal, EntryPoint::Jacobian]).unwrap();
        assert_eq!(json, r#"["primal","jacobian"]"#);
        let back: Vec<EntryPoint> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, vec![EntryPoint::Primal, EntryPoint::Jacobian]);
    }

    #[test]
    fn test_load_missing_library() {
        let result = LoadedArtifact::load(Path::new("/nonexistent/libnothing.so"));
        assert!(matches!(result, Err(FunctionError::LoadError { .. })));
    }
}
