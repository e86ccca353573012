//! Native compilation of generated code.
//!
//! The Cranelift object module is emitted as a relocatable object file and linked into a
//! shared library by the system C toolchain (`cc -shared`), which also resolves the libm
//! imports. Tool diagnostics are kept verbatim in [`CompileError::LinkerFailed`].

use std::env::consts::{DLL_EXTENSION, DLL_PREFIX};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use cranelift_object::ObjectModule;

use crate::errors::CompileError;

/// Files produced by one compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildProducts {
    pub object: PathBuf,
    pub library: PathBuf,
}

/// The external linker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    linker: String,
    args: Vec<String>,
}

impl Toolchain {
    /// `linker` is invoked as `linker -shared -o <library> <object> <args...> -lm`.
    pub fn new(linker: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            linker: linker.into(),
            args,
        }
    }

    pub fn linker(&self) -> &str {
        &self.linker
    }

    /// Emits `module` into `dir` as `<stem>.o` and links `lib<stem>.<ext>` next to it.
    ///
    /// # Errors
    /// - `CompileError::ObjectEmission` if Cranelift cannot serialise the object
    /// - `CompileError::LinkerMissing` if the linker cannot be spawned
    /// - `CompileError::LinkerFailed` if it exits unsuccessfully
    /// - `CompileError::Io` on filesystem failures
    pub fn compile(
        &self,
        module: ObjectModule,
        dir: &Path,
        stem: &str,
    ) -> Result<BuildProducts, CompileError> {
        let bytes = module
            .finish()
            .emit()
            .map_err(|e| CompileError::ObjectEmission(e.to_string()))?;

        let object = dir.join(format!("{stem}.o"));
        fs::write(&object, bytes)?;

        let library = dir.join(library_file_name(stem));
        self.link(&object, &library)?;

        Ok(BuildProducts { object, library })
    }

    fn link(&self, object: &Path, library: &Path) -> Result<(), CompileError> {
        let mut args: Vec<String> = vec![
            "-shared".into(),
            "-o".into(),
            library.to_string_lossy().into_owned(),
            object.to_string_lossy().into_owned(),
        ];
        args.extend(self.args.iter().cloned());
        args.push("-lm".into());

        log::debug!("running {} {}", self.linker, args.join(" "));
        let output = Command::new(&self.linker)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => CompileError::LinkerMissing(self.linker.clone()),
                _ => CompileError::Io(err),
            })?;

        if !output.status.success() {
            return Err(CompileError::LinkerFailed {
                linker: self.linker.clone(),
                status: output.status.to_string(),
                stderr: decode_to_string(&output.stderr),
            });
        }
        Ok(())
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::new("cc", Vec::new())
    }
}

/// Platform file name of the shared library for `stem`, e.g. `libnorm.so`.
pub fn library_file_name(stem: &str) -> String {
    format!("{DLL_PREFIX}{stem}.{DLL_EXTENSION}")
}

fn decode_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
