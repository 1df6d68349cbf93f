//! Locating and reading component sources.
//!
//! A component's logical name is its file stem: `components/Rotator.wat`
//! is the component `Rotator`. Auxiliary modules come from a separate
//! directory and are linked into every component compiled from it.

use std::path::{Path, PathBuf};

use crate::config::HotReloadConfig;
use crate::HotReloadError;

/// An auxiliary module compiled alongside a component.
#[derive(Debug, Clone)]
pub struct AuxSource {
    /// Logical name; the component imports from this namespace.
    pub name: String,
    /// File the text was read from.
    pub path: PathBuf,
    /// Raw WAT text.
    pub text: String,
}

/// Everything needed to compile one component.
///
/// Consumed by [`Compiler::compile`](crate::Compiler::compile); the text is
/// not kept once compilation finishes.
#[derive(Debug, Clone)]
pub struct SourceUnit {
    /// Logical component name.
    pub name: String,
    /// Primary source file.
    pub path: PathBuf,
    /// Raw WAT text of the primary file.
    pub text: String,
    /// Auxiliary modules, sorted by name.
    pub aux: Vec<AuxSource>,
}

impl SourceUnit {
    /// An in-memory unit with no auxiliary modules and a synthetic path.
    pub fn from_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: PathBuf::from(format!("<memory>/{name}.wat")),
            name,
            text: text.into(),
            aux: Vec::new(),
        }
    }

    /// Add an in-memory auxiliary module.
    pub fn with_aux(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        let name = name.into();
        self.aux.push(AuxSource {
            path: PathBuf::from(format!("<memory>/{name}.wat")),
            name,
            text: text.into(),
        });
        self.aux.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }

    /// BLAKE3 digest over the primary and auxiliary texts.
    ///
    /// Two units with the same digest compile to the same module, so an
    /// unchanged digest means a change notification can be ignored.
    pub fn digest(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hash_part(&mut hasher, &self.name);
        hash_part(&mut hasher, &self.text);
        for aux in &self.aux {
            hash_part(&mut hasher, &aux.name);
            hash_part(&mut hasher, &aux.text);
        }
        hasher.finalize()
    }

    /// Names of the auxiliary modules in this unit.
    pub fn aux_names(&self) -> Vec<String> {
        self.aux.iter().map(|a| a.name.clone()).collect()
    }
}

fn hash_part(hasher: &mut blake3::Hasher, part: &str) {
    hasher.update(&(part.len() as u64).to_le_bytes());
    hasher.update(part.as_bytes());
}

/// Maps logical names to files and reads [`SourceUnit`]s.
#[derive(Debug, Clone)]
pub struct ComponentSources {
    component_dir: PathBuf,
    aux_dir: Option<PathBuf>,
    extension: String,
}

impl ComponentSources {
    pub fn new(component_dir: impl Into<PathBuf>, aux_dir: Option<PathBuf>, extension: &str) -> Self {
        Self {
            component_dir: component_dir.into(),
            aux_dir,
            extension: extension.to_owned(),
        }
    }

    pub fn from_config(config: &HotReloadConfig) -> Self {
        Self::new(
            config.component_dir.clone(),
            config.aux_dir.clone(),
            &config.extension,
        )
    }

    pub fn component_dir(&self) -> &Path {
        &self.component_dir
    }

    pub fn aux_dir(&self) -> Option<&Path> {
        self.aux_dir.as_deref()
    }

    /// `<component_dir>/<name>.<extension>`
    pub fn primary_path(&self, name: &str) -> PathBuf {
        self.component_dir
            .join(format!("{name}.{}", self.extension))
    }

    /// Logical name for a source path, or `None` if the extension does not match.
    pub fn logical_name(&self, path: &Path) -> Option<String> {
        if path.extension()?.to_str()? != self.extension {
            return None;
        }
        path.file_stem()?.to_str().map(str::to_owned)
    }

    /// Directories a watcher should observe (deduplicated).
    pub fn watch_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.component_dir.clone()];
        if let Some(aux) = &self.aux_dir {
            if !same_path(aux, &self.component_dir) {
                dirs.push(aux.clone());
            }
        }
        dirs
    }

    /// Read the primary file for `name` plus every auxiliary file other
    /// than the primary one.
    pub fn read_unit(&self, name: &str) -> Result<SourceUnit, HotReloadError> {
        let path = self.primary_path(name);
        let text = read_text(&path)?;

        let mut aux = Vec::new();
        for aux_path in self.aux_paths(&path)? {
            let Some(aux_name) = self.logical_name(&aux_path) else {
                continue;
            };
            aux.push(AuxSource {
                name: aux_name,
                text: read_text(&aux_path)?,
                path: aux_path,
            });
        }
        aux.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(SourceUnit {
            name: name.to_owned(),
            path,
            text,
            aux,
        })
    }

    /// Auxiliary files, sorted, excluding `primary`. A missing auxiliary
    /// directory yields no files.
    fn aux_paths(&self, primary: &Path) -> Result<Vec<PathBuf>, HotReloadError> {
        let Some(dir) = &self.aux_dir else {
            return Ok(Vec::new());
        };
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(HotReloadError::Source {
                    path: dir.clone(),
                    source,
                })
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && self.logical_name(p).is_some())
            .filter(|p| !same_path(p, primary))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

fn read_text(path: &Path) -> Result<String, HotReloadError> {
    std::fs::read_to_string(path).map_err(|source| HotReloadError::Source {
        path: path.to_path_buf(),
        source,
    })
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
