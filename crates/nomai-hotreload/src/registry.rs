//! Component registry: one live context per logical component name.
//!
//! The registry is the single owner of load contexts. A successful reload
//! replaces the entry for a name and releases the superseded context; a
//! failed one leaves the previous entry exactly as it was, so a bad edit
//! never destroys a working component.
//!
//! The registry is mutated only from the thread that owns the scene, so it
//! carries no locks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::compiler::Compiler;
use crate::config::HotReloadConfig;
use crate::instance::ComponentInstance;
use crate::loader::{ComponentType, Loader, ModuleLoadContext, UnloadOutcome};
use crate::source::{ComponentSources, SourceUnit};
use crate::HotReloadError;

// ---------------------------------------------------------------------------
// Unloading
// ---------------------------------------------------------------------------

/// Releases superseded contexts.
///
/// Hosts that cannot safely reclaim compiled code report
/// `supports_unload() == false`; the registry then retains superseded
/// contexts until shutdown instead of releasing them.
pub trait Unloader {
    fn supports_unload(&self) -> bool {
        true
    }

    /// Release a context.
    ///
    /// # Errors
    ///
    /// [`HotReloadError::ContextRelease`] if the release failed. The registry
    /// logs it and moves on.
    fn unload(&mut self, context: ModuleLoadContext) -> Result<UnloadOutcome, HotReloadError>;
}

/// Releases contexts by dropping them.
#[derive(Debug, Clone, Copy)]
pub struct DropUnloader {
    supported: bool,
}

impl DropUnloader {
    pub fn new(supported: bool) -> Self {
        Self { supported }
    }
}

impl Unloader for DropUnloader {
    fn supports_unload(&self) -> bool {
        self.supported
    }

    fn unload(&mut self, context: ModuleLoadContext) -> Result<UnloadOutcome, HotReloadError> {
        Ok(context.unload())
    }
}

// ---------------------------------------------------------------------------
// Entries and reports
// ---------------------------------------------------------------------------

/// A registered component: its live context and where its code came from.
#[derive(Debug)]
pub struct ComponentEntry {
    context: ModuleLoadContext,
    aux_names: Vec<String>,
}

impl ComponentEntry {
    pub fn context(&self) -> &ModuleLoadContext {
        &self.context
    }

    pub fn component_type(&self) -> &Arc<ComponentType> {
        self.context.component_type()
    }

    /// Auxiliary modules linked into this version.
    pub fn aux_names(&self) -> &[String] {
        &self.aux_names
    }
}

/// Result of [`ComponentRegistry::refresh`].
#[derive(Debug)]
pub enum Refresh {
    /// Sources match the registered version; nothing was compiled.
    Unchanged,
    /// A new version was compiled and registered.
    Reloaded(Arc<ComponentType>),
}

/// Result of [`ComponentRegistry::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Contexts released (or dropped, when unloading is unsupported).
    pub released: usize,
    /// Contexts whose release returned an error.
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Maps logical component names to their live compiled type.
pub struct ComponentRegistry {
    sources: ComponentSources,
    compiler: Compiler,
    loader: Loader,
    entries: BTreeMap<String, ComponentEntry>,
    /// Names requested at least once, including ones that never compiled.
    tracked: BTreeSet<String>,
    /// Superseded contexts kept alive because unloading is unsupported.
    retained: Vec<ModuleLoadContext>,
    unloader: Box<dyn Unloader>,
}

impl ComponentRegistry {
    /// Build a registry with the default [`DropUnloader`].
    pub fn new(config: &HotReloadConfig) -> Result<Self, HotReloadError> {
        Self::with_unloader(config, Box::new(DropUnloader::new(config.unload_supported)))
    }

    /// Build a registry with a custom context unloader.
    pub fn with_unloader(
        config: &HotReloadConfig,
        unloader: Box<dyn Unloader>,
    ) -> Result<Self, HotReloadError> {
        config.validate()?;
        let compiler = Compiler::new(config)?;
        let loader = Loader::new(compiler.engine(), config)?;
        Ok(Self {
            sources: ComponentSources::from_config(config),
            compiler,
            loader,
            entries: BTreeMap::new(),
            tracked: BTreeSet::new(),
            retained: Vec::new(),
            unloader,
        })
    }

    /// Get an instance of `name`.
    ///
    /// Without `overwrite`, an existing entry is instantiated directly. With
    /// `overwrite`, or when no entry exists, the source is compiled and
    /// loaded first. Returns `None` when that fails; the previous entry (if
    /// any) is left in place and serves the next non-overwrite request.
    pub fn get_or_create(&mut self, name: &str, overwrite: bool) -> Option<ComponentInstance> {
        let ty = match self.entries.get(name) {
            Some(entry) if !overwrite => Arc::clone(entry.component_type()),
            _ => match self.reload(name) {
                Ok(ty) => ty,
                Err(e) => {
                    tracing::warn!(component = %name, error = %e, "component unavailable");
                    return None;
                }
            },
        };

        match ty.instantiate() {
            Ok(instance) => Some(instance),
            Err(e) => {
                tracing::warn!(component = %name, error = %e, "failed to instantiate component");
                None
            }
        }
    }

    /// Compile and load `name`, replacing any existing entry.
    ///
    /// # Errors
    ///
    /// Compile, type-resolution, instantiation, and source errors. On error
    /// the previous entry is untouched.
    pub fn reload(&mut self, name: &str) -> Result<Arc<ComponentType>, HotReloadError> {
        self.tracked.insert(name.to_owned());
        let unit = self.sources.read_unit(name)?;
        self.load_unit(unit)
    }

    /// Reload `name` only if its sources differ from the registered version.
    pub fn refresh(&mut self, name: &str) -> Result<Refresh, HotReloadError> {
        self.tracked.insert(name.to_owned());
        let unit = self.sources.read_unit(name)?;
        if self.digest(name) == Some(unit.digest()) {
            tracing::debug!(component = %name, "sources unchanged; skipping recompile");
            return Ok(Refresh::Unchanged);
        }
        self.load_unit(unit).map(Refresh::Reloaded)
    }

    fn load_unit(&mut self, unit: SourceUnit) -> Result<Arc<ComponentType>, HotReloadError> {
        let name = unit.name.clone();
        let aux_names = unit.aux_names();

        let compiled = match self.compiler.compile(unit) {
            Ok(compiled) => compiled,
            Err(failure) => {
                for diagnostic in &failure.diagnostics {
                    tracing::warn!(component = %name, "{diagnostic}");
                }
                return Err(failure.into());
            }
        };
        for warning in compiled.warnings() {
            tracing::info!(component = %name, "{warning}");
        }

        let context = self.loader.load(compiled)?;
        let ty = Arc::clone(context.component_type());
        if let Err(e) = ty.instantiate() {
            tracing::warn!(component = %name, error = %e, "new version cannot be instantiated; keeping previous");
            return Err(HotReloadError::Instantiate {
                name,
                source: Box::new(e),
            });
        }
        let previous = self.entries.insert(
            name.clone(),
            ComponentEntry {
                context,
                aux_names,
            },
        );

        tracing::info!(
            component = %name,
            context = %ty.context_id(),
            replaced = previous.as_ref().map(|p| p.context.id().to_string()),
            "component registered"
        );

        if let Some(previous) = previous {
            // Release failures are logged inside; the new entry stands regardless.
            let _ = self.release(previous.context);
        }

        Ok(ty)
    }

    /// Instantiate the registered version of `name` without recompiling.
    pub fn instantiate(&self, name: &str) -> Result<ComponentInstance, HotReloadError> {
        self.entries
            .get(name)
            .ok_or_else(|| HotReloadError::UnknownComponent(name.to_owned()))?
            .component_type()
            .instantiate()
    }

    /// Drop the entry for `name` and release its context. Live instances
    /// keep running on the code they were built from.
    pub fn remove(&mut self, name: &str) -> bool {
        self.tracked.remove(name);
        match self.entries.remove(name) {
            Some(entry) => {
                let _ = self.release(entry.context);
                true
            }
            None => false,
        }
    }

    /// Release every context and clear the registry.
    ///
    /// Every entry is attempted even if some releases fail. Calling this on
    /// an empty registry does nothing.
    pub fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.entries.is_empty() && self.retained.is_empty() {
            self.tracked.clear();
            return report;
        }

        report.released += self.retained.len();
        self.retained.clear();

        let entries = std::mem::take(&mut self.entries);
        for (_, entry) in entries {
            if !self.unloader.supports_unload() {
                drop(entry);
                report.released += 1;
                continue;
            }
            match self.release(entry.context) {
                Ok(()) => report.released += 1,
                Err(_) => report.failed += 1,
            }
        }
        self.tracked.clear();

        tracing::info!(
            released = report.released,
            failed = report.failed,
            "component registry shut down"
        );
        report
    }

    fn release(&mut self, context: ModuleLoadContext) -> Result<(), HotReloadError> {
        if !self.unloader.supports_unload() {
            tracing::debug!(
                component = %context.name(),
                context = %context.id(),
                retained = self.retained.len() + 1,
                "unload unsupported; retaining superseded context"
            );
            self.retained.push(context);
            return Ok(());
        }

        let name = context.name().to_owned();
        let id = context.id();
        match self.unloader.unload(context) {
            Ok(outcome) => {
                tracing::debug!(
                    component = %name,
                    context = %id,
                    reclaimed = outcome.reclaimed(),
                    "context released"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(component = %name, context = %id, error = %e, "context release failed");
                Err(e)
            }
        }
    }

    // -- Queries ------------------------------------------------------------

    pub fn component_type(&self, name: &str) -> Option<Arc<ComponentType>> {
        self.entries.get(name).map(|e| Arc::clone(e.component_type()))
    }

    pub fn entry(&self, name: &str) -> Option<&ComponentEntry> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// `true` if `name` was ever requested and not removed since, whether
    /// or not it compiled.
    pub fn is_tracked(&self, name: &str) -> bool {
        self.tracked.contains(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Source digest of the registered version.
    pub fn digest(&self, name: &str) -> Option<blake3::Hash> {
        self.entries.get(name).map(|e| e.component_type().digest())
    }

    /// Registered components that link `aux` as an auxiliary module.
    pub fn dependents_of(&self, aux: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.aux_names.iter().any(|a| a == aux))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Component types still in memory, including superseded ones kept
    /// alive by instances or retained because unloading is unsupported.
    pub fn live_contexts(&self) -> usize {
        self.loader.live_contexts()
    }

    /// Superseded contexts retained because unloading is unsupported.
    pub fn retained_contexts(&self) -> usize {
        self.retained.len()
    }

    pub fn sources(&self) -> &ComponentSources {
        &self.sources
    }
}

impl Drop for ComponentRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .field("tracked", &self.tracked)
            .field("retained", &self.retained.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::FieldValue;
    use std::path::Path;

    fn rotator(speed: f32) -> String {
        format!(
            r#"(module
  (import "host" "rotate" (func $rotate (param f32 f32 f32)))
  (global $speed (export "Rotator.RotationSpeed.y") (mut f32) (f32.const {speed}))
  (func (export "Rotator.update") (param $dt f32)
    (call $rotate (f32.const 0) (f32.mul (global.get $speed) (local.get $dt)) (f32.const 0))))"#
        )
    }

    fn setup(dir: &Path) -> ComponentRegistry {
        ComponentRegistry::new(&HotReloadConfig::default().with_component_dir(dir)).unwrap()
    }

    #[test]
    fn get_or_create_compiles_once_then_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Rotator.wat"), rotator(20.0)).unwrap();
        let mut registry = setup(dir.path());

        let first = registry.get_or_create("Rotator", false).unwrap();
        // Breaking the file does not matter: the cached type is used.
        std::fs::write(dir.path().join("Rotator.wat"), "(module (oops").unwrap();
        let second = registry.get_or_create("Rotator", false).unwrap();

        assert_eq!(first.context_id(), second.context_id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn failed_overwrite_keeps_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Rotator.wat");
        std::fs::write(&path, rotator(20.0)).unwrap();
        let mut registry = setup(dir.path());
        let original = registry.get_or_create("Rotator", false).unwrap();

        std::fs::write(&path, "(module (oops").unwrap();
        assert!(registry.get_or_create("Rotator", true).is_none());

        let mut fallback = registry.get_or_create("Rotator", false).unwrap();
        assert_eq!(fallback.context_id(), original.context_id());
        assert_eq!(
            fallback.field("RotationSpeed.y"),
            Some(FieldValue::F32(20.0))
        );
    }

    #[test]
    fn missing_source_yields_none_and_stays_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = setup(dir.path());
        assert!(registry.get_or_create("Ghost", false).is_none());
        assert!(!registry.contains("Ghost"));
        assert!(registry.is_tracked("Ghost"));
    }

    #[test]
    fn refresh_skips_identical_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Rotator.wat");
        std::fs::write(&path, rotator(20.0)).unwrap();
        let mut registry = setup(dir.path());
        registry.reload("Rotator").unwrap();

        assert!(matches!(registry.refresh("Rotator").unwrap(), Refresh::Unchanged));

        std::fs::write(&path, rotator(10.0)).unwrap();
        assert!(matches!(registry.refresh("Rotator").unwrap(), Refresh::Reloaded(_)));
    }

    #[test]
    fn remove_keeps_live_instances_running() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Rotator.wat"), rotator(20.0)).unwrap();
        let mut registry = setup(dir.path());
        let mut instance = registry.get_or_create("Rotator", false).unwrap();

        assert!(registry.remove("Rotator"));
        assert!(!registry.remove("Rotator"));
        assert!(!registry.is_tracked("Rotator"));
        assert_eq!(registry.live_contexts(), 1, "instance holds the type");

        let mut transform = nomai_scene::Transform::default();
        instance.update(&mut transform, 1.0).unwrap();
        assert_eq!(transform.rotation.y, 20.0);

        drop(instance);
        assert_eq!(registry.live_contexts(), 0);
    }

    #[test]
    fn unsupported_unload_retains_superseded_contexts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Rotator.wat");
        std::fs::write(&path, rotator(1.0)).unwrap();
        let config = HotReloadConfig {
            unload_supported: false,
            ..HotReloadConfig::default().with_component_dir(dir.path())
        };
        let mut registry = ComponentRegistry::new(&config).unwrap();

        for speed in 1..=3 {
            std::fs::write(&path, rotator(speed as f32)).unwrap();
            registry.reload("Rotator").unwrap();
        }
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.retained_contexts(), 2);
        assert_eq!(registry.live_contexts(), 3);

        let report = registry.shutdown();
        assert_eq!(report, ShutdownReport { released: 3, failed: 0 });
        assert_eq!(registry.live_contexts(), 0);
    }
}
