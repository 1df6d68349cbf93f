//! Module loader: compiled modules to isolated, releasable contexts.
//!
//! Every [`Loader::load`] call creates a new [`ModuleLoadContext`] that owns
//! one compiled module and the [`ComponentType`] resolved from it. Instances
//! each run in their own store and hold the type through an `Arc`, so the
//! compiled code is reclaimed once the context is unloaded *and* the last
//! instance built from it is dropped.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use wasmtime::{Engine, ExternType, FuncType, Linker, Module, Mutability, Store, ValType};

use crate::compiler::{AuxModule, CompiledModule};
use crate::config::HotReloadConfig;
use crate::host_api::{register_host_api, ComponentHost};
use crate::instance::{ComponentInstance, FieldKind};
use crate::HotReloadError;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The module compiled but does not define a usable component.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadFailure {
    /// No component type is named after the logical name.
    #[error("module '{name}' defines no component type named '{name}' (found: {})", display_list(.found))]
    NotFound {
        name: String,
        /// Component types the module does define.
        found: Vec<String>,
    },

    /// More than one type matches the logical name ignoring case.
    #[error("component name '{name}' is ambiguous; candidates: {}", display_list(.candidates))]
    Ambiguous { name: String, candidates: Vec<String> },

    /// A lifecycle hook is exported with the wrong signature.
    #[error("hook '{export}' must have signature {expected}")]
    BadHook {
        name: String,
        export: String,
        expected: &'static str,
    },
}

fn display_list(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_owned()
    } else {
        items.join(", ")
    }
}

// ---------------------------------------------------------------------------
// Context bookkeeping
// ---------------------------------------------------------------------------

/// Identifier of a load context, unique per [`Loader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Counts component types (and therefore compiled modules) still in memory.
#[derive(Debug, Clone, Default)]
struct ContextTracker(Arc<AtomicUsize>);

impl ContextTracker {
    fn token(&self) -> LiveToken {
        self.0.fetch_add(1, Ordering::SeqCst);
        LiveToken(Arc::clone(&self.0))
    }

    fn live(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct LiveToken(Arc<AtomicUsize>);

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// ComponentType
// ---------------------------------------------------------------------------

/// Which lifecycle hooks a component exports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hooks {
    pub on_attach: bool,
    pub update: bool,
    pub on_detach: bool,
}

/// A field: an exported mutable global under the component's prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    /// Name without the component prefix (and without `state.`).
    pub name: String,
    /// Full export name.
    pub export: String,
    pub kind: FieldKind,
    /// Declared under `<Type>.state.` and carried across swaps.
    pub serialized: bool,
}

/// Per-instance sandbox limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceLimits {
    pub fuel_per_call: u64,
    pub memory_limit_bytes: usize,
}

/// A resolved component type: the factory for instances.
pub struct ComponentType {
    name: String,
    context: ContextId,
    digest: blake3::Hash,
    module: Module,
    aux: Vec<AuxModule>,
    hooks: Hooks,
    fields: Vec<FieldDecl>,
    engine: Engine,
    linker: Linker<ComponentHost>,
    limits: InstanceLimits,
    _live: LiveToken,
}

impl ComponentType {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The context this type was loaded into.
    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn digest(&self) -> blake3::Hash {
        self.digest
    }

    pub fn hooks(&self) -> Hooks {
        self.hooks
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn limits(&self) -> InstanceLimits {
        self.limits
    }

    /// Export name of a hook, e.g. `Rotator.update`.
    pub(crate) fn hook_export(&self, hook: &str) -> String {
        format!("{}.{hook}", self.name)
    }

    /// Build a fresh instance in its own store.
    ///
    /// Auxiliary modules are instantiated first and linked under their
    /// logical names.
    ///
    /// # Errors
    ///
    /// [`HotReloadError::Runtime`] if instantiation fails, or
    /// [`HotReloadError::OutOfFuel`]/[`HotReloadError::Trap`] if a start
    /// function misbehaves.
    pub fn instantiate(self: &Arc<Self>) -> Result<ComponentInstance, HotReloadError> {
        let mut store = Store::new(
            &self.engine,
            ComponentHost::new(self.name.clone(), self.limits.memory_limit_bytes),
        );
        store.limiter(|host| &mut host.limits);
        store
            .set_fuel(self.limits.fuel_per_call)
            .map_err(|e| HotReloadError::Runtime(format!("failed to set fuel: {e}")))?;

        let mut linker = self.linker.clone();
        for aux in &self.aux {
            let instance = linker
                .instantiate(&mut store, &aux.module)
                .map_err(|e| classify_error(e, self.limits.fuel_per_call))?;
            linker
                .instance(&mut store, &aux.name, instance)
                .map_err(|e| {
                    HotReloadError::Runtime(format!("failed to link auxiliary '{}': {e}", aux.name))
                })?;
        }

        let instance = linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| classify_error(e, self.limits.fuel_per_call))?;

        tracing::trace!(component = %self.name, context = %self.context, "component instantiated");

        Ok(ComponentInstance::new(Arc::clone(self), store, instance))
    }
}

impl fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentType")
            .field("name", &self.name)
            .field("context", &self.context)
            .field("hooks", &self.hooks)
            .field("fields", &self.fields)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ModuleLoadContext
// ---------------------------------------------------------------------------

/// What happened when a context was unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnloadOutcome {
    pub context: ContextId,
    /// Instances still holding the type. Memory is reclaimed once they drop.
    pub outstanding_instances: usize,
}

impl UnloadOutcome {
    /// `true` when nothing else referenced the type and it was freed on unload.
    pub fn reclaimed(&self) -> bool {
        self.outstanding_instances == 0
    }
}

/// An isolated context owning one compiled module and its resolved type.
#[derive(Debug)]
pub struct ModuleLoadContext {
    id: ContextId,
    component_type: Arc<ComponentType>,
}

impl ModuleLoadContext {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.component_type.name()
    }

    pub fn component_type(&self) -> &Arc<ComponentType> {
        &self.component_type
    }

    /// Release the context's hold on its module.
    pub fn unload(self) -> UnloadOutcome {
        let outstanding = Arc::strong_count(&self.component_type) - 1;
        let outcome = UnloadOutcome {
            context: self.id,
            outstanding_instances: outstanding,
        };
        tracing::debug!(
            component = %self.component_type.name(),
            context = %self.id,
            outstanding_instances = outstanding,
            "context unloaded"
        );
        outcome
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Loads compiled modules into fresh contexts.
pub struct Loader {
    engine: Engine,
    linker: Linker<ComponentHost>,
    limits: InstanceLimits,
    next_id: u64,
    tracker: ContextTracker,
}

impl Loader {
    /// Create a loader for modules compiled with `engine`.
    pub fn new(engine: &Engine, config: &HotReloadConfig) -> Result<Self, HotReloadError> {
        let mut linker = Linker::new(engine);
        register_host_api(&mut linker)
            .map_err(|e| HotReloadError::Runtime(format!("failed to register host API: {e}")))?;

        Ok(Self {
            engine: engine.clone(),
            linker,
            limits: InstanceLimits {
                fuel_per_call: config.fuel_per_call,
                memory_limit_bytes: config.memory_limit_bytes,
            },
            next_id: 0,
            tracker: ContextTracker::default(),
        })
    }

    /// Load `module` into a new context and resolve its component type.
    ///
    /// # Errors
    ///
    /// [`LoadFailure`] if no single component type matches the module's
    /// logical name or a hook has the wrong signature. The context is
    /// released before returning.
    pub fn load(&mut self, module: CompiledModule) -> Result<ModuleLoadContext, LoadFailure> {
        self.next_id += 1;
        let id = ContextId(self.next_id);
        let (name, module, aux, digest) = module.into_parts();

        let (hooks, fields) = match resolve_component(&name, &module) {
            Ok(resolved) => resolved,
            Err(failure) => {
                tracing::debug!(component = %name, context = %id, error = %failure, "type resolution failed; context released");
                return Err(failure);
            }
        };

        let component_type = Arc::new(ComponentType {
            name,
            context: id,
            digest,
            module,
            aux,
            hooks,
            fields,
            engine: self.engine.clone(),
            linker: self.linker.clone(),
            limits: self.limits,
            _live: self.tracker.token(),
        });

        tracing::debug!(
            component = %component_type.name,
            context = %id,
            fields = component_type.fields.len(),
            "module loaded"
        );

        Ok(ModuleLoadContext { id, component_type })
    }

    /// Component types still in memory across every context this loader
    /// created (including ones kept alive only by instances).
    pub fn live_contexts(&self) -> usize {
        self.tracker.live()
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }
}

impl fmt::Debug for Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader")
            .field("limits", &self.limits)
            .field("next_id", &self.next_id)
            .field("live_contexts", &self.tracker.live())
            .finish_non_exhaustive()
    }
}

// -- Type resolution --------------------------------------------------------

fn resolve_component(name: &str, module: &Module) -> Result<(Hooks, Vec<FieldDecl>), LoadFailure> {
    let mut types: Vec<String> = module
        .exports()
        .filter_map(|e| e.name().split_once('.').map(|(ty, _)| ty.to_owned()))
        .collect();
    types.sort();
    types.dedup();

    let candidates: Vec<String> = types
        .iter()
        .filter(|ty| ty.eq_ignore_ascii_case(name))
        .cloned()
        .collect();

    match candidates.as_slice() {
        [only] if only == name => {}
        [_, _, ..] => {
            return Err(LoadFailure::Ambiguous {
                name: name.to_owned(),
                candidates,
            })
        }
        _ => {
            return Err(LoadFailure::NotFound {
                name: name.to_owned(),
                found: types,
            })
        }
    }

    let prefix = format!("{name}.");
    let mut hooks = Hooks::default();
    let mut fields = Vec::new();

    for export in module.exports() {
        let Some(member) = export.name().strip_prefix(&prefix) else {
            continue;
        };
        match export.ty() {
            ExternType::Func(ty) => {
                let slot = match member {
                    "update" => {
                        check_hook(name, export.name(), &ty, &[ValType::F32], "(f32) -> ()")?;
                        &mut hooks.update
                    }
                    "on_attach" => {
                        check_hook(name, export.name(), &ty, &[], "() -> ()")?;
                        &mut hooks.on_attach
                    }
                    "on_detach" => {
                        check_hook(name, export.name(), &ty, &[], "() -> ()")?;
                        &mut hooks.on_detach
                    }
                    _ => continue,
                };
                *slot = true;
            }
            ExternType::Global(g) if g.mutability() == Mutability::Var => {
                let Some(kind) = FieldKind::from_val_type(g.content()) else {
                    continue;
                };
                let (field, serialized) = match member.strip_prefix("state.") {
                    Some(state_field) => (state_field, true),
                    None => (member, false),
                };
                fields.push(FieldDecl {
                    name: field.to_owned(),
                    export: export.name().to_owned(),
                    kind,
                    serialized,
                });
            }
            _ => {}
        }
    }

    Ok((hooks, fields))
}

fn check_hook(
    name: &str,
    export: &str,
    ty: &FuncType,
    params: &[ValType],
    expected: &'static str,
) -> Result<(), LoadFailure> {
    let params_match = ty.params().len() == params.len()
        && ty
            .params()
            .zip(params)
            .all(|(actual, wanted)| ValType::eq(&actual, wanted));
    if params_match && ty.results().len() == 0 {
        Ok(())
    } else {
        Err(LoadFailure::BadHook {
            name: name.to_owned(),
            export: export.to_owned(),
            expected,
        })
    }
}

/// Map a Wasmtime error into the matching [`HotReloadError`] variant.
pub(crate) fn classify_error(error: anyhow::Error, budget: u64) -> HotReloadError {
    for cause in error.chain() {
        if let Some(trap) = cause.downcast_ref::<wasmtime::Trap>() {
            if *trap == wasmtime::Trap::OutOfFuel {
                return HotReloadError::OutOfFuel { budget };
            }
            return HotReloadError::Trap(format!("{error:#}"));
        }
    }
    HotReloadError::Runtime(format!("{error:#}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::source::SourceUnit;

    fn load(name: &str, wat: &str) -> (Loader, Result<ModuleLoadContext, LoadFailure>) {
        let config = HotReloadConfig::default();
        let compiler = Compiler::new(&config).unwrap();
        let mut loader = Loader::new(compiler.engine(), &config).unwrap();
        let compiled = compiler
            .compile(SourceUnit::from_text(name, wat))
            .unwrap();
        let result = loader.load(compiled);
        (loader, result)
    }

    #[test]
    fn resolves_hooks_and_fields() {
        let wat = r#"(module
          (global (export "Oscillator.Amplitude") (mut f32) (f32.const 1))
          (global (export "Oscillator.state.startingPosition.y") (mut f32) (f32.const 0))
          (global (export "Oscillator.state.bounces") (mut i32) (i32.const 0))
          (func (export "Oscillator.on_attach"))
          (func (export "Oscillator.update") (param f32)))"#;
        let (loader, ctx) = load("Oscillator", wat);
        let ctx = ctx.unwrap();
        let ty = ctx.component_type();

        assert_eq!(ty.name(), "Oscillator");
        assert_eq!(
            ty.hooks(),
            Hooks {
                on_attach: true,
                update: true,
                on_detach: false
            }
        );
        let amplitude = ty.field("Amplitude").unwrap();
        assert!(!amplitude.serialized);
        assert_eq!(amplitude.kind, FieldKind::F32);
        let start = ty.field("startingPosition.y").unwrap();
        assert!(start.serialized);
        assert_eq!(start.export, "Oscillator.state.startingPosition.y");
        assert_eq!(ty.field("bounces").unwrap().kind, FieldKind::I32);
        assert_eq!(loader.live_contexts(), 1);
    }

    #[test]
    fn missing_type_fails_without_leaking_a_context() {
        let wat = r#"(module (func (export "Spinner.update") (param f32)))"#;
        let (loader, result) = load("Rotator", wat);
        let err = result.unwrap_err();
        assert_eq!(
            err,
            LoadFailure::NotFound {
                name: "Rotator".to_owned(),
                found: vec!["Spinner".to_owned()],
            }
        );
        assert_eq!(loader.live_contexts(), 0);
    }

    #[test]
    fn case_only_match_is_not_found() {
        let wat = r#"(module (func (export "rotator.update") (param f32)))"#;
        let (_, result) = load("Rotator", wat);
        assert!(matches!(result, Err(LoadFailure::NotFound { .. })));
    }

    #[test]
    fn case_insensitive_duplicates_are_ambiguous() {
        let wat = r#"(module
          (func (export "Rotator.update") (param f32))
          (func (export "ROTATOR.update") (param f32)))"#;
        let (_, result) = load("Rotator", wat);
        match result {
            Err(LoadFailure::Ambiguous { candidates, .. }) => {
                assert_eq!(candidates, vec!["ROTATOR".to_owned(), "Rotator".to_owned()]);
            }
            other => panic!("expected Ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn bad_hook_signature_is_rejected() {
        let wat = r#"(module (func (export "Rotator.update") (param i32)))"#;
        let (_, result) = load("Rotator", wat);
        assert!(
            matches!(result, Err(LoadFailure::BadHook { ref export, .. }) if export == "Rotator.update"),
            "got {result:?}"
        );
    }

    #[test]
    fn unload_reports_outstanding_instances() {
        let wat = r#"(module (func (export "Rotator.update") (param f32)))"#;
        let (loader, ctx) = load("Rotator", wat);
        let ctx = ctx.unwrap();
        let instance = ctx.component_type().instantiate().unwrap();

        let outcome = ctx.unload();
        assert_eq!(outcome.outstanding_instances, 1);
        assert!(!outcome.reclaimed());
        assert_eq!(loader.live_contexts(), 1, "instance keeps the type alive");

        drop(instance);
        assert_eq!(loader.live_contexts(), 0);
    }

    #[test]
    fn context_ids_are_monotonic() {
        let config = HotReloadConfig::default();
        let compiler = Compiler::new(&config).unwrap();
        let mut loader = Loader::new(compiler.engine(), &config).unwrap();
        let wat = r#"(module (func (export "Rotator.update") (param f32)))"#;

        let a = loader
            .load(compiler.compile(SourceUnit::from_text("Rotator", wat)).unwrap())
            .unwrap();
        let b = loader
            .load(compiler.compile(SourceUnit::from_text("Rotator", wat)).unwrap())
            .unwrap();
        assert!(b.id() > a.id());
        assert_eq!(loader.live_contexts(), 2);
        a.unload();
        assert_eq!(loader.live_contexts(), 1);
    }
}
