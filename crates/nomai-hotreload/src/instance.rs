//! Live component instances and their externalized state.
//!
//! A [`ComponentInstance`] is one running copy of a component: its own store,
//! its own globals, and a shared handle to the [`ComponentType`] it was built
//! from. Hooks run against a copy of the node transform that is written back
//! only when the hook returns normally.

use std::collections::BTreeMap;
use std::sync::Arc;

use nomai_scene::{Component, Transform};
use serde::{Deserialize, Serialize};
use wasmtime::{Instance, Store, Val, ValType, WasmParams};

use crate::host_api::ComponentHost;
use crate::loader::{classify_error, ComponentType, ContextId};
use crate::HotReloadError;

// ---------------------------------------------------------------------------
// Field values
// ---------------------------------------------------------------------------

/// Value type of a component field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    I32,
    I64,
    F32,
    F64,
}

impl FieldKind {
    pub(crate) fn from_val_type(ty: &ValType) -> Option<Self> {
        match ty {
            ValType::I32 => Some(FieldKind::I32),
            ValType::I64 => Some(FieldKind::I64),
            ValType::F32 => Some(FieldKind::F32),
            ValType::F64 => Some(FieldKind::F64),
            _ => None,
        }
    }
}

/// The value of one component field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::I32(_) => FieldKind::I32,
            FieldValue::I64(_) => FieldKind::I64,
            FieldValue::F32(_) => FieldKind::F32,
            FieldValue::F64(_) => FieldKind::F64,
        }
    }

    /// Numeric view, for assertions and display.
    pub fn as_f64(&self) -> f64 {
        match *self {
            FieldValue::I32(v) => v as f64,
            FieldValue::I64(v) => v as f64,
            FieldValue::F32(v) => v as f64,
            FieldValue::F64(v) => v,
        }
    }

    fn from_val(val: &Val) -> Option<Self> {
        match val {
            Val::I32(v) => Some(FieldValue::I32(*v)),
            Val::I64(v) => Some(FieldValue::I64(*v)),
            Val::F32(bits) => Some(FieldValue::F32(f32::from_bits(*bits))),
            Val::F64(bits) => Some(FieldValue::F64(f64::from_bits(*bits))),
            _ => None,
        }
    }

    fn to_val(self) -> Val {
        match self {
            FieldValue::I32(v) => Val::I32(v),
            FieldValue::I64(v) => Val::I64(v),
            FieldValue::F32(v) => Val::F32(v.to_bits()),
            FieldValue::F64(v) => Val::F64(v.to_bits()),
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentState
// ---------------------------------------------------------------------------

/// Serialized fields of one instance, captured before a swap.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    pub component: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl ComponentState {
    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.fields.get(field).copied()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "component": self.component,
            "fields": self.fields,
        })
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Result of [`ComponentInstance::restore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// Fields whose saved value was written into the new instance.
    pub restored: Vec<String>,
    /// Saved fields the new version dropped or retyped.
    pub skipped: Vec<String>,
}

// ---------------------------------------------------------------------------
// ComponentInstance
// ---------------------------------------------------------------------------

/// One running copy of a component.
pub struct ComponentInstance {
    ty: Arc<ComponentType>,
    store: Store<ComponentHost>,
    instance: Instance,
}

impl ComponentInstance {
    pub(crate) fn new(ty: Arc<ComponentType>, store: Store<ComponentHost>, instance: Instance) -> Self {
        Self {
            ty,
            store,
            instance,
        }
    }

    pub fn name(&self) -> &str {
        self.ty.name()
    }

    pub fn component_type(&self) -> &Arc<ComponentType> {
        &self.ty
    }

    /// Context of the code this instance runs.
    pub fn context_id(&self) -> ContextId {
        self.ty.context_id()
    }

    /// Host calls made during the last hook.
    pub fn host_call_count(&self) -> u32 {
        self.store.data().host_call_count
    }

    /// Fuel left over from the last hook.
    pub fn fuel_remaining(&self) -> u64 {
        self.store.get_fuel().unwrap_or(0)
    }

    // -- Lifecycle hooks ----------------------------------------------------

    /// Run `on_attach`, if exported.
    pub fn on_attach(&mut self, transform: &mut Transform) -> Result<(), HotReloadError> {
        if !self.ty.hooks().on_attach {
            return Ok(());
        }
        self.invoke("on_attach", (), transform).map(|_| ())
    }

    /// Run `update(dt)`, if exported. Returns fuel consumed.
    pub fn update(&mut self, transform: &mut Transform, dt: f32) -> Result<u64, HotReloadError> {
        if !self.ty.hooks().update {
            return Ok(0);
        }
        self.invoke("update", dt, transform)
    }

    /// Run `on_detach`, if exported.
    pub fn on_detach(&mut self, transform: &mut Transform) -> Result<(), HotReloadError> {
        if !self.ty.hooks().on_detach {
            return Ok(());
        }
        self.invoke("on_detach", (), transform).map(|_| ())
    }

    // -- Fields -------------------------------------------------------------

    /// Current value of a field (parameter or serialized).
    pub fn field(&mut self, name: &str) -> Option<FieldValue> {
        let decl = self.ty.field(name)?;
        let global = self.instance.get_global(&mut self.store, &decl.export)?;
        FieldValue::from_val(&global.get(&mut self.store))
    }

    /// Overwrite a field.
    ///
    /// # Errors
    ///
    /// [`HotReloadError::Runtime`] if the field does not exist or the value
    /// has a different type.
    pub fn set_field(&mut self, name: &str, value: FieldValue) -> Result<(), HotReloadError> {
        let decl = self.ty.field(name).ok_or_else(|| {
            HotReloadError::Runtime(format!("component '{}' has no field '{name}'", self.ty.name()))
        })?;
        if decl.kind != value.kind() {
            return Err(HotReloadError::Runtime(format!(
                "field '{name}' is {:?}, got {:?}",
                decl.kind,
                value.kind()
            )));
        }
        let global = self
            .instance
            .get_global(&mut self.store, &decl.export)
            .ok_or_else(|| HotReloadError::Runtime(format!("export '{}' vanished", decl.export)))?;
        global
            .set(&mut self.store, value.to_val())
            .map_err(|e| HotReloadError::Runtime(format!("failed to set field '{name}': {e}")))
    }

    /// Every field, serialized or not.
    pub fn fields(&mut self) -> BTreeMap<String, FieldValue> {
        let names: Vec<String> = self.ty.fields().iter().map(|f| f.name.clone()).collect();
        names
            .into_iter()
            .filter_map(|name| self.field(&name).map(|v| (name, v)))
            .collect()
    }

    /// Capture the serialized (`state.`) fields.
    pub fn snapshot(&mut self) -> ComponentState {
        let names: Vec<String> = self
            .ty
            .fields()
            .iter()
            .filter(|f| f.serialized)
            .map(|f| f.name.clone())
            .collect();
        let fields = names
            .into_iter()
            .filter_map(|name| self.field(&name).map(|v| (name, v)))
            .collect();
        ComponentState {
            component: self.ty.name().to_owned(),
            fields,
        }
    }

    /// Write saved fields into this instance.
    ///
    /// A saved field is restored when this version declares a serialized
    /// field of the same name and type; everything else is skipped.
    pub fn restore(&mut self, state: &ComponentState) -> RestoreReport {
        let mut report = RestoreReport::default();
        for (name, value) in &state.fields {
            let compatible = self
                .ty
                .field(name)
                .is_some_and(|decl| decl.serialized && decl.kind == value.kind());
            if compatible && self.set_field(name, *value).is_ok() {
                report.restored.push(name.clone());
            } else {
                report.skipped.push(name.clone());
            }
        }
        report
    }

    // -- Internal helpers ---------------------------------------------------

    fn invoke<P: WasmParams>(
        &mut self,
        hook: &str,
        params: P,
        transform: &mut Transform,
    ) -> Result<u64, HotReloadError> {
        let budget = self.ty.limits().fuel_per_call;
        self.store
            .set_fuel(budget)
            .map_err(|e| HotReloadError::Runtime(format!("failed to set fuel: {e}")))?;
        self.store.data_mut().begin_call(*transform);

        let export = self.ty.hook_export(hook);
        let func = self
            .instance
            .get_typed_func::<P, ()>(&mut self.store, &export)
            .map_err(|e| HotReloadError::Runtime(format!("failed to resolve {export}: {e}")))?;

        func.call(&mut self.store, params)
            .map_err(|e| classify_error(e, budget))?;

        *transform = self.store.data().transform;

        let remaining = self
            .store
            .get_fuel()
            .map_err(|e| HotReloadError::Runtime(format!("failed to read fuel: {e}")))?;
        let consumed = budget.saturating_sub(remaining);

        tracing::trace!(
            component = %self.ty.name(),
            hook,
            fuel_consumed = consumed,
            "hook completed"
        );

        Ok(consumed)
    }
}

impl Component for ComponentInstance {
    fn component_name(&self) -> &str {
        self.ty.name()
    }
}

impl std::fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentInstance")
            .field("name", &self.ty.name())
            .field("context", &self.ty.context_id())
            .field("fuel_remaining", &self.fuel_remaining())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
