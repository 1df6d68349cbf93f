//! Host API exposed to component code.
//!
//! Defines the [`ComponentHost`] state that lives inside each component's
//! Wasmtime [`Store`](wasmtime::Store) and registers the host functions under
//! the `"host"` import namespace. This namespace is the only reference set a
//! component may import from besides its auxiliary modules.
//!
//! # Host Functions (registered under `"host"`)
//!
//! ## Read
//! - `position_x() -> f32`, `position_y() -> f32`, `position_z() -> f32`
//! - `rotation_x() -> f32`, `rotation_y() -> f32`, `rotation_z() -> f32`
//!
//! ## Write
//! - `set_position(x: f32, y: f32, z: f32)`
//! - `translate(x: f32, y: f32, z: f32)`
//! - `rotate(x: f32, y: f32, z: f32)` -- Euler degrees
//!
//! ## Utility
//! - `log(level: i32, msg_ptr: i32, msg_len: i32)`
//!
//! Reads and writes go to a copy of the node transform that the caller
//! loads before a hook runs and copies back after it returns.

use nomai_scene::{Transform, Vec3};
use wasmtime::{Caller, Linker, StoreLimits, StoreLimitsBuilder};

/// Import namespace for host functions.
pub const HOST_MODULE: &str = "host";

/// Every function registered by [`register_host_api`].
pub const HOST_FUNCTIONS: &[&str] = &[
    "position_x",
    "position_y",
    "position_z",
    "rotation_x",
    "rotation_y",
    "rotation_z",
    "set_position",
    "translate",
    "rotate",
    "log",
];

// ---------------------------------------------------------------------------
// ComponentHost
// ---------------------------------------------------------------------------

/// State held inside a component's store for host function dispatch.
pub struct ComponentHost {
    /// Logical component name, attached to log output.
    pub component: String,

    /// Working copy of the owning node's transform for the current hook.
    pub transform: Transform,

    /// Host calls made since the last [`begin_call`](Self::begin_call).
    pub host_call_count: u32,

    /// Resource limits enforced by the store's limiter.
    pub limits: StoreLimits,
}

impl ComponentHost {
    pub fn new(component: impl Into<String>, memory_limit_bytes: usize) -> Self {
        Self {
            component: component.into(),
            transform: Transform::default(),
            host_call_count: 0,
            limits: StoreLimitsBuilder::new()
                .memory_size(memory_limit_bytes)
                .build(),
        }
    }

    /// Load the node transform before running a hook.
    pub fn begin_call(&mut self, transform: Transform) {
        self.transform = transform;
        self.host_call_count = 0;
    }
}

impl std::fmt::Debug for ComponentHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentHost")
            .field("component", &self.component)
            .field("transform", &self.transform)
            .field("host_call_count", &self.host_call_count)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Host function registration
// ---------------------------------------------------------------------------

/// Register all host functions under the `"host"` namespace.
///
/// # Errors
///
/// Returns an error if a function fails to register (only on a Wasmtime API
/// mismatch).
pub fn register_host_api(linker: &mut Linker<ComponentHost>) -> Result<(), anyhow::Error> {
    // -- READ functions -------------------------------------------------------

    linker.func_wrap(HOST_MODULE, "position_x", |mut c: Caller<'_, ComponentHost>| {
        read_transform(&mut c, |t| t.position.x)
    })?;
    linker.func_wrap(HOST_MODULE, "position_y", |mut c: Caller<'_, ComponentHost>| {
        read_transform(&mut c, |t| t.position.y)
    })?;
    linker.func_wrap(HOST_MODULE, "position_z", |mut c: Caller<'_, ComponentHost>| {
        read_transform(&mut c, |t| t.position.z)
    })?;
    linker.func_wrap(HOST_MODULE, "rotation_x", |mut c: Caller<'_, ComponentHost>| {
        read_transform(&mut c, |t| t.rotation.x)
    })?;
    linker.func_wrap(HOST_MODULE, "rotation_y", |mut c: Caller<'_, ComponentHost>| {
        read_transform(&mut c, |t| t.rotation.y)
    })?;
    linker.func_wrap(HOST_MODULE, "rotation_z", |mut c: Caller<'_, ComponentHost>| {
        read_transform(&mut c, |t| t.rotation.z)
    })?;

    // -- WRITE functions ------------------------------------------------------

    linker.func_wrap(HOST_MODULE, "set_position", host_set_position)?;
    linker.func_wrap(HOST_MODULE, "translate", host_translate)?;
    linker.func_wrap(HOST_MODULE, "rotate", host_rotate)?;

    // -- UTILITY functions ----------------------------------------------------

    linker.func_wrap(HOST_MODULE, "log", host_log)?;

    Ok(())
}

fn read_transform(
    caller: &mut Caller<'_, ComponentHost>,
    read: impl FnOnce(&Transform) -> f32,
) -> f32 {
    caller.data_mut().host_call_count += 1;
    read(&caller.data().transform)
}

/// `set_position(x, y, z)`
fn host_set_position(mut caller: Caller<'_, ComponentHost>, x: f32, y: f32, z: f32) {
    let host = caller.data_mut();
    host.host_call_count += 1;
    host.transform.position = Vec3::new(x, y, z);
}

/// `translate(x, y, z)`
fn host_translate(mut caller: Caller<'_, ComponentHost>, x: f32, y: f32, z: f32) {
    let host = caller.data_mut();
    host.host_call_count += 1;
    host.transform.translate(Vec3::new(x, y, z));
}

/// `rotate(x, y, z)` -- degrees, wrapped into `[0, 360)`.
fn host_rotate(mut caller: Caller<'_, ComponentHost>, x: f32, y: f32, z: f32) {
    let host = caller.data_mut();
    host.host_call_count += 1;
    host.transform.rotate(Vec3::new(x, y, z));
}

/// `log(level, msg_ptr, msg_len)`
///
/// Levels: 0 trace, 1 debug, 2 info, 3 warn, 4+ error.
fn host_log(mut caller: Caller<'_, ComponentHost>, level: i32, ptr: i32, len: i32) {
    caller.data_mut().host_call_count += 1;

    let message = match read_wasm_string(&mut caller, ptr, len) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "log: failed to read message from component memory");
            return;
        }
    };

    let component = caller.data().component.as_str();
    match level {
        i32::MIN..=0 => tracing::trace!(component, "{message}"),
        1 => tracing::debug!(component, "{message}"),
        2 => tracing::info!(component, "{message}"),
        3 => tracing::warn!(component, "{message}"),
        _ => tracing::error!(component, "{message}"),
    }
}

/// Read a UTF-8 string from the component's exported `memory`.
fn read_wasm_string(
    caller: &mut Caller<'_, ComponentHost>,
    ptr: i32,
    len: i32,
) -> Result<String, String> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| {
            "component must export 'memory' to use string-based host functions -- \
             add `(memory (export \"memory\") 1)` to the module"
                .to_owned()
        })?;

    if ptr < 0 || len < 0 {
        return Err(format!("negative string bounds: ptr={ptr}, len={len}"));
    }

    let data = memory.data(&caller);
    let start = ptr as usize;
    let end = start + len as usize;

    if end > data.len() {
        return Err(format!(
            "string read out of bounds: ptr={ptr}, len={len}, memory_size={}",
            data.len()
        ));
    }

    String::from_utf8(data[start..end].to_vec())
        .map_err(|e| format!("string at ptr={ptr} len={len} is not valid UTF-8: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, Module, Store};

    fn run(wat: &str, transform: Transform) -> (Transform, u32) {
        let engine = Engine::default();
        let mut linker = Linker::new(&engine);
        register_host_api(&mut linker).unwrap();
        let module = Module::new(&engine, wat).unwrap();
        let mut store = Store::new(&engine, ComponentHost::new("Test", 1 << 20));
        store.data_mut().begin_call(transform);
        let instance = linker.instantiate(&mut store, &module).unwrap();
        let run = instance
            .get_typed_func::<(), ()>(&mut store, "run")
            .unwrap();
        run.call(&mut store, ()).unwrap();
        (store.data().transform, store.data().host_call_count)
    }

    #[test]
    fn every_listed_function_is_registered() {
        let engine = Engine::default();
        let mut linker: Linker<ComponentHost> = Linker::new(&engine);
        register_host_api(&mut linker).unwrap();
        let mut store = Store::new(&engine, ComponentHost::new("Test", 1 << 20));
        for name in HOST_FUNCTIONS {
            assert!(
                linker.get(&mut store, HOST_MODULE, name).is_some(),
                "host function {name} is not registered"
            );
        }
    }

    #[test]
    fn translate_and_rotate_edit_working_transform() {
        let wat = r#"(module
            (import "host" "translate" (func $translate (param f32 f32 f32)))
            (import "host" "rotate" (func $rotate (param f32 f32 f32)))
            (func (export "run")
              (call $translate (f32.const 1) (f32.const 2) (f32.const 3))
              (call $rotate (f32.const 0) (f32.const 370) (f32.const 0))))"#;
        let (t, calls) = run(wat, Transform::default());
        assert_eq!(t.position, Vec3::new(1.0, 2.0, 3.0));
        assert!(t.rotation.approx_eq(Vec3::new(0.0, 10.0, 0.0), 1e-4));
        assert_eq!(calls, 2);
    }

    #[test]
    fn reads_see_loaded_transform() {
        let wat = r#"(module
            (import "host" "position_y" (func $py (result f32)))
            (import "host" "set_position" (func $set (param f32 f32 f32)))
            (func (export "run")
              (call $set (f32.const 0) (f32.add (call $py) (f32.const 1)) (f32.const 0))))"#;
        let (t, calls) = run(wat, Transform::from_position(Vec3::new(5.0, 4.0, 5.0)));
        assert_eq!(t.position, Vec3::new(0.0, 5.0, 0.0));
        assert_eq!(calls, 2);
    }

    #[test]
    fn log_without_memory_is_ignored() {
        let wat = r#"(module
            (import "host" "log" (func $log (param i32 i32 i32)))
            (func (export "run") (call $log (i32.const 2) (i32.const 0) (i32.const 4))))"#;
        let (_, calls) = run(wat, Transform::default());
        assert_eq!(calls, 1);
    }

    #[test]
    fn log_reads_exported_memory() {
        let wat = r#"(module
            (import "host" "log" (func $log (param i32 i32 i32)))
            (memory (export "memory") 1)
            (data (i32.const 16) "hello")
            (func (export "run") (call $log (i32.const 2) (i32.const 16) (i32.const 5))))"#;
        let (_, calls) = run(wat, Transform::default());
        assert_eq!(calls, 1);
    }
}
