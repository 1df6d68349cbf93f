//! Nomai Hot Reload -- live recompilation and swapping of scene components.
//!
//! Components are WebAssembly text files (`Rotator.wat` defines the logical
//! component `Rotator`). While the frame loop keeps running, edited files are
//! recompiled, loaded into a fresh isolated context, and every node using the
//! component has its instance swapped for one built from the new code. A bad
//! edit never takes the scene down: the last good version keeps running until
//! a fix compiles.
//!
//! # Architecture
//!
//! - **[`Compiler`]**: turns a [`SourceUnit`] (primary text plus auxiliary
//!   modules) into a [`CompiledModule`] or a list of [`Diagnostic`]s.
//! - **[`Loader`]**: loads a compiled module into a [`ModuleLoadContext`] and
//!   resolves the [`ComponentType`] named after the logical component.
//! - **[`ComponentRegistry`]**: one live context per logical name; replaces
//!   entries on successful reloads and releases the superseded contexts.
//! - **[`Orchestrator`]**: debounces change notifications from a
//!   [`ChangeFeed`] and swaps live attachments on the owning thread.
//! - **[`FrameLoop`]**: fixed-timestep driver that polls the orchestrator and
//!   updates every attached component.
//!
//! # Component convention
//!
//! Exports named `<Type>.<member>` belong to component type `<Type>`:
//! `update(f32)`, `on_attach()`, `on_detach()` hooks; exported mutable
//! globals are fields, and those under `<Type>.state.` survive a swap.
//!
//! ```
//! use nomai_hotreload::{HotReloadConfig, ComponentRegistry};
//!
//! let dir = std::env::temp_dir().join("nomai-hotreload-doc");
//! std::fs::create_dir_all(&dir).unwrap();
//! std::fs::write(
//!     dir.join("Spinner.wat"),
//!     r#"(module
//!         (import "host" "rotate" (func $rotate (param f32 f32 f32)))
//!         (global $speed (export "Spinner.Speed") (mut f32) (f32.const 90))
//!         (func (export "Spinner.update") (param $dt f32)
//!           (call $rotate (f32.const 0) (f32.mul (global.get $speed) (local.get $dt)) (f32.const 0))))"#,
//! ).unwrap();
//!
//! let config = HotReloadConfig::default().with_component_dir(&dir);
//! let mut registry = ComponentRegistry::new(&config).unwrap();
//! let instance = registry.get_or_create("Spinner", false);
//! assert!(instance.is_some());
//! ```

#![deny(unsafe_code)]

pub mod attach;
pub mod compiler;
pub mod config;
pub mod host_api;
pub mod instance;
pub mod loader;
pub mod orchestrator;
pub mod registry;
pub mod source;
pub mod tick;
pub mod watcher;

use std::path::PathBuf;

pub use attach::SceneAttachments;
pub use compiler::{CompileFailure, CompiledModule, Compiler, Diagnostic, Severity, SourceLocation};
pub use config::HotReloadConfig;
pub use host_api::ComponentHost;
pub use instance::{ComponentInstance, ComponentState, FieldValue, RestoreReport};
pub use loader::{ComponentType, ContextId, LoadFailure, Loader, ModuleLoadContext, UnloadOutcome};
pub use orchestrator::{ChangeFeed, Orchestrator, OrchestratorState, PassReport, SwapOutcome};
pub use registry::{ComponentRegistry, DropUnloader, Refresh, ShutdownReport, Unloader};
pub use source::{AuxSource, ComponentSources, SourceUnit};
pub use tick::{FrameConfig, FrameDiagnostics, FrameLoop};
pub use watcher::SourceWatcher;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the hot-reload pipeline.
#[derive(Debug, thiserror::Error)]
pub enum HotReloadError {
    /// The component's source did not compile.
    #[error(transparent)]
    Compile(#[from] CompileFailure),

    /// The source compiled but did not yield a usable component type.
    #[error(transparent)]
    TypeResolution(#[from] LoadFailure),

    /// The new version loaded but could not be instantiated.
    #[error("component '{name}' cannot be instantiated: {source}")]
    Instantiate {
        /// Logical component name.
        name: String,
        /// The failure from the trial instantiation.
        #[source]
        source: Box<HotReloadError>,
    },

    /// A source file could not be read.
    #[error("failed to read component source {}: {source}", path.display())]
    Source {
        /// The file that failed to read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No registry entry exists for this logical name.
    #[error("no component named '{0}' is registered")]
    UnknownComponent(String),

    /// Releasing a superseded context failed.
    #[error("failed to release context {context} of component '{name}': {reason}")]
    ContextRelease {
        /// Logical component name.
        name: String,
        /// The context that failed to release.
        context: ContextId,
        /// Why the release failed.
        reason: String,
    },

    /// A node refused the new instance during a swap or attach.
    #[error("could not attach '{name}' to node {node}: {reason}")]
    Attachment {
        /// Display form of the node handle.
        node: String,
        /// Logical component name.
        name: String,
        /// Why the attach failed.
        reason: String,
    },

    /// A component hook exhausted its fuel budget.
    #[error("component ran out of fuel (budget: {budget} units) -- possible infinite loop in a hook")]
    OutOfFuel {
        /// The fuel budget that was exceeded.
        budget: u64,
    },

    /// A WASM trap occurred while running a component hook.
    #[error("component trapped: {0}")]
    Trap(String),

    /// A general runtime error from the Wasmtime engine.
    #[error("component runtime error: {0}")]
    Runtime(String),

    /// The file watcher could not be started.
    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// Invalid configuration.
    #[error("invalid hot-reload configuration: {0}")]
    Config(String),
}

impl HotReloadError {
    /// Returns `true` for failures that leave the previous component version
    /// in place (bad source, no usable type, or a type that cannot be
    /// instantiated).
    pub fn is_recoverable_edit(&self) -> bool {
        matches!(
            self,
            HotReloadError::Compile(_)
                | HotReloadError::TypeResolution(_)
                | HotReloadError::Instantiate { .. }
        )
    }
}

/// Convenience re-exports for common hot-reload usage.
pub mod prelude {
    pub use crate::attach::SceneAttachments;
    pub use crate::config::HotReloadConfig;
    pub use crate::instance::{ComponentInstance, ComponentState, FieldValue};
    pub use crate::orchestrator::{ChangeFeed, Orchestrator, PassReport, SwapOutcome};
    pub use crate::registry::ComponentRegistry;
    pub use crate::tick::{FrameConfig, FrameLoop};
    pub use crate::HotReloadError;
    pub use nomai_scene::prelude::*;
}
