//! Fixed-timestep frame loop with hot reload folded into each frame.
//!
//! Each [`FrameLoop::tick`]:
//!
//! 1. Polls the [`Orchestrator`]. If a debounced change is due, components
//!    are recompiled and live attachments swapped before anything updates.
//! 2. Calls `update(dt)` on every attached component instance, in node order.
//! 3. Advances the frame counter.
//!
//! A component whose update traps or runs out of fuel is logged and counted
//! in [`FrameDiagnostics`]; the loop and every other component keep running.
//!
//! # Example
//!
//! ```
//! use nomai_hotreload::prelude::*;
//!
//! let dir = std::env::temp_dir().join("nomai-hotreload-tick-doc");
//! std::fs::create_dir_all(&dir).unwrap();
//! std::fs::write(
//!     dir.join("Drift.wat"),
//!     r#"(module
//!         (import "host" "translate" (func $t (param f32 f32 f32)))
//!         (func (export "Drift.update") (param $dt f32)
//!           (call $t (local.get $dt) (f32.const 0) (f32.const 0))))"#,
//! ).unwrap();
//!
//! let config = HotReloadConfig::default().with_component_dir(&dir);
//! let mut frames = FrameLoop::from_config(&config, FrameConfig { fixed_dt: 0.5 }).unwrap();
//! let node = frames.spawn_with("mover", Transform::default(), &["Drift"]);
//! frames.run_ticks(4);
//!
//! assert_eq!(frames.scene().transform(node).unwrap().position.x, 2.0);
//! ```

use std::time::{Duration, Instant};

use nomai_scene::{NodeId, Scene, Transform};

use crate::attach::{attach_instance, detach_instance};
use crate::config::HotReloadConfig;
use crate::instance::ComponentInstance;
use crate::orchestrator::{ChangeFeed, Orchestrator, PassReport};
use crate::registry::{ComponentRegistry, ShutdownReport};
use crate::HotReloadError;

// ---------------------------------------------------------------------------
// FrameConfig
// ---------------------------------------------------------------------------

/// Configuration for the fixed-timestep frame loop.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Seconds per frame. Must be positive and finite.
    pub fixed_dt: f64,
}

impl Default for FrameConfig {
    /// 60 Hz.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
        }
    }
}

// ---------------------------------------------------------------------------
// FrameDiagnostics
// ---------------------------------------------------------------------------

/// What happened during the last frame.
#[derive(Debug, Clone, Default)]
pub struct FrameDiagnostics {
    /// Time spent polling the orchestrator (recompiles and swaps included).
    pub reload_time: Duration,
    /// Time spent running component updates.
    pub update_time: Duration,
    /// Component updates that returned normally.
    pub components_updated: usize,
    /// Component updates that trapped or ran out of fuel.
    pub component_errors: usize,
    /// Fuel consumed across all updates.
    pub fuel_consumed: u64,
    /// Set when a recompilation pass ran this frame.
    pub reload_pass: Option<u64>,
}

// ---------------------------------------------------------------------------
// FrameLoop
// ---------------------------------------------------------------------------

/// Drives a scene of component instances and keeps it hot-reloadable.
pub struct FrameLoop {
    scene: Scene<ComponentInstance>,
    orchestrator: Orchestrator,
    frame_counter: u64,
    fixed_dt: f64,
    last_diagnostics: FrameDiagnostics,
}

impl FrameLoop {
    /// Create a frame loop over an existing scene and orchestrator.
    ///
    /// # Panics
    ///
    /// Panics if `config.fixed_dt` is not positive and finite.
    pub fn new(
        scene: Scene<ComponentInstance>,
        orchestrator: Orchestrator,
        config: FrameConfig,
    ) -> Self {
        assert!(
            config.fixed_dt > 0.0 && config.fixed_dt.is_finite(),
            "fixed_dt must be positive and finite, got {}",
            config.fixed_dt
        );
        Self {
            scene,
            orchestrator,
            frame_counter: 0,
            fixed_dt: config.fixed_dt,
            last_diagnostics: FrameDiagnostics::default(),
        }
    }

    /// Empty scene plus a registry and orchestrator built from `config`.
    ///
    /// Nothing watches the filesystem yet; start a
    /// [`SourceWatcher`](crate::SourceWatcher) on [`feed`](Self::feed) for that.
    pub fn from_config(
        config: &HotReloadConfig,
        frame: FrameConfig,
    ) -> Result<Self, HotReloadError> {
        let registry = ComponentRegistry::new(config)?;
        let orchestrator = Orchestrator::new(registry, ChangeFeed::new(), config.debounce());
        Ok(Self::new(Scene::new(), orchestrator, frame))
    }

    /// Run one frame with the current time.
    pub fn tick(&mut self) -> Option<PassReport> {
        self.tick_at(Instant::now())
    }

    /// Run one frame, using `now` for the debounce check.
    pub fn tick_at(&mut self, now: Instant) -> Option<PassReport> {
        let reload_start = Instant::now();
        let report = self.orchestrator.update_at(now, &mut self.scene);
        let reload_time = reload_start.elapsed();

        let update_start = Instant::now();
        let dt = self.fixed_dt as f32;
        let mut diagnostics = FrameDiagnostics {
            reload_time,
            reload_pass: report.as_ref().map(|r| r.pass),
            ..FrameDiagnostics::default()
        };
        self.scene
            .for_each_component_mut(|node, transform, component| {
                match component.update(transform, dt) {
                    Ok(fuel) => {
                        diagnostics.components_updated += 1;
                        diagnostics.fuel_consumed += fuel;
                    }
                    Err(e) => {
                        diagnostics.component_errors += 1;
                        tracing::warn!(
                            component = %component.name(),
                            node = %node,
                            error = %e,
                            "component update failed"
                        );
                    }
                }
            });
        diagnostics.update_time = update_start.elapsed();

        self.frame_counter += 1;
        tracing::trace!(
            frame = self.frame_counter,
            updated = diagnostics.components_updated,
            errors = diagnostics.component_errors,
            "frame complete"
        );
        self.last_diagnostics = diagnostics;
        report
    }

    /// Run `count` frames. Returns the recompilation passes that ran.
    pub fn run_ticks(&mut self, count: u64) -> Vec<PassReport> {
        (0..count).filter_map(|_| self.tick()).collect()
    }

    // -- Scene setup --------------------------------------------------------

    /// Spawn a node and attach the named components.
    ///
    /// Components that are unavailable or refuse to attach are logged and
    /// skipped; the node is spawned regardless.
    pub fn spawn_with(&mut self, name: &str, transform: Transform, components: &[&str]) -> NodeId {
        let node = self.scene.spawn(name, transform);
        for component in components {
            if let Err(e) = self.attach(node, component) {
                tracing::warn!(node = %node, component = %component, error = %e, "component not attached");
            }
        }
        node
    }

    /// Attach a fresh instance of `component` to `node`, compiling it on
    /// first use.
    ///
    /// # Errors
    ///
    /// The source, compile, or load failure behind a component that has no
    /// registered version yet, or the instantiation or attach failure.
    pub fn attach(&mut self, node: NodeId, component: &str) -> Result<(), HotReloadError> {
        let registry = self.orchestrator.registry_mut();
        let instance = if registry.contains(component) {
            registry.instantiate(component)?
        } else {
            registry.reload(component)?.instantiate()?
        };
        attach_instance(&mut self.scene, node, instance)
    }

    /// Detach `component` from `node`, running its `on_detach` hook.
    pub fn detach(&mut self, node: NodeId, component: &str) -> Option<ComponentInstance> {
        detach_instance(&mut self.scene, node, component)
    }

    /// Serialized state of every attached component as JSON.
    pub fn dump_state(&mut self) -> serde_json::Value {
        let mut states = Vec::new();
        self.scene.for_each_component_mut(|node, _, component| {
            states.push((node, component.snapshot()));
        });
        let entries = states
            .into_iter()
            .map(|(node, state)| {
                serde_json::json!({
                    "node": node.to_string(),
                    "node_name": self.scene.name(node),
                    "state": state.to_json(),
                })
            })
            .collect();
        serde_json::Value::Array(entries)
    }

    /// Drop every instance, then release every context.
    pub fn shutdown(mut self) -> ShutdownReport {
        self.scene = Scene::new();
        self.orchestrator.registry_mut().shutdown()
    }

    // -- Accessors ----------------------------------------------------------

    pub fn frame_count(&self) -> u64 {
        self.frame_counter
    }

    /// `frame_count * fixed_dt`, computed without accumulation.
    pub fn sim_time(&self) -> f64 {
        self.frame_counter as f64 * self.fixed_dt
    }

    pub fn fixed_dt(&self) -> f64 {
        self.fixed_dt
    }

    pub fn scene(&self) -> &Scene<ComponentInstance> {
        &self.scene
    }

    pub fn scene_mut(&mut self) -> &mut Scene<ComponentInstance> {
        &mut self.scene
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut Orchestrator {
        &mut self.orchestrator
    }

    /// Change feed to hand to a watcher thread.
    pub fn feed(&self) -> ChangeFeed {
        self.orchestrator.feed().clone()
    }

    pub fn last_diagnostics(&self) -> &FrameDiagnostics {
        &self.last_diagnostics
    }
}

impl std::fmt::Debug for FrameLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLoop")
            .field("frame_counter", &self.frame_counter)
            .field("fixed_dt", &self.fixed_dt)
            .field("scene", &self.scene)
            .field("orchestrator", &self.orchestrator)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
