//! Debounced recompilation and live swapping.
//!
//! Change notifications may come from any thread through a [`ChangeFeed`].
//! They only mark names dirty and reset the debounce timer. All compiling,
//! instantiating, and attaching happens inside [`Orchestrator::update`],
//! which the frame loop polls on the thread that owns the scene.
//!
//! ```text
//! Idle -> PendingRecompile -> Recompiling -> Swapping -> Idle
//!              ^      |             |
//!              +------+             +-- failure --> Idle
//!           notify resets the timer
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::attach::SceneAttachments;
use crate::instance::ComponentInstance;
use crate::loader::ComponentType;
use crate::registry::{ComponentRegistry, Refresh};
use crate::HotReloadError;

// ---------------------------------------------------------------------------
// ChangeFeed
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FeedState {
    dirty: BTreeSet<String>,
    last_event: Option<Instant>,
}

/// Thread-safe dirty set plus debounce timestamp.
#[derive(Debug, Clone, Default)]
pub struct ChangeFeed {
    inner: Arc<Mutex<FeedState>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `name` dirty and reset the debounce timer to now.
    pub fn notify(&self, name: impl Into<String>) {
        self.notify_at(name, Instant::now());
    }

    /// Mark `name` dirty as of `at`.
    pub fn notify_at(&self, name: impl Into<String>, at: Instant) {
        let name = name.into();
        let mut state = self.lock();
        tracing::trace!(component = %name, "change notification");
        state.dirty.insert(name);
        state.last_event = Some(state.last_event.map_or(at, |last| last.max(at)));
    }

    pub fn is_dirty(&self) -> bool {
        !self.lock().dirty.is_empty()
    }

    /// Time of the most recent pending notification.
    pub fn last_event(&self) -> Option<Instant> {
        self.lock().last_event
    }

    /// Take the dirty set if nothing arrived within `debounce` before `now`.
    ///
    /// Checking and taking happen under one lock, so a notification racing
    /// with the take either lands in this batch or re-arms the timer.
    fn take_if_quiet(&self, now: Instant, debounce: Duration) -> Option<BTreeSet<String>> {
        let mut state = self.lock();
        let last = state.last_event?;
        if state.dirty.is_empty() || now.saturating_duration_since(last) < debounce {
            return None;
        }
        state.last_event = None;
        Some(std::mem::take(&mut state.dirty))
    }

    fn lock(&self) -> MutexGuard<'_, FeedState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Where the orchestrator is in its reload cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    /// Changes are queued; waiting for the debounce window to pass.
    PendingRecompile,
    Recompiling,
    Swapping,
}

/// What a pass did with one component name.
#[derive(Debug)]
pub enum SwapOutcome {
    /// A new version was registered and live attachments were swapped.
    Swapped {
        /// Attachments now running the new version.
        nodes: usize,
        /// Attachments that kept (or lost) the old version.
        failed: usize,
    },
    /// Sources matched the registered version.
    Unchanged,
    /// The new version was rejected; the old one keeps running.
    Failed(HotReloadError),
}

/// Result of one recompilation pass.
#[derive(Debug)]
pub struct PassReport {
    /// 1-based pass counter.
    pub pass: u64,
    /// Outcomes in processing (sorted) order.
    pub outcomes: Vec<(String, SwapOutcome)>,
}

impl PassReport {
    pub fn outcome(&self, name: &str) -> Option<&SwapOutcome> {
        self.outcomes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, outcome)| outcome)
    }

    /// Total attachments swapped to a new version in this pass.
    pub fn swapped_nodes(&self) -> usize {
        self.outcomes
            .iter()
            .map(|(_, o)| match o {
                SwapOutcome::Swapped { nodes, .. } => *nodes,
                _ => 0,
            })
            .sum()
    }

    pub fn has_failures(&self) -> bool {
        self.outcomes.iter().any(|(_, o)| match o {
            SwapOutcome::Swapped { failed, .. } => *failed > 0,
            SwapOutcome::Failed(_) => true,
            SwapOutcome::Unchanged => false,
        })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Turns change notifications into recompiles and live swaps.
pub struct Orchestrator {
    registry: ComponentRegistry,
    feed: ChangeFeed,
    debounce: Duration,
    state: OrchestratorState,
    passes: u64,
}

impl Orchestrator {
    pub fn new(registry: ComponentRegistry, feed: ChangeFeed, debounce: Duration) -> Self {
        Self {
            registry,
            feed,
            debounce,
            state: OrchestratorState::Idle,
            passes: 0,
        }
    }

    /// Poll with the current time. See [`update_at`](Self::update_at).
    pub fn update<S: SceneAttachments>(&mut self, scene: &mut S) -> Option<PassReport> {
        self.update_at(Instant::now(), scene)
    }

    /// Run a recompilation pass if changes are pending and the feed has
    /// been quiet for the debounce window as of `now`.
    ///
    /// Each dirty name, plus every registered component that links it as an
    /// auxiliary module, is processed in sorted order. Names the registry
    /// never handed out are ignored. A name is recompiled only when its
    /// source digest changed, and live attachments are swapped only when the
    /// new version loads. Names are processed one at a time: a pass is not
    /// transactional across names.
    pub fn update_at<S: SceneAttachments>(
        &mut self,
        now: Instant,
        scene: &mut S,
    ) -> Option<PassReport> {
        if !self.feed.is_dirty() {
            self.state = OrchestratorState::Idle;
            return None;
        }
        let Some(dirty) = self.feed.take_if_quiet(now, self.debounce) else {
            self.state = OrchestratorState::PendingRecompile;
            return None;
        };

        self.passes += 1;
        let mut names = BTreeSet::new();
        for name in &dirty {
            if self.registry.is_tracked(name) {
                names.insert(name.clone());
            }
            names.extend(self.registry.dependents_of(name));
        }
        tracing::debug!(
            pass = self.passes,
            dirty = dirty.len(),
            components = names.len(),
            "recompilation pass"
        );

        let mut outcomes = Vec::with_capacity(names.len());
        for name in names {
            self.state = OrchestratorState::Recompiling;
            let outcome = match self.registry.refresh(&name) {
                Ok(Refresh::Unchanged) => SwapOutcome::Unchanged,
                Ok(Refresh::Reloaded(ty)) => {
                    self.state = OrchestratorState::Swapping;
                    swap_attachments(scene, &name, &ty)
                }
                Err(e) => {
                    tracing::warn!(
                        component = %name,
                        error = %e,
                        "reload failed; previous version stays live"
                    );
                    SwapOutcome::Failed(e)
                }
            };
            outcomes.push((name, outcome));
        }

        self.state = OrchestratorState::Idle;
        Some(PassReport {
            pass: self.passes,
            outcomes,
        })
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    /// Passes run so far, including ones where nothing changed.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.registry
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state)
            .field("passes", &self.passes)
            .field("debounce", &self.debounce)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Swapping
// ---------------------------------------------------------------------------

/// Swap every live `name` attachment to an instance of `ty`.
///
/// Per node: detach, snapshot, instantiate, `on_detach` on the old
/// instance, `on_attach` on the new one, restore, attach. Nodes are
/// independent; a failure on one does not undo the others.
fn swap_attachments<S: SceneAttachments>(
    scene: &mut S,
    name: &str,
    ty: &Arc<ComponentType>,
) -> SwapOutcome {
    let mut nodes = 0;
    let mut failed = 0;

    for node in scene.attached_nodes(name) {
        match swap_one(scene, node, name, ty) {
            Ok(()) => nodes += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(component = %name, node = %node, error = %e, "swap failed on node");
            }
        }
    }

    tracing::info!(
        component = %name,
        context = %ty.context_id(),
        nodes,
        failed,
        "component hot-swapped"
    );
    SwapOutcome::Swapped { nodes, failed }
}

fn swap_one<S: SceneAttachments>(
    scene: &mut S,
    node: S::Node,
    name: &str,
    ty: &Arc<ComponentType>,
) -> Result<(), HotReloadError> {
    let Some(mut old) = scene.detach_component(node, name) else {
        return Err(HotReloadError::Attachment {
            node: node.to_string(),
            name: name.to_owned(),
            reason: "attachment disappeared before swap".to_owned(),
        });
    };
    let state = old.snapshot();

    let mut new = match ty.instantiate() {
        Ok(instance) => instance,
        Err(e) => {
            reattach(scene, node, old);
            return Err(e);
        }
    };

    let Some(transform) = scene.node_transform_mut(node) else {
        reattach(scene, node, old);
        return Err(HotReloadError::Attachment {
            node: node.to_string(),
            name: name.to_owned(),
            reason: "node does not exist".to_owned(),
        });
    };
    if let Err(e) = old.on_detach(transform) {
        tracing::warn!(component = %name, node = %node, error = %e, "on_detach failed during swap");
    }
    if let Err(e) = new.on_attach(transform) {
        tracing::warn!(component = %name, node = %node, error = %e, "on_attach failed during swap");
    }

    let restored = new.restore(&state);
    if !restored.skipped.is_empty() {
        tracing::debug!(
            component = %name,
            node = %node,
            skipped = ?restored.skipped,
            "state fields not carried over"
        );
    }

    match scene.attach_component(node, new) {
        Ok(()) => Ok(()),
        Err((e, _rejected)) => {
            reattach(scene, node, old);
            Err(e)
        }
    }
}

fn reattach<S: SceneAttachments>(
    scene: &mut S,
    node: S::Node,
    old: ComponentInstance,
) {
    let name = old.name().to_owned();
    if let Err((e, _)) = scene.attach_component(node, old) {
        tracing::error!(component = %name, node = %node, error = %e, "could not restore previous instance");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HotReloadConfig;
    use crate::loader::ContextId;
    use nomai_scene::{NodeId, Scene, Transform};

    #[test]
    fn feed_waits_for_quiet_window() {
        let feed = ChangeFeed::new();
        let t0 = Instant::now();
        let debounce = Duration::from_millis(150);

        feed.notify_at("Rotator", t0);
        assert!(feed.take_if_quiet(t0 + Duration::from_millis(100), debounce).is_none());

        // A second event resets the timer.
        feed.notify_at("Oscillator", t0 + Duration::from_millis(100));
        assert!(feed.take_if_quiet(t0 + Duration::from_millis(200), debounce).is_none());

        let taken = feed
            .take_if_quiet(t0 + Duration::from_millis(250), debounce)
            .unwrap();
        assert_eq!(
            taken.into_iter().collect::<Vec<_>>(),
            vec!["Oscillator".to_owned(), "Rotator".to_owned()]
        );
        assert!(!feed.is_dirty());
        assert!(feed.last_event().is_none());
    }

    #[test]
    fn out_of_order_timestamps_keep_latest() {
        let feed = ChangeFeed::new();
        let t0 = Instant::now();
        feed.notify_at("A", t0 + Duration::from_millis(50));
        feed.notify_at("A", t0);
        assert_eq!(feed.last_event(), Some(t0 + Duration::from_millis(50)));
    }

    #[test]
    fn feed_is_shared_across_threads() {
        let feed = ChangeFeed::new();
        let remote = feed.clone();
        std::thread::spawn(move || remote.notify("Rotator"))
            .join()
            .unwrap();
        assert!(feed.is_dirty());
    }

    const SPIN_SLOW: &str = r#"(module
  (import "host" "rotate" (func $rotate (param f32 f32 f32)))
  (func (export "Spin.update") (param $dt f32)
    (call $rotate (f32.const 0) (f32.mul (f32.const 20) (local.get $dt)) (f32.const 0))))"#;

    const SPIN_FAST: &str = r#"(module
  (import "host" "rotate" (func $rotate (param f32 f32 f32)))
  (func (export "Spin.update") (param $dt f32)
    (call $rotate (f32.const 0) (f32.mul (f32.const 90) (local.get $dt)) (f32.const 0))))"#;

    /// A scene where one node only accepts instances of its original
    /// context, and one node loses its transform.
    struct PickyScene {
        scene: Scene<ComponentInstance>,
        picky: Option<(NodeId, ContextId)>,
        no_transform: Option<NodeId>,
    }

    impl SceneAttachments for PickyScene {
        type Node = NodeId;

        fn attached_nodes(&self, name: &str) -> Vec<NodeId> {
            self.scene.attached_nodes(name)
        }

        fn detach_component(&mut self, node: NodeId, name: &str) -> Option<ComponentInstance> {
            self.scene.detach_component(node, name)
        }

        fn attach_component(
            &mut self,
            node: NodeId,
            instance: ComponentInstance,
        ) -> Result<(), (HotReloadError, ComponentInstance)> {
            match self.picky {
                Some((picky, accepted)) if picky == node && instance.context_id() != accepted => Err((
                    HotReloadError::Attachment {
                        node: node.to_string(),
                        name: instance.name().to_owned(),
                        reason: "locked".to_owned(),
                    },
                    instance,
                )),
                _ => self.scene.attach_component(node, instance),
            }
        }

        fn node_transform_mut(&mut self, node: NodeId) -> Option<&mut Transform> {
            if self.no_transform == Some(node) {
                return None;
            }
            self.scene.node_transform_mut(node)
        }
    }

    fn picky_setup(dir: &std::path::Path) -> (Orchestrator, PickyScene, [NodeId; 3], ContextId) {
        std::fs::write(dir.join("Spin.wat"), SPIN_SLOW).unwrap();
        let config = HotReloadConfig::default().with_component_dir(dir);
        let mut orch = Orchestrator::new(
            ComponentRegistry::new(&config).unwrap(),
            ChangeFeed::new(),
            Duration::from_millis(150),
        );
        let mut scene = Scene::new();
        let nodes = [
            scene.spawn("a", Transform::default()),
            scene.spawn("b", Transform::default()),
            scene.spawn("c", Transform::default()),
        ];
        for node in nodes {
            let instance = orch.registry_mut().get_or_create("Spin", false).unwrap();
            scene.attach(node, instance).unwrap();
        }
        let original = orch.registry().component_type("Spin").unwrap().context_id();
        let scene = PickyScene {
            scene,
            picky: None,
            no_transform: None,
        };
        (orch, scene, nodes, original)
    }

    fn edit_and_pass(dir: &std::path::Path, orch: &mut Orchestrator, scene: &mut PickyScene) -> PassReport {
        std::fs::write(dir.join("Spin.wat"), SPIN_FAST).unwrap();
        let t0 = Instant::now();
        let debounce = orch.debounce();
        orch.feed().notify_at("Spin", t0);
        orch.update_at(t0 + debounce, scene).unwrap()
    }

    fn context_on(scene: &PickyScene, node: NodeId) -> ContextId {
        scene.scene.component(node, "Spin").unwrap().context_id()
    }

    #[test]
    fn refused_node_keeps_old_instance_while_others_swap() {
        let dir = tempfile::tempdir().unwrap();
        let (mut orch, mut scene, [a, b, c], original) = picky_setup(dir.path());
        scene.picky = Some((b, original));

        let report = edit_and_pass(dir.path(), &mut orch, &mut scene);
        assert!(matches!(
            report.outcome("Spin"),
            Some(SwapOutcome::Swapped { nodes: 2, failed: 1 })
        ));
        assert!(report.has_failures());

        let current = orch.registry().component_type("Spin").unwrap().context_id();
        assert_ne!(current, original);
        assert_eq!(context_on(&scene, a), current);
        assert_eq!(context_on(&scene, c), current);
        assert_eq!(context_on(&scene, b), original);
        assert_eq!(scene.scene.component_count(), 3);
    }

    #[test]
    fn missing_transform_puts_old_instance_back() {
        let dir = tempfile::tempdir().unwrap();
        let (mut orch, mut scene, [a, b, _], original) = picky_setup(dir.path());
        scene.no_transform = Some(a);

        let report = edit_and_pass(dir.path(), &mut orch, &mut scene);
        assert!(matches!(
            report.outcome("Spin"),
            Some(SwapOutcome::Swapped { nodes: 2, failed: 1 })
        ));
        assert_eq!(context_on(&scene, a), original);
        assert_ne!(context_on(&scene, b), original);
    }

    #[test]
    fn report_helpers() {
        let report = PassReport {
            pass: 1,
            outcomes: vec![
                ("A".to_owned(), SwapOutcome::Swapped { nodes: 2, failed: 0 }),
                ("B".to_owned(), SwapOutcome::Unchanged),
            ],
        };
        assert_eq!(report.swapped_nodes(), 2);
        assert!(!report.has_failures());
        assert!(matches!(report.outcome("B"), Some(SwapOutcome::Unchanged)));
        assert!(report.outcome("C").is_none());
    }
}
