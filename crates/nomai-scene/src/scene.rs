//! The scene: nodes, their transforms, and attached components.
//!
//! A node holds at most one component per component name. Components are
//! owned by their node; despawning a node drops everything attached to it.

use std::fmt;

use crate::node::{NodeAllocator, NodeId};
use crate::transform::Transform;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Anything that can be attached to a scene node.
pub trait Component {
    /// Logical name used to find every node holding this kind of component.
    fn component_name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by scene operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SceneError {
    /// The node id is stale or was never allocated.
    #[error("node {0} does not exist (despawned or stale handle)")]
    NoSuchNode(NodeId),

    /// The node already holds a component with this name.
    #[error("node {node} already has a '{component}' component attached")]
    DuplicateComponent {
        /// Target node.
        node: NodeId,
        /// Component name that collided.
        component: String,
    },
}

/// A failed attach, handing the component back to the caller.
pub struct AttachRejected<C> {
    /// Why the attach failed.
    pub error: SceneError,
    /// The component that was not attached.
    pub component: C,
}

impl<C> fmt::Debug for AttachRejected<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachRejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Scene
// ---------------------------------------------------------------------------

struct NodeSlot<C> {
    id: NodeId,
    name: String,
    transform: Transform,
    components: Vec<C>,
}

/// A flat scene of named nodes with attached components.
pub struct Scene<C> {
    allocator: NodeAllocator,
    slots: Vec<Option<NodeSlot<C>>>,
}

impl<C: Component> Scene<C> {
    /// Create an empty scene.
    pub fn new() -> Self {
        Self {
            allocator: NodeAllocator::new(),
            slots: Vec::new(),
        }
    }

    /// Add a node with the given transform and no components.
    pub fn spawn(&mut self, name: impl Into<String>, transform: Transform) -> NodeId {
        let id = self.allocator.allocate();
        let idx = id.index() as usize;
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        let name = name.into();
        tracing::trace!(node = %id, name = %name, "node spawned");
        self.slots[idx] = Some(NodeSlot {
            id,
            name,
            transform,
            components: Vec::new(),
        });
        id
    }

    /// Remove a node. Every component attached to it is dropped.
    ///
    /// Returns `false` if the node did not exist.
    pub fn despawn(&mut self, node: NodeId) -> bool {
        if !self.allocator.deallocate(node) {
            return false;
        }
        let dropped = self.slots[node.index() as usize]
            .take()
            .map(|slot| slot.components.len())
            .unwrap_or(0);
        tracing::trace!(node = %node, components = dropped, "node despawned");
        true
    }

    /// Returns `true` if `node` is alive.
    pub fn contains(&self, node: NodeId) -> bool {
        self.allocator.is_alive(node)
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.allocator.alive_count()
    }

    /// Node name, if the node exists.
    pub fn name(&self, node: NodeId) -> Option<&str> {
        self.slot(node).map(|s| s.name.as_str())
    }

    /// Node transform, if the node exists.
    pub fn transform(&self, node: NodeId) -> Option<&Transform> {
        self.slot(node).map(|s| &s.transform)
    }

    /// Mutable node transform, if the node exists.
    pub fn transform_mut(&mut self, node: NodeId) -> Option<&mut Transform> {
        self.slot_mut(node).map(|s| &mut s.transform)
    }

    /// Attach a component to a node.
    ///
    /// On failure the component is handed back inside [`AttachRejected`].
    pub fn attach(&mut self, node: NodeId, component: C) -> Result<(), AttachRejected<C>> {
        let Some(slot) = self.slot_mut(node) else {
            return Err(AttachRejected {
                error: SceneError::NoSuchNode(node),
                component,
            });
        };
        if slot
            .components
            .iter()
            .any(|c| c.component_name() == component.component_name())
        {
            return Err(AttachRejected {
                error: SceneError::DuplicateComponent {
                    node,
                    component: component.component_name().to_owned(),
                },
                component,
            });
        }
        slot.components.push(component);
        Ok(())
    }

    /// Detach the component named `component` from `node`, returning it.
    pub fn detach(&mut self, node: NodeId, component: &str) -> Option<C> {
        let slot = self.slot_mut(node)?;
        let pos = slot
            .components
            .iter()
            .position(|c| c.component_name() == component)?;
        Some(slot.components.remove(pos))
    }

    /// Every live node holding a component named `component`, in slot order.
    pub fn nodes_with(&self, component: &str) -> Vec<NodeId> {
        self.live_slots()
            .filter(|(_, slot)| {
                slot.components
                    .iter()
                    .any(|c| c.component_name() == component)
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// Components attached to `node`.
    pub fn components(&self, node: NodeId) -> &[C] {
        self.slot(node)
            .map(|s| s.components.as_slice())
            .unwrap_or(&[])
    }

    /// The component named `component` on `node`.
    pub fn component(&self, node: NodeId, component: &str) -> Option<&C> {
        self.components(node)
            .iter()
            .find(|c| c.component_name() == component)
    }

    /// Mutable access to the component named `component` on `node`.
    pub fn component_mut(&mut self, node: NodeId, component: &str) -> Option<&mut C> {
        self.slot_mut(node)?
            .components
            .iter_mut()
            .find(|c| c.component_name() == component)
    }

    /// Visit every attached component with mutable access to its node's
    /// transform. Nodes are visited in slot order, components in attach order.
    pub fn for_each_component_mut<F>(&mut self, mut f: F)
    where
        F: FnMut(NodeId, &mut Transform, &mut C),
    {
        for slot in self.slots.iter_mut().flatten() {
            for component in slot.components.iter_mut() {
                f(slot.id, &mut slot.transform, component);
            }
        }
    }

    /// Total number of attached components across all nodes.
    pub fn component_count(&self) -> usize {
        self.live_slots().map(|(_, s)| s.components.len()).sum()
    }

    // -- Internal helpers ---------------------------------------------------

    fn slot(&self, node: NodeId) -> Option<&NodeSlot<C>> {
        if !self.allocator.is_alive(node) {
            return None;
        }
        self.slots.get(node.index() as usize)?.as_ref()
    }

    fn slot_mut(&mut self, node: NodeId) -> Option<&mut NodeSlot<C>> {
        if !self.allocator.is_alive(node) {
            return None;
        }
        self.slots.get_mut(node.index() as usize)?.as_mut()
    }

    fn live_slots(&self) -> impl Iterator<Item = (NodeId, &NodeSlot<C>)> {
        self.slots.iter().flatten().map(|s| (s.id, s))
    }
}

impl<C: Component> Default for Scene<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Scene<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scene")
            .field("nodes", &self.allocator.alive_count())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::Vec3;

    #[derive(Debug, PartialEq)]
    struct Tagged(&'static str, u32);

    impl Component for Tagged {
        fn component_name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn attach_then_find_by_name() {
        let mut scene = Scene::new();
        let a = scene.spawn("a", Transform::default());
        let b = scene.spawn("b", Transform::default());
        let _c = scene.spawn("c", Transform::default());

        scene.attach(a, Tagged("Rotator", 1)).unwrap();
        scene.attach(b, Tagged("Rotator", 2)).unwrap();
        scene.attach(b, Tagged("Oscillator", 3)).unwrap();

        assert_eq!(scene.nodes_with("Rotator"), vec![a, b]);
        assert_eq!(scene.nodes_with("Oscillator"), vec![b]);
        assert!(scene.nodes_with("Missing").is_empty());
        assert_eq!(scene.component_count(), 3);
    }

    #[test]
    fn duplicate_component_is_rejected_and_returned() {
        let mut scene = Scene::new();
        let a = scene.spawn("a", Transform::default());
        scene.attach(a, Tagged("Rotator", 1)).unwrap();

        let rejected = scene.attach(a, Tagged("Rotator", 2)).unwrap_err();
        assert_eq!(rejected.component, Tagged("Rotator", 2));
        assert!(matches!(
            rejected.error,
            SceneError::DuplicateComponent { ref component, .. } if component == "Rotator"
        ));
    }

    #[test]
    fn detach_returns_component_and_keeps_transform() {
        let mut scene = Scene::new();
        let a = scene.spawn("a", Transform::from_position(Vec3::new(1.0, 2.0, 3.0)));
        scene.attach(a, Tagged("Rotator", 7)).unwrap();

        let detached = scene.detach(a, "Rotator").unwrap();
        assert_eq!(detached, Tagged("Rotator", 7));
        assert!(scene.components(a).is_empty());
        assert_eq!(
            scene.transform(a).unwrap().position,
            Vec3::new(1.0, 2.0, 3.0)
        );
        assert!(scene.detach(a, "Rotator").is_none());
    }

    #[test]
    fn despawn_drops_components_and_invalidates_handle() {
        let mut scene = Scene::new();
        let a = scene.spawn("a", Transform::default());
        scene.attach(a, Tagged("Rotator", 1)).unwrap();

        assert!(scene.despawn(a));
        assert!(!scene.contains(a));
        assert!(scene.nodes_with("Rotator").is_empty());
        assert!(scene.transform(a).is_none());

        let reused = scene.spawn("b", Transform::default());
        assert_eq!(reused.index(), a.index());
        let rejected = scene.attach(a, Tagged("Rotator", 2)).unwrap_err();
        assert_eq!(rejected.error, SceneError::NoSuchNode(a));
        assert!(scene.components(reused).is_empty());
    }

    #[test]
    fn for_each_component_mut_sees_node_transform() {
        let mut scene = Scene::new();
        let a = scene.spawn("a", Transform::default());
        scene.attach(a, Tagged("Rotator", 0)).unwrap();

        scene.for_each_component_mut(|node, transform, component| {
            assert_eq!(node, a);
            component.1 += 1;
            transform.translate(Vec3::new(0.0, 1.0, 0.0));
        });

        assert_eq!(scene.component(a, "Rotator").unwrap().1, 1);
        assert_eq!(scene.transform(a).unwrap().position.y, 1.0);
    }
}
