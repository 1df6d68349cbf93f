//! The seam between hot reload and the scene graph.
//!
//! The orchestrator never touches a concrete scene type. It enumerates,
//! detaches, and attaches component instances through [`SceneAttachments`],
//! which [`Scene<ComponentInstance>`] implements.

use std::fmt;

use nomai_scene::{NodeId, Scene, Transform};

use crate::instance::ComponentInstance;
use crate::HotReloadError;

/// Attachment points for live component instances.
pub trait SceneAttachments {
    /// Handle for an attachment point.
    type Node: Copy + fmt::Display;

    /// Every node currently holding a component named `name`.
    fn attached_nodes(&self, name: &str) -> Vec<Self::Node>;

    /// Detach and return the `name` instance on `node`.
    fn detach_component(&mut self, node: Self::Node, name: &str) -> Option<ComponentInstance>;

    /// Attach `instance` to `node`. A refused instance is handed back.
    fn attach_component(
        &mut self,
        node: Self::Node,
        instance: ComponentInstance,
    ) -> Result<(), (HotReloadError, ComponentInstance)>;

    /// The transform component hooks read and write.
    fn node_transform_mut(&mut self, node: Self::Node) -> Option<&mut Transform>;
}

impl SceneAttachments for Scene<ComponentInstance> {
    type Node = NodeId;

    fn attached_nodes(&self, name: &str) -> Vec<NodeId> {
        self.nodes_with(name)
    }

    fn detach_component(&mut self, node: NodeId, name: &str) -> Option<ComponentInstance> {
        self.detach(node, name)
    }

    fn attach_component(
        &mut self,
        node: NodeId,
        instance: ComponentInstance,
    ) -> Result<(), (HotReloadError, ComponentInstance)> {
        self.attach(node, instance).map_err(|rejected| {
            let name = rejected.component.name().to_owned();
            (
                HotReloadError::Attachment {
                    node: node.to_string(),
                    name,
                    reason: rejected.error.to_string(),
                },
                rejected.component,
            )
        })
    }

    fn node_transform_mut(&mut self, node: NodeId) -> Option<&mut Transform> {
        self.transform_mut(node)
    }
}

/// Run `on_attach` against the node's transform, then attach.
///
/// A node that no longer exists rejects the instance without running the
/// hook. On any error the instance is dropped.
pub fn attach_instance<S: SceneAttachments>(
    scene: &mut S,
    node: S::Node,
    mut instance: ComponentInstance,
) -> Result<(), HotReloadError> {
    let Some(transform) = scene.node_transform_mut(node) else {
        return Err(HotReloadError::Attachment {
            node: node.to_string(),
            name: instance.name().to_owned(),
            reason: "node does not exist".to_owned(),
        });
    };
    instance.on_attach(transform)?;
    scene.attach_component(node, instance).map_err(|(e, _)| e)
}

/// Detach `name` from `node` and run its `on_detach` hook.
///
/// Returns the detached instance, or `None` if nothing was attached. A
/// failing hook is logged; the instance is still detached.
pub fn detach_instance<S: SceneAttachments>(
    scene: &mut S,
    node: S::Node,
    name: &str,
) -> Option<ComponentInstance> {
    let mut instance = scene.detach_component(node, name)?;
    if let Some(transform) = scene.node_transform_mut(node) {
        if let Err(e) = instance.on_detach(transform) {
            tracing::warn!(component = %name, node = %node, error = %e, "on_detach failed");
        }
    }
    Some(instance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::config::HotReloadConfig;
    use crate::loader::Loader;
    use crate::source::SourceUnit;
    use nomai_scene::Vec3;

    const MARKER: &str = r#"(module
  (import "host" "translate" (func $translate (param f32 f32 f32)))
  (func (export "Marker.on_attach") (call $translate (f32.const 0) (f32.const 1) (f32.const 0)))
  (func (export "Marker.on_detach") (call $translate (f32.const 0) (f32.const -5) (f32.const 0))))"#;

    fn marker(loader: &mut Loader, compiler: &Compiler) -> ComponentInstance {
        let compiled = compiler.compile(SourceUnit::from_text("Marker", MARKER)).unwrap();
        let context = loader.load(compiled).unwrap();
        context.component_type().instantiate().unwrap()
    }

    fn setup() -> (Compiler, Loader) {
        let config = HotReloadConfig::default();
        let compiler = Compiler::new(&config).unwrap();
        let loader = Loader::new(compiler.engine(), &config).unwrap();
        (compiler, loader)
    }

    #[test]
    fn attach_runs_hook_against_node_transform() {
        let (compiler, mut loader) = setup();
        let mut scene = Scene::new();
        let node = scene.spawn("a", Transform::default());

        attach_instance(&mut scene, node, marker(&mut loader, &compiler)).unwrap();
        assert_eq!(scene.attached_nodes("Marker"), vec![node]);
        assert_eq!(scene.transform(node).unwrap().position, Vec3::new(0.0, 1.0, 0.0));

        let detached = detach_instance(&mut scene, node, "Marker").unwrap();
        assert_eq!(detached.name(), "Marker");
        assert_eq!(scene.transform(node).unwrap().position, Vec3::new(0.0, -4.0, 0.0));
        assert!(scene.attached_nodes("Marker").is_empty());
    }

    #[test]
    fn duplicate_attach_is_an_attachment_error() {
        let (compiler, mut loader) = setup();
        let mut scene = Scene::new();
        let node = scene.spawn("a", Transform::default());
        scene.attach_component(node, marker(&mut loader, &compiler)).unwrap();

        let (err, returned) = scene
            .attach_component(node, marker(&mut loader, &compiler))
            .unwrap_err();
        assert!(matches!(err, HotReloadError::Attachment { .. }));
        assert_eq!(returned.name(), "Marker");
    }

    #[test]
    fn attach_to_despawned_node_fails() {
        let (compiler, mut loader) = setup();
        let mut scene = Scene::new();
        let node = scene.spawn("gone", Transform::default());
        scene.despawn(node);

        let err = attach_instance(&mut scene, node, marker(&mut loader, &compiler)).unwrap_err();
        assert!(matches!(err, HotReloadError::Attachment { .. }));
    }
}
