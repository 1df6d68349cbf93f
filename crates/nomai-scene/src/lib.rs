//! Nomai Scene -- a minimal scene graph that hot-reloadable components attach to.
//!
//! The scene owns nodes, their transforms, and the component instances
//! attached to them. It knows nothing about how components are compiled or
//! swapped: the hot-reload crate drives it through attach/detach calls.
//!
//! # Quick Start
//!
//! ```
//! use nomai_scene::prelude::*;
//!
//! #[derive(Debug)]
//! struct Spinner;
//!
//! impl Component for Spinner {
//!     fn component_name(&self) -> &str {
//!         "Spinner"
//!     }
//! }
//!
//! let mut scene: Scene<Spinner> = Scene::new();
//! let node = scene.spawn("cube", Transform::default());
//! scene.attach(node, Spinner).unwrap();
//!
//! assert_eq!(scene.nodes_with("Spinner"), vec![node]);
//! assert!(scene.detach(node, "Spinner").is_some());
//! ```

#![deny(unsafe_code)]

pub mod node;
pub mod scene;
pub mod transform;

pub use node::{NodeAllocator, NodeId};
pub use scene::{AttachRejected, Component, Scene, SceneError};
pub use transform::{Transform, Vec3};

/// Convenience re-exports for common scene usage.
pub mod prelude {
    pub use crate::node::NodeId;
    pub use crate::scene::{AttachRejected, Component, Scene, SceneError};
    pub use crate::transform::{Transform, Vec3};
}
