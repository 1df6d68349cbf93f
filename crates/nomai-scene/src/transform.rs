//! Node transforms.

use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// A plain three-component vector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    /// The zero vector.
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Component-wise comparison within `epsilon`.
    pub fn approx_eq(self, other: Vec3, epsilon: f32) -> bool {
        (self.x - other.x).abs() <= epsilon
            && (self.y - other.y).abs() <= epsilon
            && (self.z - other.z).abs() <= epsilon
    }
}

impl Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, rhs: Vec3) {
        *self = *self + rhs;
    }
}

/// Position and Euler rotation (degrees) of a scene node.
///
/// The transform belongs to the node, not to any component attached to it,
/// so it survives components being swapped out underneath.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Vec3,
}

impl Transform {
    /// A transform at `position` with no rotation.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Vec3::ZERO,
        }
    }

    /// Move by `delta`.
    pub fn translate(&mut self, delta: Vec3) {
        self.position += delta;
    }

    /// Rotate by `delta` degrees, wrapping each axis into `[0, 360)`.
    pub fn rotate(&mut self, delta: Vec3) {
        let r = self.rotation + delta;
        self.rotation = Vec3::new(
            r.x.rem_euclid(360.0),
            r.y.rem_euclid(360.0),
            r.z.rem_euclid(360.0),
        );
    }
}
