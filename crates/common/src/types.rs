use std::fmt;

use glam::{Affine3A, Quat, Vec3};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::hash::{self, Fnv64};

/// Identity of a placed object, unique within the container that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Stable id derived from a namespace and a local key. The same inputs
    /// always produce the same id, so derived objects keep their identity
    /// across builds.
    pub fn derive(namespace: &[u8], local: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((namespace.len() as u64).to_le_bytes());
        hasher.update(namespace);
        hasher.update(local);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// First eight hex digits, for log lines.
    pub fn short(&self) -> String {
        let s = self.0.simple().to_string();
        s[..8].to_string()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one container instance in the expanded world. The main
/// container is always [`ContainerId::MAIN`]; every nested instance derives
/// its id from its parent and the object that places it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub u64);

impl ContainerId {
    pub const MAIN: ContainerId = ContainerId(0);

    pub fn child(self, instancing_object: ObjectId) -> Self {
        let mut h = Fnv64::new();
        h.write_u64(self.0);
        h.write(instancing_object.as_bytes());
        let id = hash::splitmix64(h.finish());
        // 0 is reserved for the main container
        Self(if id == 0 { 1 } else { id })
    }

    pub fn named(name: &str) -> Self {
        let id = hash::splitmix64(hash::fnv1a64(name.as_bytes()));
        Self(if id == 0 { 1 } else { id })
    }

    pub fn is_main(&self) -> bool {
        *self == Self::MAIN
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Opaque handle to a renderable surface owned by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SurfaceHandle(pub u64);

/// Spatial transform: position, rotation, scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Transform {
    pub const IDENTITY: Transform = Transform {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.position + self.rotation * (self.scale * p)
    }

    /// `self` applied after `child`: maps child-local space into the space
    /// `self` maps into.
    pub fn compose(&self, child: &Transform) -> Transform {
        Transform {
            position: self.transform_point(child.position),
            rotation: self.rotation * child.rotation,
            scale: self.scale * child.scale,
        }
    }

    pub fn to_affine(&self) -> Affine3A {
        Affine3A::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    pub fn hash_into(&self, h: &mut Fnv64) {
        for v in self.position.to_array() {
            h.write_f32(v);
        }
        for v in self.rotation.to_array() {
            h.write_f32(v);
        }
        for v in self.scale.to_array() {
            h.write_f32(v);
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_id_uniqueness() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn derived_ids_are_stable() {
        let a = ObjectId::derive(b"aggregate", b"cell-1");
        let b = ObjectId::derive(b"aggregate", b"cell-1");
        let c = ObjectId::derive(b"aggregate", b"cell-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, ObjectId::derive(b"aggregat", b"ecell-1"));
    }

    #[test]
    fn object_id_serializes_as_plain_uuid() {
        let id = ObjectId::from_u128(7);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000007\"");
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn child_container_ids_depend_on_parent_and_object() {
        let obj = ObjectId::from_u128(1);
        let a = ContainerId::MAIN.child(obj);
        let b = ContainerId::MAIN.child(ObjectId::from_u128(2));
        assert_ne!(a, b);
        assert_ne!(a, a.child(obj));
        assert!(!a.is_main());
        assert_eq!(a, ContainerId::MAIN.child(obj));
    }

    #[test]
    fn transform_default_is_identity() {
        let t = Transform::default();
        assert_eq!(t.position, Vec3::ZERO);
        assert_eq!(t.rotation, Quat::IDENTITY);
        assert_eq!(t.scale, Vec3::ONE);
        assert!(t.is_identity());
    }

    #[test]
    fn compose_applies_child_first() {
        let parent = Transform::from_position(Vec3::new(100.0, 0.0, 0.0));
        let child = Transform {
            position: Vec3::new(1.0, 2.0, 0.0),
            rotation: Quat::IDENTITY,
            scale: Vec3::splat(2.0),
        };
        let world = parent.compose(&child);
        let p = world.transform_point(Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(p, parent.transform_point(child.transform_point(Vec3::new(1.0, 0.0, 0.0))));
        assert_eq!(p, Vec3::new(103.0, 2.0, 0.0));
        assert_eq!(world.to_affine().transform_point3(Vec3::new(1.0, 0.0, 0.0)), p);
    }
}
