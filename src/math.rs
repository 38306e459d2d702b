//! Math types for Sonal

pub use glam::Vec3;

/// Listener orientation expressed as a forward ("at") and an up vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub forward: Vec3,
    pub up: Vec3,
}

impl Orientation {
    pub fn new(forward: Vec3, up: Vec3) -> Self {
        Self { forward, up }
    }

    /// Facing down -Z with +Y up.
    pub fn identity() -> Self {
        Self {
            forward: Vec3::NEG_Z,
            up: Vec3::Y,
        }
    }
}

impl Default for Orientation {
    fn default() -> Self {
        Self::identity()
    }
}

/// Right-handed listener basis used to move vectors from listener space into world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Basis {
    pub right: Vec3,
    pub up: Vec3,
    pub back: Vec3,
}

impl Basis {
    /// Builds the basis from a listener orientation.
    ///
    /// Back is the negated forward vector, both normalized; Right is `Up x Back`.
    /// Degenerate (zero-length) inputs fall back to the identity axes.
    pub fn from_orientation(orientation: &Orientation) -> Self {
        let back = (-orientation.forward).try_normalize().unwrap_or(Vec3::Z);
        let up = orientation.up.try_normalize().unwrap_or(Vec3::Y);
        let right = up.cross(back);
        Self { right, up, back }
    }

    /// Applies the change of basis (rotation only).
    pub fn rotate(&self, v: Vec3) -> Vec3 {
        v.x * self.right + v.y * self.up + v.z * self.back
    }
}

/// Reads a 3-vector from a slice, rejecting any other dimensionality.
pub fn vec3_from_slice(values: &[f32]) -> Option<Vec3> {
    match values {
        [x, y, z] => Some(Vec3::new(*x, *y, *z)),
        _ => None,
    }
}
