use cgmath::{InnerSpace, One, Rotation, Zero};

use crate::{Matrix4, Quaternion, Vector3, F};

/// Position, rotation and non-uniform scale
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Transform {
    pub position: Vector3,
    pub rotation: Quaternion,
    pub scale: Vector3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            position: Vector3::zero(),
            rotation: Quaternion::one(),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }

    pub fn from_position(position: Vector3) -> Self {
        Self {
            position,
            ..Self::identity()
        }
    }

    /// `self` is the parent, `local` the child. Scale composes component-wise,
    /// which matches shear-free hierarchies only
    pub fn compose(&self, local: &Transform) -> Transform {
        let scaled = Vector3::new(
            local.position.x * self.scale.x,
            local.position.y * self.scale.y,
            local.position.z * self.scale.z,
        );

        Transform {
            position: self.position + self.rotation.rotate_vector(scaled),
            rotation: self.rotation * local.rotation,
            scale: Vector3::new(
                self.scale.x * local.scale.x,
                self.scale.y * local.scale.y,
                self.scale.z * local.scale.z,
            ),
        }
    }

    /// Point transformed into this transform's space
    pub fn transform_point(&self, point: Vector3) -> Vector3 {
        let scaled = Vector3::new(
            point.x * self.scale.x,
            point.y * self.scale.y,
            point.z * self.scale.z,
        );
        self.position + self.rotation.rotate_vector(scaled)
    }

    pub fn max_scale(&self) -> F {
        self.scale.x.max(self.scale.y).max(self.scale.z)
    }

    pub fn to_matrix(&self) -> Matrix4 {
        let rot: Matrix4 = self.rotation.normalize().into();
        Matrix4::from_translation(self.position)
            * rot
            * Matrix4::from_nonuniform_scale(self.scale.x, self.scale.y, self.scale.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deg, Rotation3};

    #[test]
    fn compose_matches_scaled_rotated_offset() {
        let parent = Transform {
            position: Vector3::new(100.0, 0.0, 0.0),
            rotation: Quaternion::from_angle_z(deg(90.0)),
            scale: Vector3::new(1.5, 1.5, 1.5),
        };
        let child = Transform::from_position(Vector3::new(100.0, 0.0, 0.0));

        let global = parent.compose(&child);
        assert!((global.position.x - 100.0).abs() < 1e-4);
        assert!((global.position.y - 150.0).abs() < 1e-4);
        assert!(global.position.z.abs() < 1e-4);
    }

    #[test]
    fn identity_is_neutral() {
        let t = Transform {
            position: Vector3::new(1.0, 2.0, 3.0),
            rotation: Quaternion::from_angle_x(deg(45.0)),
            scale: Vector3::new(2.0, 2.0, 2.0),
        };

        let composed = t.compose(&Transform::identity());
        assert!((composed.position - t.position).magnitude() < 1e-6);
    }
}
