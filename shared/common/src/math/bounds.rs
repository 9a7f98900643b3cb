use cgmath::InnerSpace;

use crate::math::Transform;
use crate::{Vector3, F};

/// Bounding sphere
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sphere {
    pub center: Vector3,
    pub radius: F,
}

/// Axis aligned bounding box
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vector3,
    pub max: Vector3,
}

/// Box and sphere pair kept in sync, the shape spatial records use
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundingVolume {
    pub sphere: Sphere,
    pub aabb: Aabb,
}

impl Sphere {
    pub fn new(center: Vector3, radius: F) -> Self {
        Self { center, radius }
    }

    pub fn overlaps_sphere(&self, other: &Sphere) -> bool {
        let r = self.radius + other.radius;
        (other.center - self.center).magnitude2() <= r * r
    }

    pub fn overlaps_aabb(&self, aabb: &Aabb) -> bool {
        let closest = Vector3::new(
            self.center.x.clamp(aabb.min.x, aabb.max.x),
            self.center.y.clamp(aabb.min.y, aabb.max.y),
            self.center.z.clamp(aabb.min.z, aabb.max.z),
        );
        (closest - self.center).magnitude2() <= self.radius * self.radius
    }
}

impl Aabb {
    pub fn new(min: Vector3, max: Vector3) -> Self {
        debug_assert!(min.x <= max.x && min.y <= max.y && min.z <= max.z);
        Self { min, max }
    }

    pub fn from_center_and_half_extents(center: Vector3, half: Vector3) -> Self {
        Self {
            min: center - half,
            max: center + half,
        }
    }

    pub fn center(&self) -> Vector3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vector3 {
        (self.max - self.min) * 0.5
    }

    pub fn overlaps_aabb(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn merged(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: Vector3::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            max: Vector3::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        }
    }
}

impl BoundingVolume {
    pub fn from_aabb(aabb: Aabb) -> Self {
        let center = aabb.center();
        let radius = aabb.half_extents().magnitude();
        Self {
            sphere: Sphere::new(center, radius),
            aabb,
        }
    }

    /// Local volume carried into world space. The world box is the aabb of the
    /// rotated local box, so it can be looser than the original
    pub fn transformed(&self, transform: &Transform) -> Self {
        let half = self.aabb.half_extents();
        let center = self.aabb.center();

        let corners = [
            Vector3::new(-half.x, -half.y, -half.z),
            Vector3::new(half.x, -half.y, -half.z),
            Vector3::new(-half.x, half.y, -half.z),
            Vector3::new(half.x, half.y, -half.z),
            Vector3::new(-half.x, -half.y, half.z),
            Vector3::new(half.x, -half.y, half.z),
            Vector3::new(-half.x, half.y, half.z),
            Vector3::new(half.x, half.y, half.z),
        ];

        let mut min = Vector3::new(F::MAX, F::MAX, F::MAX);
        let mut max = Vector3::new(F::MIN, F::MIN, F::MIN);
        for corner in corners {
            let p = transform.transform_point(center + corner);
            min = Vector3::new(min.x.min(p.x), min.y.min(p.y), min.z.min(p.z));
            max = Vector3::new(max.x.max(p.x), max.y.max(p.y), max.z.max(p.z));
        }

        let aabb = Aabb { min, max };
        Self {
            sphere: Sphere::new(
                transform.transform_point(self.sphere.center),
                self.sphere.radius * transform.max_scale(),
            ),
            aabb,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sphere_aabb_overlap() {
        let aabb = Aabb::new(Vector3::new(-1.0, -1.0, -1.0), Vector3::new(1.0, 1.0, 1.0));

        assert!(Sphere::new(Vector3::new(0.0, 0.0, 0.0), 0.5).overlaps_aabb(&aabb));
        assert!(Sphere::new(Vector3::new(2.0, 0.0, 0.0), 1.1).overlaps_aabb(&aabb));
        assert!(!Sphere::new(Vector3::new(3.0, 0.0, 0.0), 1.0).overlaps_aabb(&aabb));
    }

    #[test]
    fn volume_from_aabb_encloses_box() {
        let aabb = Aabb::new(Vector3::new(0.0, 0.0, 0.0), Vector3::new(2.0, 2.0, 2.0));
        let vol = BoundingVolume::from_aabb(aabb);

        assert!((vol.sphere.center - Vector3::new(1.0, 1.0, 1.0)).magnitude() < 1e-6);
        assert!(vol.sphere.radius >= aabb.half_extents().magnitude() - 1e-6);
    }
}
