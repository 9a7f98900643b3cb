use cgmath::InnerSpace;

use crate::math::{Aabb, Sphere};
use crate::{Matrix4, Vector3, F};

/// Plane in `normal . p + d = 0` form, normal pointing inside for frustum use
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Plane {
    pub normal: Vector3,
    pub d: F,
}

impl Plane {
    pub fn new(normal: Vector3, d: F) -> Self {
        Self { normal, d }
    }

    pub fn normalized(&self) -> Plane {
        let len = self.normal.magnitude();
        Plane {
            normal: self.normal / len,
            d: self.d / len,
        }
    }

    pub fn signed_distance(&self, point: Vector3) -> F {
        self.normal.dot(point) + self.d
    }
}

/// Six-plane view frustum with inward-facing normals
#[derive(Copy, Clone, Debug)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extracts clip planes from a view-projection matrix (Gribb/Hartmann),
    /// column-major as cgmath stores it
    pub fn from_view_projection(m: &Matrix4) -> Self {
        let row = |i: usize| Vector3::new(m.x[i], m.y[i], m.z[i]);
        let row_w = |i: usize| m.w[i];

        let planes = [
            // left, right
            Plane::new(row(3) + row(0), row_w(3) + row_w(0)).normalized(),
            Plane::new(row(3) - row(0), row_w(3) - row_w(0)).normalized(),
            // bottom, top
            Plane::new(row(3) + row(1), row_w(3) + row_w(1)).normalized(),
            Plane::new(row(3) - row(1), row_w(3) - row_w(1)).normalized(),
            // near, far
            Plane::new(row(3) + row(2), row_w(3) + row_w(2)).normalized(),
            Plane::new(row(3) - row(2), row_w(3) - row_w(2)).normalized(),
        ];

        Self { planes }
    }

    pub fn intersects_sphere(&self, sphere: &Sphere) -> bool {
        self.planes
            .iter()
            .all(|p| p.signed_distance(sphere.center) >= -sphere.radius)
    }

    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        // positive-vertex test
        self.planes.iter().all(|p| {
            let v = Vector3::new(
                if p.normal.x >= 0.0 { aabb.max.x } else { aabb.min.x },
                if p.normal.y >= 0.0 { aabb.max.y } else { aabb.min.y },
                if p.normal.z >= 0.0 { aabb.max.z } else { aabb.min.z },
            );
            p.signed_distance(v) >= 0.0
        })
    }

    pub fn contains_point(&self, point: Vector3) -> bool {
        self.planes.iter().all(|p| p.signed_distance(point) >= 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deg, cgmath::PerspectiveFov, Rad};

    fn test_frustum() -> Frustum {
        let proj: Matrix4 = PerspectiveFov {
            fovy: Rad::from(deg(90.0)),
            aspect: 1.0,
            near: 0.1,
            far: 100.0,
        }
        .into();
        // camera at origin looking down -z
        Frustum::from_view_projection(&proj)
    }

    #[test]
    fn sphere_in_front_is_inside() {
        let frustum = test_frustum();
        assert!(frustum.intersects_sphere(&Sphere::new(Vector3::new(0.0, 0.0, -10.0), 1.0)));
        assert!(!frustum.intersects_sphere(&Sphere::new(Vector3::new(0.0, 0.0, 10.0), 1.0)));
        assert!(!frustum.intersects_sphere(&Sphere::new(Vector3::new(0.0, 0.0, -200.0), 1.0)));
    }

    #[test]
    fn aabb_straddling_plane_is_inside() {
        let frustum = test_frustum();
        let aabb = Aabb::from_center_and_half_extents(
            Vector3::new(12.0, 0.0, -10.0),
            Vector3::new(5.0, 5.0, 5.0),
        );
        assert!(frustum.intersects_aabb(&aabb));

        let outside = Aabb::from_center_and_half_extents(
            Vector3::new(300.0, 0.0, -10.0),
            Vector3::new(5.0, 5.0, 5.0),
        );
        assert!(!frustum.intersects_aabb(&outside));
    }
}
