mod basis;
mod bounds;
mod frustum;
mod transform;

pub use basis::BasisAxis;
pub use bounds::{Aabb, BoundingVolume, Sphere};
pub use frustum::{Frustum, Plane};
pub use transform::Transform;
