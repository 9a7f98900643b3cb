pub use arrayvec::*;
pub use cgmath;
pub use cgmath::{
    Angle, EuclideanSpace, InnerSpace, Matrix, MetricSpace, Rotation, Rotation3, SquareMatrix,
    VectorSpace, Zero,
};
pub use float_cmp::ApproxEq;
pub use itertools::*;
pub use num_traits;
pub use ordered_float::OrderedFloat;
pub use parking_lot;
pub use rand::prelude::*;
pub use smallvec::*;
pub use thiserror::{self, Error};

pub use lazy_static::lazy_static;
pub use logging::{
    self, prelude::*, slog_kv_debug, slog_kv_display, slog_value_debug, slog_value_display,
};

// common imports that annoyingly get resolved to other pub exports of std/core
// https://github.com/intellij-rust/intellij-rust/issues/5654
pub use std::{
    error::Error,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    hash::Hash,
    iter::{empty, once},
    marker::PhantomData,
};

pub type BoxedResult<T> = Result<T, Box<dyn Error>>;

pub type F = f32;
pub type Vector3 = cgmath::Vector3<F>;
pub type Vector2 = cgmath::Vector2<F>;
pub type Point3 = cgmath::Point3<F>;
pub type Point2 = cgmath::Point2<F>;
pub type Matrix4 = cgmath::Matrix4<F>;
pub type Quaternion = cgmath::Quaternion<F>;
pub type Rad = cgmath::Rad<F>;
pub type Deg = cgmath::Deg<F>;

#[inline]
pub fn rad(f: F) -> Rad {
    cgmath::Rad(f)
}

#[inline]
pub fn deg(f: F) -> Deg {
    cgmath::Deg(f)
}

pub mod math;

pub use math::{Aabb, BasisAxis, BoundingVolume, Frustum, Plane, Sphere, Transform};

pub fn seeded_rng(seed: Option<u64>) -> SmallRng {
    match seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_entropy(),
    }
}
