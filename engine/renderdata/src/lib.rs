//! The GPU-facing data model for clustered lighting: packed per-light /
//! per-decal / per-probe records and the per-view cluster grid

mod cluster;
mod packing;
mod records;

pub use cluster::{
    decal_index, light_index, probe_index, ClusterGridBuilder, ClusterItemBounds,
    ClusteredViewData, DECAL_BITMASK, DECAL_SHIFT, LIGHT_BITMASK, NUM_CLUSTERS, NUM_CLUSTERS_X,
    NUM_CLUSTERS_XY, NUM_CLUSTERS_Y, NUM_CLUSTERS_Z, PROBE_BITMASK, PROBE_SHIFT,
};
pub use packing::{
    f16_bits_to_f32, f32_to_f16_bits, pack_color_and_type, pack_direction, pack_rgba8,
    pack_two_f16, unpack_direction, unpack_two_f16,
};
pub use records::{
    ClusteredDataConstants, DirShadowData, PerClusterData, PerDecalData, PerLightData,
    PerReflectionProbeData, PointShadowData, SpotShadowData, DECAL_BLEND_MODE_COLORIZE,
    DECAL_MAP_NORMAL_TO_GEOMETRY, DECAL_USE_EMISSIVE, DECAL_USE_NORMAL, DECAL_USE_ORM,
    DECAL_WRAP_AROUND, LIGHT_TYPE_DIR, LIGHT_TYPE_POINT, LIGHT_TYPE_SPOT,
    REFLECTION_PROBE_INDEX_BITMASK, REFLECTION_PROBE_IS_PROJECTED, REFLECTION_PROBE_IS_SPHERE,
};
