//! GPU-facing record layouts. Sizes are part of the shader contract and are
//! checked at compile time

use bytemuck::{Pod, Zeroable};

pub const LIGHT_TYPE_POINT: u8 = 0;
pub const LIGHT_TYPE_SPOT: u8 = 1;
pub const LIGHT_TYPE_DIR: u8 = 2;

/// 48 bytes per light
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct PerLightData {
    /// rgb8 color in the low bits, light type in the high byte
    pub color_and_type: u32,
    pub intensity: f32,
    /// 10 bit fixed point per axis
    pub direction: u32,
    pub shadow_data_offset: u32,

    pub position: [f32; 3],
    pub inv_sqr_att_radius: f32,

    /// cone scale and offset as two half floats
    pub spot_params: u32,
    /// xy as half floats
    pub projector_atlas_offset: u32,
    /// xy as half floats
    pub projector_atlas_scale: u32,

    pub reserved: u32,
}

const _: () = assert!(std::mem::size_of::<PerLightData>() == 48);

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct PointShadowData {
    /// x = slope bias, y = constant bias, z = penumbra size in texels, w = fadeout
    pub shadow_params: [f32; 4],
    pub world_to_light_matrices: [[f32; 16]; 6],
}

impl Default for PointShadowData {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct SpotShadowData {
    pub shadow_params: [f32; 4],
    pub world_to_light_matrix: [f32; 16],
}

/// Up to four cascades; the first has identity scale/offset and is omitted
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct DirShadowData {
    /// x = slope bias, y = constant bias, z = penumbra size, w = cascade count
    pub shadow_params: [f32; 4],
    pub world_to_light_matrix: [f32; 16],
    /// x = cascade border threshold, y/z = dither multipliers, w = penumbra increment
    pub shadow_params2: [f32; 4],
    /// xy fadeout scale/offset, z fadeout scale/offset
    pub fade_out_params: [f32; 4],
    /// interleaved scale and offset per remaining cascade
    pub cascade_scale_offset: [[f32; 4]; 6],
    pub atlas_scale_offset: [[f32; 4]; 4],
}

impl Default for DirShadowData {
    fn default() -> Self {
        Zeroable::zeroed()
    }
}

pub const DECAL_USE_NORMAL: u32 = 1 << 0;
pub const DECAL_USE_ORM: u32 = 1 << 1;
pub const DECAL_USE_EMISSIVE: u32 = 1 << 2;
pub const DECAL_BLEND_MODE_COLORIZE: u32 = 1 << 7;
pub const DECAL_WRAP_AROUND: u32 = 1 << 8;
pub const DECAL_MAP_NORMAL_TO_GEOMETRY: u32 = 1 << 9;

/// 96 bytes per decal
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct PerDecalData {
    /// world to decal space, 4x3 row major
    pub world_to_decal_matrix: [f32; 12],

    pub apply_only_to_id: u32,
    pub decal_flags: u32,
    /// scale and offset as half floats
    pub angle_fade_params: u32,
    /// rgba8
    pub base_color: u32,

    pub emissive_color_rg: u32,
    pub emissive_color_ba: u32,

    pub base_color_atlas_scale: u32,
    pub base_color_atlas_offset: u32,

    pub normal_atlas_scale: u32,
    pub normal_atlas_offset: u32,

    pub orm_atlas_scale: u32,
    pub orm_atlas_offset: u32,
}

const _: () = assert!(std::mem::size_of::<PerDecalData>() == 96);

pub const REFLECTION_PROBE_IS_SPHERE: u32 = 1 << 31;
pub const REFLECTION_PROBE_IS_PROJECTED: u32 = 1 << 30;
pub const REFLECTION_PROBE_INDEX_BITMASK: u32 = 0x3fff_ffff;

/// 160 bytes per reflection probe
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct PerReflectionProbeData {
    /// world to probe projection, 4x3 row major
    pub world_to_probe_projection_matrix: [f32; 12],
    pub scale: [f32; 4],
    pub probe_position: [f32; 4],
    pub positive_falloff: [f32; 4],
    pub negative_falloff: [f32; 4],
    pub influence_scale: [f32; 4],
    pub influence_shift: [f32; 4],
    /// atlas index plus the shape/projection flag bits
    pub index: u32,
    pub padding: [u32; 3],
}

const _: () = assert!(std::mem::size_of::<PerReflectionProbeData>() == 160);

/// Constants the clustered shading passes consume
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct ClusteredDataConstants {
    pub depth_slice_scale: f32,
    pub depth_slice_bias: f32,
    pub inv_tile_size: [f32; 2],

    pub num_lights: u32,
    pub num_decals: u32,
    pub padding: u32,
    pub sky_irradiance_index: u32,

    pub fog_height: f32,
    pub fog_height_falloff: f32,
    pub fog_density_at_camera_pos: f32,
    pub fog_density: f32,
    pub fog_color: [f32; 4],
    pub fog_inv_sky_distance: f32,
    pub padding2: [f32; 3],
}

/// One entry per cluster: offset into the item buffer plus 10|10|10 packed
/// counts
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
pub struct PerClusterData {
    pub offset: u32,
    pub counts: u32,
}

const _: () = assert!(std::mem::size_of::<PerClusterData>() == 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_cast_to_byte_slices() {
        let lights = [PerLightData::default(); 3];
        let bytes: &[u8] = bytemuck::cast_slice(&lights);
        assert_eq!(bytes.len(), 3 * 48);

        let probes = [PerReflectionProbeData::default(); 2];
        assert_eq!(bytemuck::cast_slice::<_, u8>(&probes).len(), 320);
    }

    #[test]
    fn probe_index_masking() {
        let index = 5 | REFLECTION_PROBE_IS_SPHERE;
        assert_eq!(index & REFLECTION_PROBE_INDEX_BITMASK, 5);
    }
}
