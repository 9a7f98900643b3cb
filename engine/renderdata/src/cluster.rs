//! Per-view cluster assignment: lights, decals and probes binned into a
//! fixed 16x8x24 grid over the view frustum with exponential depth slices

use common::*;

use crate::records::{ClusteredDataConstants, PerClusterData};

pub const NUM_CLUSTERS_X: u32 = 16;
pub const NUM_CLUSTERS_Y: u32 = 8;
pub const NUM_CLUSTERS_Z: u32 = 24;
pub const NUM_CLUSTERS_XY: u32 = NUM_CLUSTERS_X * NUM_CLUSTERS_Y;
pub const NUM_CLUSTERS: u32 = NUM_CLUSTERS_XY * NUM_CLUSTERS_Z;

pub const LIGHT_BITMASK: u32 = 0x3ff;
pub const DECAL_SHIFT: u32 = 10;
pub const DECAL_BITMASK: u32 = 0x3ff;
pub const PROBE_SHIFT: u32 = 20;
pub const PROBE_BITMASK: u32 = 0x3ff;

pub fn light_index(item: u32) -> u32 {
    item & LIGHT_BITMASK
}

pub fn decal_index(item: u32) -> u32 {
    (item >> DECAL_SHIFT) & DECAL_BITMASK
}

pub fn probe_index(item: u32) -> u32 {
    (item >> PROBE_SHIFT) & PROBE_BITMASK
}

/// A sphere in view space (+z into the screen) to be binned
#[derive(Copy, Clone, Debug)]
pub struct ClusterItemBounds {
    pub view_position: Vector3,
    pub radius: F,
}

/// The finished per-view cluster data a renderer uploads
pub struct ClusteredViewData {
    pub clusters: Vec<PerClusterData>,
    pub items: Vec<u32>,
    pub constants: ClusteredDataConstants,
}

/// Bins items for one view
pub struct ClusterGridBuilder {
    near: F,
    far: F,
    tan_half_fovy: F,
    aspect: F,
    depth_slice_scale: F,
    depth_slice_bias: F,
    viewport: (F, F),
}

impl ClusterGridBuilder {
    pub fn new(near: F, far: F, fovy: Rad, aspect: F, viewport: (F, F)) -> Self {
        debug_assert!(near > 0.0 && far > near);

        // slice = floor(log2(z) * scale + bias), slice 0 at the near plane
        let depth_slice_scale = NUM_CLUSTERS_Z as F / (far / near).log2();
        let depth_slice_bias = -(near.log2() * depth_slice_scale);

        Self {
            near,
            far,
            tan_half_fovy: (fovy.0 * 0.5).tan(),
            aspect,
            depth_slice_scale,
            depth_slice_bias,
            viewport,
        }
    }

    pub fn depth_slice(&self, view_z: F) -> u32 {
        if view_z <= self.near {
            return 0;
        }
        let slice = view_z.log2() * self.depth_slice_scale + self.depth_slice_bias;
        (slice.floor() as i64).clamp(0, NUM_CLUSTERS_Z as i64 - 1) as u32
    }

    fn slice_range(&self, bounds: &ClusterItemBounds) -> (u32, u32) {
        let near_z = (bounds.view_position.z - bounds.radius).max(self.near);
        let far_z = (bounds.view_position.z + bounds.radius).min(self.far);
        (self.depth_slice(near_z), self.depth_slice(far_z))
    }

    /// Conservative tile range along one screen axis
    fn tile_range(&self, center: F, radius: F, z: F, half_extent_at_unit_z: F, tiles: u32) -> (u32, u32) {
        let z = z.max(self.near);
        let extent = half_extent_at_unit_z * z;

        let to_tile = |v: F| {
            let ndc = (v / extent).clamp(-1.0, 1.0);
            let tile = ((ndc * 0.5 + 0.5) * tiles as F) as i64;
            tile.clamp(0, tiles as i64 - 1) as u32
        };

        (to_tile(center - radius), to_tile(center + radius))
    }

    fn cluster_ranges(&self, bounds: &ClusterItemBounds) -> ((u32, u32), (u32, u32), (u32, u32)) {
        let (z0, z1) = self.slice_range(bounds);
        // use the near edge of the item for the widest screen footprint
        let closest_z = (bounds.view_position.z - bounds.radius).max(self.near);

        let x = self.tile_range(
            bounds.view_position.x,
            bounds.radius,
            closest_z,
            self.tan_half_fovy * self.aspect,
            NUM_CLUSTERS_X,
        );
        let y = self.tile_range(
            bounds.view_position.y,
            bounds.radius,
            closest_z,
            self.tan_half_fovy,
            NUM_CLUSTERS_Y,
        );

        (x, y, (z0, z1))
    }

    /// Deterministic binning pass. Indices into the input slices become the
    /// packed item indices; within a cluster items are ordered lights,
    /// decals, probes
    pub fn build(
        &self,
        lights: &[ClusterItemBounds],
        decals: &[ClusterItemBounds],
        probes: &[ClusterItemBounds],
    ) -> ClusteredViewData {
        struct ClusterBin {
            lights: Vec<u32>,
            decals: Vec<u32>,
            probes: Vec<u32>,
        }

        let mut bins: Vec<ClusterBin> = (0..NUM_CLUSTERS)
            .map(|_| ClusterBin {
                lights: Vec::new(),
                decals: Vec::new(),
                probes: Vec::new(),
            })
            .collect();

        let mut bin = |items: &[ClusterItemBounds], select: fn(&mut ClusterBin) -> &mut Vec<u32>| {
            for (index, bounds) in items.iter().enumerate() {
                if bounds.view_position.z + bounds.radius < self.near
                    || bounds.view_position.z - bounds.radius > self.far
                {
                    continue;
                }

                let ((x0, x1), (y0, y1), (z0, z1)) = self.cluster_ranges(bounds);
                for z in z0..=z1 {
                    for y in y0..=y1 {
                        for x in x0..=x1 {
                            let cluster = (z * NUM_CLUSTERS_XY + y * NUM_CLUSTERS_X + x) as usize;
                            select(&mut bins[cluster]).push(index as u32);
                        }
                    }
                }
            }
        };

        bin(lights, |b| &mut b.lights);
        bin(decals, |b| &mut b.decals);
        bin(probes, |b| &mut b.probes);

        let mut clusters = Vec::with_capacity(NUM_CLUSTERS as usize);
        let mut items = Vec::new();
        for bin in &bins {
            let offset = items.len() as u32;

            let light_count = bin.lights.len().min(LIGHT_BITMASK as usize) as u32;
            let decal_count = bin.decals.len().min(DECAL_BITMASK as usize) as u32;
            let probe_count = bin.probes.len().min(PROBE_BITMASK as usize) as u32;

            items.extend(bin.lights.iter().take(light_count as usize).copied());
            items.extend(
                bin.decals
                    .iter()
                    .take(decal_count as usize)
                    .map(|i| i << DECAL_SHIFT),
            );
            items.extend(
                bin.probes
                    .iter()
                    .take(probe_count as usize)
                    .map(|i| i << PROBE_SHIFT),
            );

            clusters.push(PerClusterData {
                offset,
                counts: light_count | (decal_count << DECAL_SHIFT) | (probe_count << PROBE_SHIFT),
            });
        }

        let constants = ClusteredDataConstants {
            depth_slice_scale: self.depth_slice_scale,
            depth_slice_bias: self.depth_slice_bias,
            inv_tile_size: [
                NUM_CLUSTERS_X as F / self.viewport.0,
                NUM_CLUSTERS_Y as F / self.viewport.1,
            ],
            num_lights: lights.len() as u32,
            num_decals: decals.len() as u32,
            ..Default::default()
        };

        ClusteredViewData {
            clusters,
            items,
            constants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ClusterGridBuilder {
        ClusterGridBuilder::new(0.1, 1000.0, Rad::from(deg(90.0)), 16.0 / 9.0, (1920.0, 1080.0))
    }

    fn sphere(x: F, y: F, z: F, r: F) -> ClusterItemBounds {
        ClusterItemBounds {
            view_position: Vector3::new(x, y, z),
            radius: r,
        }
    }

    #[test]
    fn depth_slices_are_monotonic_and_exponential() {
        let b = builder();

        assert_eq!(b.depth_slice(0.1), 0);
        assert_eq!(b.depth_slice(1000.0), NUM_CLUSTERS_Z - 1);

        let mut last = 0;
        for z in [0.2, 0.5, 1.0, 5.0, 20.0, 100.0, 500.0, 999.0] {
            let slice = b.depth_slice(z);
            assert!(slice >= last, "slices must not decrease");
            last = slice;
        }

        // near slices are thinner than far ones
        let near_span = b.depth_slice(1.0) - b.depth_slice(0.1);
        let far_span = b.depth_slice(1000.0) - b.depth_slice(100.0);
        assert!(near_span > far_span);
    }

    #[test]
    fn item_index_packing_round_trips() {
        assert_eq!(light_index(37), 37);
        assert_eq!(decal_index(37 << DECAL_SHIFT), 37);
        assert_eq!(probe_index(37 << PROBE_SHIFT), 37);
    }

    #[test]
    fn centered_light_lands_in_the_middle_tiles() {
        let b = builder();
        let data = b.build(&[sphere(0.0, 0.0, 10.0, 1.0)], &[], &[]);

        assert_eq!(data.clusters.len(), NUM_CLUSTERS as usize);
        assert_eq!(data.constants.num_lights, 1);

        let slice = b.depth_slice(10.0);
        let center_cluster =
            (slice * NUM_CLUSTERS_XY + (NUM_CLUSTERS_Y / 2) * NUM_CLUSTERS_X + NUM_CLUSTERS_X / 2)
                as usize;
        let counts = data.clusters[center_cluster].counts;
        assert_eq!(counts & LIGHT_BITMASK, 1, "light missing from its cluster");

        // a far-corner cluster must not contain it
        let corner = ((NUM_CLUSTERS_Z - 1) * NUM_CLUSTERS_XY) as usize;
        assert_eq!(data.clusters[corner].counts & LIGHT_BITMASK, 0);
    }

    #[test]
    fn items_concatenate_lights_then_decals_then_probes() {
        let b = builder();
        let everywhere = sphere(0.0, 0.0, 100.0, 10_000.0);
        let data = b.build(&[everywhere], &[everywhere], &[everywhere]);

        // every cluster sees all three, in kind order
        for cluster in &data.clusters {
            assert_eq!(cluster.counts & LIGHT_BITMASK, 1);
            assert_eq!((cluster.counts >> DECAL_SHIFT) & DECAL_BITMASK, 1);
            assert_eq!((cluster.counts >> PROBE_SHIFT) & PROBE_BITMASK, 1);

            let offset = cluster.offset as usize;
            assert_eq!(light_index(data.items[offset]), 0);
            assert_eq!(decal_index(data.items[offset + 1]), 0);
            assert_eq!(probe_index(data.items[offset + 2]), 0);
        }
    }

    #[test]
    fn binning_is_deterministic() {
        let b = builder();
        let lights: Vec<_> = (0..40)
            .map(|i| sphere(i as F * 3.0 - 60.0, 0.0, 20.0 + i as F, 5.0))
            .collect();

        let first = b.build(&lights, &[], &[]);
        let second = b.build(&lights, &[], &[]);
        assert_eq!(first.items, second.items);
        assert!(first
            .clusters
            .iter()
            .zip(&second.clusters)
            .all(|(a, b)| a.offset == b.offset && a.counts == b.counts));
    }
}
