//! Categorized bounds store with sphere/box/frustum queries and
//! last-visible-frame tracking. Static records live in an R*-tree rebuilt
//! lazily; dynamic records are refreshed every frame

use ahash::AHashMap;
use common::*;
use rstar::{RTree, RTreeObject, AABB};

use crate::handle::{HandleTable, RawHandle};
use crate::object::{GameObjectHandle, ObjectStore};

pub(crate) const SPATIAL_TYPE_TAG: u8 = 3;

const MAX_CATEGORIES: usize = 32;

/// How many frames a stamp stays fresh before an object counts as invisible
const VISIBILITY_WINDOW: u64 = 2;

/// A registered spatial category bit
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SpatialCategory {
    bit: u32,
}

impl SpatialCategory {
    pub fn bitmask(self) -> u32 {
        1 << self.bit
    }

    pub fn bit(self) -> u32 {
        self.bit
    }
}

lazy_static! {
    static ref CATEGORIES: parking_lot::Mutex<Vec<String>> = parking_lot::Mutex::new(Vec::new());
}

/// Registers (or finds) a category by name. Category bits are process-wide
pub fn register_category(name: &str) -> SpatialCategory {
    let mut categories = CATEGORIES.lock();
    if let Some(bit) = categories.iter().position(|c| c == name) {
        return SpatialCategory { bit: bit as u32 };
    }

    assert!(
        categories.len() < MAX_CATEGORIES,
        "too many spatial categories"
    );
    categories.push(name.to_owned());
    SpatialCategory {
        bit: categories.len() as u32 - 1,
    }
}

pub fn render_static() -> SpatialCategory {
    register_category("RenderStatic")
}

pub fn render_dynamic() -> SpatialCategory {
    register_category("RenderDynamic")
}

#[derive(Copy, Clone, Debug)]
pub struct QueryParams {
    pub category_mask: u32,
    pub include_indirect: bool,
}

impl QueryParams {
    pub fn with_category(category: SpatialCategory) -> Self {
        Self {
            category_mask: category.bitmask(),
            include_indirect: false,
        }
    }

    pub fn with_mask(category_mask: u32) -> Self {
        Self {
            category_mask,
            include_indirect: false,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VisibilityState {
    /// Seen by a main view recently
    Direct,
    /// Only seen by an indirect view (shadows, reflections)
    Indirect,
    Invisible,
}

/// Sent to an object's components when its bounds need (re)publishing.
/// Handlers accumulate volumes and category bits; no contribution at all
/// removes the object from the index
#[derive(Default)]
pub struct MsgUpdateLocalBounds {
    result: Option<(BoundingVolume, u32)>,
}

crate::impl_message!(MsgUpdateLocalBounds);

impl MsgUpdateLocalBounds {
    pub fn add_bounds(&mut self, volume: BoundingVolume, category: SpatialCategory) {
        let mask = category.bitmask();
        match &mut self.result {
            Some((existing, categories)) => {
                let merged = existing.aabb.merged(&volume.aabb);
                *existing = BoundingVolume::from_aabb(merged);
                *categories |= mask;
            }
            None => self.result = Some((volume, mask)),
        }
    }

    pub fn take_result(&mut self) -> Option<(BoundingVolume, u32)> {
        self.result.take()
    }
}

pub struct SpatialRecord {
    pub object: GameObjectHandle,
    pub categories: u32,
    pub local: BoundingVolume,
    pub world: BoundingVolume,
    dynamic: bool,
    last_visible_direct: [u64; MAX_CATEGORIES],
    last_visible_indirect: [u64; MAX_CATEGORIES],
}

#[derive(Clone)]
struct StaticEntry {
    record: RawHandle,
    min: [f32; 3],
    max: [f32; 3],
}

impl RTreeObject for StaticEntry {
    type Envelope = AABB<[f32; 3]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(self.min, self.max)
    }
}

pub(crate) struct SpatialSystem {
    records: HandleTable<SpatialRecord>,
    by_object: AHashMap<GameObjectHandle, RawHandle>,
    static_tree: RTree<StaticEntry>,
    static_tree_dirty: bool,
}

enum QueryVolume<'a> {
    Sphere(&'a Sphere),
    Box(&'a Aabb),
    Frustum(&'a Frustum),
}

impl QueryVolume<'_> {
    fn overlaps(&self, volume: &BoundingVolume) -> bool {
        match self {
            QueryVolume::Sphere(sphere) => sphere.overlaps_sphere(&volume.sphere),
            QueryVolume::Box(aabb) => aabb.overlaps_aabb(&volume.aabb),
            QueryVolume::Frustum(frustum) => {
                frustum.intersects_sphere(&volume.sphere) && frustum.intersects_aabb(&volume.aabb)
            }
        }
    }

    /// Loose pre-filter envelope for the static tree, None = check everything
    fn envelope(&self) -> Option<AABB<[f32; 3]>> {
        match self {
            QueryVolume::Sphere(sphere) => {
                let r = Vector3::new(sphere.radius, sphere.radius, sphere.radius);
                Some(AABB::from_corners(
                    (sphere.center - r).into(),
                    (sphere.center + r).into(),
                ))
            }
            QueryVolume::Box(aabb) => {
                Some(AABB::from_corners(aabb.min.into(), aabb.max.into()))
            }
            QueryVolume::Frustum(_) => None,
        }
    }
}

impl SpatialSystem {
    pub fn new() -> Self {
        Self {
            records: HandleTable::new(SPATIAL_TYPE_TAG),
            by_object: AHashMap::new(),
            static_tree: RTree::new(),
            static_tree_dirty: false,
        }
    }

    /// Installs or refreshes the record for an object. Called from the
    /// update-local-bounds message handler path
    pub fn update_record(
        &mut self,
        object: GameObjectHandle,
        dynamic: bool,
        local: BoundingVolume,
        categories: u32,
        global: &Transform,
    ) {
        let world = local.transformed(global);

        match self.by_object.get(&object) {
            Some(raw) => {
                let record = self.records.get_mut(*raw).expect("record map out of sync");
                record.local = local;
                record.world = world;
                record.categories = categories;
                if record.dynamic != dynamic || !dynamic {
                    record.dynamic = dynamic;
                    self.static_tree_dirty = true;
                }
            }
            None => {
                let raw = self.records.insert(SpatialRecord {
                    object,
                    categories,
                    local,
                    world,
                    dynamic,
                    last_visible_direct: [0; MAX_CATEGORIES],
                    last_visible_indirect: [0; MAX_CATEGORIES],
                });
                self.by_object.insert(object, raw);
                if !dynamic {
                    self.static_tree_dirty = true;
                }
            }
        }
    }

    pub fn remove(&mut self, object: GameObjectHandle) {
        if let Some(raw) = self.by_object.remove(&object) {
            if let Some(record) = self.records.remove(raw) {
                if !record.dynamic {
                    self.static_tree_dirty = true;
                }
            }
        }
    }

    pub fn record_for(&self, object: GameObjectHandle) -> Option<&SpatialRecord> {
        self.by_object
            .get(&object)
            .and_then(|raw| self.records.get(*raw))
    }

    /// End-of-update sync: dynamic bounds follow their owner's transform
    pub fn update_dynamic_bounds(&mut self, objects: &ObjectStore) {
        for (_, record) in self.records.iter_mut() {
            if !record.dynamic {
                continue;
            }
            if let Some(owner) = objects.get(record.object) {
                record.world = record.local.transformed(owner.global_transform());
            }
        }
    }

    fn rebuild_static_tree(&mut self) {
        let entries: Vec<StaticEntry> = self
            .records
            .iter()
            .filter(|(_, r)| !r.dynamic)
            .map(|(raw, r)| StaticEntry {
                record: raw,
                min: r.world.aabb.min.into(),
                max: r.world.aabb.max.into(),
            })
            .collect();

        debug!("rebuilt static spatial tree"; "entries" => entries.len());
        self.static_tree = RTree::bulk_load(entries);
        self.static_tree_dirty = false;
    }

    fn query(
        &mut self,
        volume: QueryVolume,
        params: &QueryParams,
        visitor: &mut dyn FnMut(RawHandle, &SpatialRecord) -> bool,
    ) {
        if self.static_tree_dirty {
            self.rebuild_static_tree();
        }

        // statics through the tree where a pre-filter envelope exists
        match volume.envelope() {
            Some(envelope) => {
                for entry in self.static_tree.locate_in_envelope_intersecting(&envelope) {
                    let record = match self.records.get(entry.record) {
                        Some(r) => r,
                        None => continue,
                    };
                    if record.categories & params.category_mask != 0
                        && volume.overlaps(&record.world)
                        && !visitor(entry.record, record)
                    {
                        return;
                    }
                }
            }
            None => {
                for (raw, record) in self.records.iter().filter(|(_, r)| !r.dynamic) {
                    if record.categories & params.category_mask != 0
                        && volume.overlaps(&record.world)
                        && !visitor(raw, record)
                    {
                        return;
                    }
                }
            }
        }

        for (raw, record) in self.records.iter().filter(|(_, r)| r.dynamic) {
            if record.categories & params.category_mask != 0
                && volume.overlaps(&record.world)
                && !visitor(raw, record)
            {
                return;
            }
        }
    }

    pub fn find_objects_in_sphere(
        &mut self,
        sphere: &Sphere,
        params: &QueryParams,
        visitor: &mut dyn FnMut(GameObjectHandle) -> bool,
    ) {
        self.query(QueryVolume::Sphere(sphere), params, &mut |_, record| {
            visitor(record.object)
        });
    }

    pub fn find_objects_in_box(
        &mut self,
        aabb: &Aabb,
        params: &QueryParams,
        visitor: &mut dyn FnMut(GameObjectHandle) -> bool,
    ) {
        self.query(QueryVolume::Box(aabb), params, &mut |_, record| {
            visitor(record.object)
        });
    }

    /// Frustum query that also stamps each found record's last-visible frame
    /// for the queried categories
    pub fn find_visible_objects(
        &mut self,
        frustum: &Frustum,
        params: &QueryParams,
        visibility: VisibilityState,
        current_frame: u64,
        out: &mut Vec<GameObjectHandle>,
    ) {
        let mut found: Vec<RawHandle> = Vec::new();
        self.query(QueryVolume::Frustum(frustum), params, &mut |raw, record| {
            found.push(raw);
            out.push(record.object);
            true
        });

        for raw in found {
            if let Some(record) = self.records.get_mut(raw) {
                let stamps = match visibility {
                    VisibilityState::Indirect => &mut record.last_visible_indirect,
                    _ => &mut record.last_visible_direct,
                };
                for bit in 0..MAX_CATEGORIES {
                    if params.category_mask & (1 << bit) != 0 {
                        stamps[bit] = current_frame;
                    }
                }
            }
        }
    }

    /// Moving an object never resets its stamp; visibility just ages out
    pub fn visibility_state(
        &self,
        object: GameObjectHandle,
        category: SpatialCategory,
        current_frame: u64,
    ) -> VisibilityState {
        let record = match self.record_for(object) {
            Some(r) => r,
            None => return VisibilityState::Invisible,
        };

        let bit = category.bit() as usize;
        let direct = record.last_visible_direct[bit];
        if direct != 0 && current_frame.saturating_sub(direct) <= VISIBILITY_WINDOW {
            return VisibilityState::Direct;
        }

        let indirect = record.last_visible_indirect[bit];
        if indirect != 0 && current_frame.saturating_sub(indirect) <= VISIBILITY_WINDOW {
            return VisibilityState::Indirect;
        }

        VisibilityState::Invisible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::TypedHandle;
    use crate::object::GameObjectDesc;

    fn object_handle(store: &mut ObjectStore, pos: Vector3, dynamic: bool) -> GameObjectHandle {
        store.create(GameObjectDesc {
            dynamic,
            local: Transform::from_position(pos),
            ..Default::default()
        })
    }

    fn unit_volume() -> BoundingVolume {
        BoundingVolume::from_aabb(Aabb::from_center_and_half_extents(
            Vector3::zero(),
            Vector3::new(1.0, 1.0, 1.0),
        ))
    }

    #[test]
    fn category_registration_is_stable() {
        let a = register_category("spatial-test-cat");
        let b = register_category("spatial-test-cat");
        assert_eq!(a, b);
        assert_ne!(render_static(), render_dynamic());
    }

    #[test]
    fn sphere_query_respects_categories_and_bounds() {
        common::logging::for_tests();
        let mut store = ObjectStore::new();
        let mut spatial = SpatialSystem::new();

        let near_static = object_handle(&mut store, Vector3::new(0.0, 0.0, 0.0), false);
        let near_dynamic = object_handle(&mut store, Vector3::new(1.0, 0.0, 0.0), true);
        let far_static = object_handle(&mut store, Vector3::new(1000.0, 0.0, 0.0), false);

        for (h, dynamic, cat) in [
            (near_static, false, render_static()),
            (near_dynamic, true, render_dynamic()),
            (far_static, false, render_static()),
        ] {
            let global = *store.get(h).unwrap().global_transform();
            spatial.update_record(h, dynamic, unit_volume(), cat.bitmask(), &global);
        }

        let sphere = Sphere::new(Vector3::zero(), 10.0);

        let mut found = Vec::new();
        spatial.find_objects_in_sphere(
            &sphere,
            &QueryParams::with_category(render_static()),
            &mut |h| {
                found.push(h);
                true
            },
        );
        assert_eq!(found, [near_static]);

        let mut found = Vec::new();
        let both = render_static().bitmask() | render_dynamic().bitmask();
        spatial.find_objects_in_sphere(&sphere, &QueryParams::with_mask(both), &mut |h| {
            found.push(h);
            true
        });
        found.sort_by_key(|h| h.raw().to_bits());
        let mut expected = vec![near_static, near_dynamic];
        expected.sort_by_key(|h| h.raw().to_bits());
        assert_eq!(found, expected);
    }

    #[test]
    fn queries_can_early_out() {
        common::logging::for_tests();
        let mut store = ObjectStore::new();
        let mut spatial = SpatialSystem::new();

        for i in 0..10 {
            let h = object_handle(&mut store, Vector3::new(i as f32, 0.0, 0.0), false);
            let global = *store.get(h).unwrap().global_transform();
            spatial.update_record(
                h,
                false,
                unit_volume(),
                render_static().bitmask(),
                &global,
            );
        }

        let mut count = 0;
        spatial.find_objects_in_sphere(
            &Sphere::new(Vector3::zero(), 100.0),
            &QueryParams::with_category(render_static()),
            &mut |_| {
                count += 1;
                count < 3
            },
        );
        assert_eq!(count, 3);
    }

    #[test]
    fn stale_object_handles_in_queries() {
        let mut spatial = SpatialSystem::new();
        let fake: GameObjectHandle = TypedHandle::from_raw(crate::handle::RawHandle::from_bits(99));
        assert!(matches!(
            spatial.visibility_state(fake, render_static(), 10),
            VisibilityState::Invisible
        ));
        spatial.remove(fake); // no-op
    }

    #[test]
    fn visibility_ages_out() {
        common::logging::for_tests();
        let mut store = ObjectStore::new();
        let mut spatial = SpatialSystem::new();

        let h = object_handle(&mut store, Vector3::new(0.0, 0.0, -10.0), false);
        let global = *store.get(h).unwrap().global_transform();
        spatial.update_record(h, false, unit_volume(), render_static().bitmask(), &global);

        let proj: Matrix4 = cgmath::PerspectiveFov {
            fovy: Rad::from(deg(90.0)),
            aspect: 1.0,
            near: 0.1,
            far: 100.0,
        }
        .into();
        let frustum = Frustum::from_view_projection(&proj);

        let mut out = Vec::new();
        spatial.find_visible_objects(
            &frustum,
            &QueryParams::with_category(render_static()),
            VisibilityState::Direct,
            10,
            &mut out,
        );
        assert_eq!(out, [h]);

        assert_eq!(
            spatial.visibility_state(h, render_static(), 10),
            VisibilityState::Direct
        );
        assert_eq!(
            spatial.visibility_state(h, render_static(), 12),
            VisibilityState::Direct
        );
        assert_eq!(
            spatial.visibility_state(h, render_static(), 13),
            VisibilityState::Invisible
        );
    }
}
