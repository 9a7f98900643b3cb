//! Spatial index scenario: a thousand randomly placed bounds, category
//! filtered queries checked against brute force, and visibility tracking

use std::collections::HashSet;

use common::*;
use world::{
    render_dynamic, render_static, Component, ComponentCtx, ComponentManager, GameObjectDesc,
    MsgUpdateLocalBounds, QueryParams, StorageType, VisibilityState, World, WorldDesc,
};

struct TestBoundsComponent;

impl Component for TestBoundsComponent {
    fn initialize(&mut self, ctx: &mut ComponentCtx) {
        let owner = ctx.owner;
        ctx.commands.update_local_bounds(owner);
    }
}

fn on_update_local_bounds(
    _c: &mut TestBoundsComponent,
    ctx: &mut ComponentCtx,
    msg: &mut MsgUpdateLocalBounds,
) {
    let rng = ctx.world.rng();
    let x = rng.gen_range(1.0..100.0);
    let y = rng.gen_range(1.0..100.0);
    let z = rng.gen_range(1.0..100.0);

    let bounds = Aabb::from_center_and_half_extents(Vector3::zero(), Vector3::new(x, y, z));

    let dynamic = ctx
        .world
        .objects()
        .get(ctx.owner)
        .map(|o| o.is_dynamic())
        .unwrap_or(false);
    let category = if dynamic {
        render_dynamic()
    } else {
        render_static()
    };

    msg.add_bounds(BoundingVolume::from_aabb(bounds), category);
}

fn build_world() -> (World, Vec<world::GameObjectHandle>) {
    common::logging::for_tests();
    let mut manager = ComponentManager::<TestBoundsComponent>::new(StorageType::Compact);
    manager.add_message_handler(on_update_local_bounds);

    let mut w = World::new(WorldDesc::new("Spatial").rng_seed(5));
    w.register_component_manager(manager);

    let mut rng = seeded_rng(Some(17));
    let mut objects = Vec::with_capacity(1000);
    for i in 0..1000 {
        const RANGE: f32 = 10_000.0;
        let pos = Vector3::new(
            rng.gen_range(-RANGE..RANGE),
            rng.gen_range(-RANGE..RANGE),
            rng.gen_range(-RANGE..RANGE),
        );

        let handle = w.create_object(GameObjectDesc {
            dynamic: i >= 500,
            local: Transform::from_position(pos),
            ..Default::default()
        });
        w.create_component(handle, TestBoundsComponent);
        objects.push(handle);
    }

    w.update(0.016);
    (w, objects)
}

#[test]
fn sphere_query_matches_brute_force() {
    let (mut w, objects) = build_world();

    let sphere = Sphere::new(Vector3::new(100.0, 60.0, 400.0), 3000.0);
    let params = QueryParams::with_category(render_static());

    let found = w.find_objects_in_sphere(&sphere, &params);

    // no duplicates
    let unique: HashSet<_> = found.iter().copied().collect();
    assert_eq!(unique.len(), found.len());

    // exactly the statics whose bounds sphere overlaps the query sphere
    let mut expected = HashSet::new();
    for handle in &objects {
        let obj = w.try_get_object(*handle).unwrap();
        let record = w.spatial_record(*handle).expect("every object published bounds");
        if obj.is_static() && sphere.overlaps_sphere(&record.world.sphere) {
            expected.insert(*handle);
        }
    }

    assert!(!expected.is_empty(), "seed produced a degenerate scenario");
    assert_eq!(unique, expected);

    for handle in &found {
        assert!(w.try_get_object(*handle).unwrap().is_static());
    }
}

#[test]
fn box_query_matches_brute_force() {
    let (mut w, objects) = build_world();

    let aabb = Aabb::from_center_and_half_extents(
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(4000.0, 4000.0, 4000.0),
    );
    let both = render_static().bitmask() | render_dynamic().bitmask();
    let found = w.find_objects_in_box(&aabb, &QueryParams::with_mask(both));

    let unique: HashSet<_> = found.iter().copied().collect();
    assert_eq!(unique.len(), found.len());

    let mut expected = HashSet::new();
    for handle in &objects {
        let record = w.spatial_record(*handle).unwrap();
        if aabb.overlaps_aabb(&record.world.aabb) {
            expected.insert(*handle);
        }
    }
    assert_eq!(unique, expected);
}

#[test]
fn visibility_tracks_the_last_frustum_query() {
    let (mut w, objects) = build_world();

    // a few warmup frames
    for _ in 0..13 {
        w.update(0.016);
    }

    let proj: Matrix4 = cgmath::PerspectiveFov {
        fovy: Rad::from(deg(90.0)),
        aspect: 1.0,
        near: 1.0,
        far: 20_000.0,
    }
    .into();
    let frustum = Frustum::from_view_projection(&proj);

    let params = QueryParams::with_category(render_static());
    let visible = w.find_visible_objects(&frustum, &params, VisibilityState::Direct);
    let visible: HashSet<_> = visible.into_iter().collect();
    assert!(!visible.is_empty(), "frustum saw nothing");

    for handle in &objects {
        let obj = w.try_get_object(*handle).unwrap();
        if obj.is_dynamic() {
            continue;
        }

        let state = w.visibility_state(*handle, render_static());
        if visible.contains(handle) {
            assert_eq!(state, VisibilityState::Direct);
        } else {
            assert_eq!(state, VisibilityState::Invisible);
        }
    }

    // moving an object does not reset its stamp; visibility ages out instead
    w.update(0.016);
    w.update(0.016);
    for handle in visible.iter().take(1) {
        assert_eq!(
            w.visibility_state(*handle, render_static()),
            VisibilityState::Direct
        );
    }
    w.update(0.016);
    for handle in visible.iter().take(1) {
        assert_eq!(
            w.visibility_state(*handle, render_static()),
            VisibilityState::Invisible
        );
    }
}
