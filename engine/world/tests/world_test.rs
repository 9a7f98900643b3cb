//! Object store and transform behavior across full world updates

use common::*;
use world::{GameObjectDesc, TraversalOrder, World, WorldDesc};

fn world() -> World {
    common::logging::for_tests();
    World::new(WorldDesc::new("Test"))
}

fn rotated_scaled_parent() -> GameObjectDesc {
    GameObjectDesc {
        dynamic: true,
        local: Transform {
            position: Vector3::new(100.0, 0.0, 0.0),
            rotation: Quaternion::from_angle_z(deg(90.0)),
            scale: Vector3::new(1.5, 1.5, 1.5),
        },
        ..Default::default()
    }
}

#[test]
fn child_transforms_compose_through_the_hierarchy() {
    let mut w = world();

    let p1 = w.create_object(rotated_scaled_parent());
    let p2 = w.create_object(rotated_scaled_parent());

    let child = |parent| GameObjectDesc {
        dynamic: true,
        parent: Some(parent),
        local: Transform::from_position(Vector3::new(100.0, 0.0, 0.0)),
        ..Default::default()
    };
    let c11 = w.create_object(child(p1));
    let c21 = w.create_object(child(p2));

    w.update(1.0 / 60.0);

    for handle in [c11, c21] {
        let obj = w.try_get_object(handle).unwrap();
        let pos = obj.global_position();
        assert!((pos - Vector3::new(100.0, 150.0, 0.0)).magnitude() < 1e-3, "{:?}", pos);

        // two 90 degree turns
        let expected: Quaternion = Quaternion::from_angle_z(deg(180.0));
        let dot = obj.global_transform().rotation.dot(expected).abs();
        assert!(dot > 0.999, "rotation {:?}", obj.global_transform().rotation);
    }
}

#[test]
fn hierarchy_levels_hold_after_arbitrary_restructuring() {
    let mut w = world();

    let mut handles = Vec::new();
    for i in 0..50 {
        let parent = if i == 0 {
            None
        } else {
            Some(handles[i / 2])
        };
        handles.push(w.create_object(GameObjectDesc {
            parent,
            ..Default::default()
        }));
    }

    // shuffle some subtrees around
    w.set_parent(handles[10], Some(handles[3])).then_some(()).unwrap();
    w.set_parent(handles[7], None);
    w.set_parent(handles[20], Some(handles[7]));

    let mut visited = 0;
    w.traverse(TraversalOrder::BreadthFirst, &mut |obj| {
        let expected = match obj.parent() {
            Some(p) => w.try_get_object(p).unwrap().hierarchy_level() + 1,
            None => 0,
        };
        assert_eq!(obj.hierarchy_level(), expected);
        visited += 1;
        true
    });
    assert_eq!(visited, w.object_count());
}

#[test]
fn static_children_compose_without_an_update() {
    let mut w = world();
    w.set_simulating(false);

    let parent = w.create_object(GameObjectDesc {
        local: Transform::from_position(Vector3::new(10.0, 20.0, 30.0)),
        ..Default::default()
    });
    let child = w.create_object(GameObjectDesc {
        parent: Some(parent),
        local: Transform::from_position(Vector3::new(1.0, 2.0, 3.0)),
        ..Default::default()
    });

    // no world update has run
    let global = w.try_get_object(child).unwrap().global_position();
    assert!((global - Vector3::new(11.0, 22.0, 33.0)).magnitude() < 1e-6);

    // moving the parent re-composes the static subtree immediately
    w.set_local_position(parent, Vector3::new(100.0, 0.0, 0.0));
    let global = w.try_get_object(child).unwrap().global_position();
    assert!((global - Vector3::new(101.0, 2.0, 3.0)).magnitude() < 1e-6);
}

#[test]
fn linear_velocity_derives_from_frame_delta() {
    let mut w = world();

    let obj = w.create_object(GameObjectDesc {
        dynamic: true,
        ..Default::default()
    });

    w.update(0.1);
    w.set_local_position(obj, Vector3::new(1.0, 0.0, 0.0));
    w.update(0.1);

    let velocity = w.try_get_object(obj).unwrap().linear_velocity();
    assert!((velocity - Vector3::new(10.0, 0.0, 0.0)).magnitude() < 1e-4, "{:?}", velocity);
}

#[test]
fn deactivating_an_ancestor_deactivates_the_subtree_immediately() {
    let mut w = world();

    let root = w.create_object(GameObjectDesc::default());
    let mid = w.create_object(GameObjectDesc {
        parent: Some(root),
        ..Default::default()
    });
    let leaf = w.create_object(GameObjectDesc {
        parent: Some(mid),
        ..Default::default()
    });

    w.set_active(root, false);
    assert!(!w.try_get_object(leaf).unwrap().is_active());
    assert!(w.try_get_object(mid).unwrap().active_flag());

    w.set_active(root, true);
    assert!(w.try_get_object(leaf).unwrap().is_active());
}

#[test]
fn handles_stay_safe_after_deletion() {
    let mut w = world();

    let obj = w.create_object(GameObjectDesc::default());
    let child = w.create_object(GameObjectDesc {
        parent: Some(obj),
        ..Default::default()
    });

    w.delete_object_now(obj, false);
    assert!(w.try_get_object(obj).is_none());
    assert!(w.try_get_object(child).is_none());
    assert!(!w.set_local_position(obj, Vector3::zero()));

    // recycled slots must not resurrect old handles
    let replacement = w.create_object(GameObjectDesc::default());
    assert!(w.try_get_object(obj).is_none());
    assert!(w.try_get_object(replacement).is_some());
}

#[test]
fn delayed_delete_happens_at_end_of_update() {
    let mut w = world();

    let obj = w.create_object(GameObjectDesc::default());
    w.delete_object_delayed(obj);
    assert!(w.try_get_object(obj).is_some());

    w.update(0.016);
    assert!(w.try_get_object(obj).is_none());
}

#[test]
fn global_keys_look_up_within_the_world() {
    let mut w = world();

    let obj = w.create_object(GameObjectDesc::default());
    assert!(w.set_global_key(obj, "boss"));
    assert_eq!(w.object_with_global_key("boss"), Some(obj));

    w.delete_object_now(obj, false);
    assert_eq!(w.object_with_global_key("boss"), None);
}
