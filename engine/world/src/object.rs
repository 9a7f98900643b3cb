//! Game-object storage: hierarchy, transforms, names and global keys

use std::collections::hash_map::Entry;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use common::*;

use crate::handle::{HandleTable, RawHandle, TypedHandle};

pub type GameObjectHandle = TypedHandle<GameObject>;

pub(crate) const OBJECT_TYPE_TAG: u8 = 1;

#[derive(Clone, Debug)]
pub struct GameObjectDesc {
    pub name: Option<String>,
    pub parent: Option<GameObjectHandle>,
    pub dynamic: bool,
    pub active: bool,
    pub local: Transform,
}

impl Default for GameObjectDesc {
    fn default() -> Self {
        Self {
            name: None,
            parent: None,
            dynamic: false,
            active: true,
            local: Transform::identity(),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TraversalOrder {
    BreadthFirst,
    DepthFirst,
}

pub struct GameObject {
    pub(crate) handle: GameObjectHandle,
    pub(crate) name: Option<Arc<str>>,
    pub(crate) dynamic: bool,
    /// This object's own flag
    pub(crate) active_flag: bool,
    /// Own flag and every ancestor's, kept in sync on every change
    pub(crate) active_state: bool,
    pub(crate) local: Transform,
    pub(crate) global: Transform,
    pub(crate) prev_global: Transform,
    pub(crate) linear_velocity: Vector3,
    pub(crate) angular_velocity: Vector3,
    pub(crate) hierarchy_level: u32,
    pub(crate) parent: Option<GameObjectHandle>,
    pub(crate) first_child: Option<GameObjectHandle>,
    pub(crate) next_sibling: Option<GameObjectHandle>,
    pub(crate) prev_sibling: Option<GameObjectHandle>,
    pub(crate) global_key: Option<u64>,
    /// Attached components, type-erased
    pub(crate) components: SmallVec<[RawHandle; 4]>,
}

impl GameObject {
    pub fn handle(&self) -> GameObjectHandle {
        self.handle
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    pub fn is_static(&self) -> bool {
        !self.dynamic
    }

    /// Effective active state, false as soon as any ancestor is inactive
    pub fn is_active(&self) -> bool {
        self.active_state
    }

    pub fn active_flag(&self) -> bool {
        self.active_flag
    }

    pub fn local_transform(&self) -> &Transform {
        &self.local
    }

    pub fn global_transform(&self) -> &Transform {
        &self.global
    }

    pub fn global_position(&self) -> Vector3 {
        self.global.position
    }

    pub fn linear_velocity(&self) -> Vector3 {
        self.linear_velocity
    }

    pub fn angular_velocity(&self) -> Vector3 {
        self.angular_velocity
    }

    pub fn hierarchy_level(&self) -> u32 {
        self.hierarchy_level
    }

    pub fn parent(&self) -> Option<GameObjectHandle> {
        self.parent
    }

    pub fn components(&self) -> &[RawHandle] {
        &self.components
    }
}

#[derive(Default)]
struct StringInterner {
    strings: AHashSet<Arc<str>>,
}

impl StringInterner {
    fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(s) {
            return Arc::clone(existing);
        }
        let interned: Arc<str> = Arc::from(s);
        self.strings.insert(Arc::clone(&interned));
        interned
    }
}

fn hash_global_key(key: &str) -> u64 {
    use std::hash::{BuildHasher, Hasher};
    // fixed seeds keep keys stable within a process run
    let mut hasher = ahash::RandomState::with_seeds(11, 23, 47, 97).build_hasher();
    hasher.write(key.as_bytes());
    hasher.finish()
}

/// The object table plus everything derived from the hierarchy. Mutation
/// goes through the owning [World](crate::World)
pub struct ObjectStore {
    table: HandleTable<GameObject>,
    interner: StringInterner,
    global_keys: AHashMap<u64, GameObjectHandle>,
    /// Objects bucketed by hierarchy level so transforms update level by level
    levels: Vec<Vec<GameObjectHandle>>,
    delayed_delete: Vec<GameObjectHandle>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self {
            table: HandleTable::new(OBJECT_TYPE_TAG),
            interner: StringInterner::default(),
            global_keys: AHashMap::new(),
            levels: Vec::new(),
            delayed_delete: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn get(&self, handle: GameObjectHandle) -> Option<&GameObject> {
        self.table.get(handle.raw())
    }

    pub fn get_mut(&mut self, handle: GameObjectHandle) -> Option<&mut GameObject> {
        self.table.get_mut(handle.raw())
    }

    pub fn contains(&self, handle: GameObjectHandle) -> bool {
        self.table.contains(handle.raw())
    }

    pub fn create(&mut self, desc: GameObjectDesc) -> GameObjectHandle {
        let name = desc.name.as_deref().map(|n| self.interner.intern(n));

        let parent = desc.parent.filter(|p| self.contains(*p));
        let (level, parent_global, parent_active) = match parent {
            Some(p) => {
                let parent_obj = self.get(p).expect("checked above");
                (
                    parent_obj.hierarchy_level + 1,
                    Some(parent_obj.global),
                    parent_obj.active_state,
                )
            }
            None => (0, None, true),
        };

        let global = match &parent_global {
            Some(pg) => pg.compose(&desc.local),
            None => desc.local,
        };

        let object = GameObject {
            // fixed up right after insertion
            handle: TypedHandle::from_raw(RawHandle::from_bits(0)),
            name,
            dynamic: desc.dynamic,
            active_flag: desc.active,
            active_state: desc.active && parent_active,
            local: desc.local,
            global,
            prev_global: global,
            linear_velocity: Vector3::zero(),
            angular_velocity: Vector3::zero(),
            hierarchy_level: level,
            parent,
            first_child: None,
            next_sibling: None,
            prev_sibling: None,
            global_key: None,
            components: SmallVec::new(),
        };

        let handle = GameObjectHandle::from_raw(self.table.insert(object));
        self.get_mut(handle).expect("just inserted").handle = handle;

        if let Some(p) = parent {
            self.link_child(p, handle);
        }
        self.bucket_insert(level, handle);

        handle
    }

    fn bucket_insert(&mut self, level: u32, handle: GameObjectHandle) {
        let level = level as usize;
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        self.levels[level].push(handle);
    }

    fn bucket_remove(&mut self, level: u32, handle: GameObjectHandle) {
        if let Some(bucket) = self.levels.get_mut(level as usize) {
            if let Some(idx) = bucket.iter().position(|h| *h == handle) {
                bucket.swap_remove(idx);
            }
        }
    }

    /// Links as the new first child
    fn link_child(&mut self, parent: GameObjectHandle, child: GameObjectHandle) {
        let old_first = {
            let parent_obj = self.get_mut(parent).expect("parent must be alive");
            let old = parent_obj.first_child;
            parent_obj.first_child = Some(child);
            old
        };

        if let Some(old) = old_first {
            self.get_mut(old).expect("sibling must be alive").prev_sibling = Some(child);
        }

        let child_obj = self.get_mut(child).expect("child must be alive");
        child_obj.parent = Some(parent);
        child_obj.next_sibling = old_first;
        child_obj.prev_sibling = None;
    }

    /// Rewrites sibling back-links so traversal stays exact
    fn unlink_child(&mut self, child: GameObjectHandle) {
        let (parent, prev, next) = {
            let child_obj = self.get(child).expect("child must be alive");
            (child_obj.parent, child_obj.prev_sibling, child_obj.next_sibling)
        };

        match prev {
            Some(prev) => {
                self.get_mut(prev).expect("sibling must be alive").next_sibling = next;
            }
            None => {
                if let Some(parent) = parent {
                    self.get_mut(parent).expect("parent must be alive").first_child = next;
                }
            }
        }

        if let Some(next) = next {
            self.get_mut(next).expect("sibling must be alive").prev_sibling = prev;
        }

        let child_obj = self.get_mut(child).expect("child must be alive");
        child_obj.parent = None;
        child_obj.next_sibling = None;
        child_obj.prev_sibling = None;
    }

    pub fn is_ancestor_of(&self, maybe_ancestor: GameObjectHandle, of: GameObjectHandle) -> bool {
        let mut current = self.get(of).and_then(|o| o.parent);
        while let Some(handle) = current {
            if handle == maybe_ancestor {
                return true;
            }
            current = self.get(handle).and_then(|o| o.parent);
        }
        false
    }

    /// Re-parents `child`. Returns false (and changes nothing) when this
    /// would create a cycle or either handle is stale. Activation changes
    /// caused by the new ancestry are returned for component dispatch
    pub fn set_parent(
        &mut self,
        child: GameObjectHandle,
        new_parent: Option<GameObjectHandle>,
    ) -> Result<Vec<(GameObjectHandle, bool)>, ()> {
        if !self.contains(child) {
            return Err(());
        }
        if let Some(p) = new_parent {
            if !self.contains(p) {
                return Err(());
            }
            if p == child || self.is_ancestor_of(child, p) {
                warn!("refusing to re-parent an object under its own descendant"; "object" => %child.raw());
                return Err(());
            }
        }

        self.unlink_child(child);
        if let Some(p) = new_parent {
            self.link_child(p, child);
        }

        // hierarchy levels, static globals and active states all follow the
        // new ancestry immediately
        self.refresh_levels(child);
        self.refresh_static_globals(child);
        Ok(self.refresh_active_states(child))
    }

    fn refresh_levels(&mut self, root: GameObjectHandle) {
        let new_level = match self.get(root).and_then(|o| o.parent) {
            Some(p) => self.get(p).map(|o| o.hierarchy_level + 1).unwrap_or(0),
            None => 0,
        };

        let mut stack = vec![(root, new_level)];
        while let Some((handle, level)) = stack.pop() {
            let old_level = match self.get(handle) {
                Some(o) => o.hierarchy_level,
                None => continue,
            };

            if old_level != level {
                self.bucket_remove(old_level, handle);
                self.bucket_insert(level, handle);
                self.get_mut(handle).expect("checked above").hierarchy_level = level;
            }

            let mut child = self.get(handle).and_then(|o| o.first_child);
            while let Some(c) = child {
                stack.push((c, level + 1));
                child = self.get(c).and_then(|o| o.next_sibling);
            }
        }
    }

    /// Static objects compose their global eagerly; dynamic ones wait for the
    /// transform phase
    pub(crate) fn refresh_static_globals(&mut self, root: GameObjectHandle) {
        let mut stack = vec![root];
        while let Some(handle) = stack.pop() {
            let (is_static, parent) = match self.get(handle) {
                Some(o) => (o.is_static(), o.parent),
                None => continue,
            };

            if is_static {
                let parent_global = parent.and_then(|p| self.get(p)).map(|p| p.global);
                let obj = self.get_mut(handle).expect("checked above");
                obj.global = match parent_global {
                    Some(pg) => pg.compose(&obj.local),
                    None => obj.local,
                };
            }

            let mut child = self.get(handle).and_then(|o| o.first_child);
            while let Some(c) = child {
                stack.push(c);
                child = self.get(c).and_then(|o| o.next_sibling);
            }
        }
    }

    /// Recomputes effective active states below (and including) `root`,
    /// returning every object whose state flipped
    pub(crate) fn refresh_active_states(
        &mut self,
        root: GameObjectHandle,
    ) -> Vec<(GameObjectHandle, bool)> {
        let mut changed = Vec::new();
        let mut stack = vec![root];

        while let Some(handle) = stack.pop() {
            let parent_active = self
                .get(handle)
                .and_then(|o| o.parent)
                .and_then(|p| self.get(p))
                .map(|p| p.active_state)
                .unwrap_or(true);

            let obj = match self.get_mut(handle) {
                Some(o) => o,
                None => continue,
            };
            let new_state = obj.active_flag && parent_active;
            if new_state != obj.active_state {
                obj.active_state = new_state;
                changed.push((handle, new_state));
            }

            let mut child = self.get(handle).and_then(|o| o.first_child);
            while let Some(c) = child {
                stack.push(c);
                child = self.get(c).and_then(|o| o.next_sibling);
            }
        }

        changed
    }

    pub fn set_active_flag(
        &mut self,
        handle: GameObjectHandle,
        active: bool,
    ) -> Vec<(GameObjectHandle, bool)> {
        match self.get_mut(handle) {
            Some(obj) => obj.active_flag = active,
            None => return Vec::new(),
        }
        self.refresh_active_states(handle)
    }

    /// Collects the subtree rooted at `handle`, parents before children
    pub fn collect_subtree(&self, handle: GameObjectHandle) -> Vec<GameObjectHandle> {
        let mut out = Vec::new();
        let mut stack = vec![handle];
        while let Some(h) = stack.pop() {
            if self.contains(h) {
                out.push(h);
                let mut child = self.get(h).and_then(|o| o.first_child);
                while let Some(c) = child {
                    stack.push(c);
                    child = self.get(c).and_then(|o| o.next_sibling);
                }
            }
        }
        out
    }

    /// Removes the object (and descendants unless `keep_children`). Returns
    /// the removed objects so the caller can tear down components and
    /// spatial records
    pub fn delete_now(
        &mut self,
        handle: GameObjectHandle,
        keep_children: bool,
    ) -> Vec<GameObject> {
        if !self.contains(handle) {
            return Vec::new();
        }

        if keep_children {
            let parent = self.get(handle).and_then(|o| o.parent);
            let children: Vec<_> = {
                let mut out = Vec::new();
                let mut child = self.get(handle).and_then(|o| o.first_child);
                while let Some(c) = child {
                    child = self.get(c).and_then(|o| o.next_sibling);
                    out.push(c);
                }
                out
            };

            for child in children {
                // surviving children move up to the deleted object's parent
                let _ = self.set_parent(child, parent);
            }
        }

        let doomed = self.collect_subtree(handle);
        self.unlink_child(handle);

        let mut removed = Vec::with_capacity(doomed.len());
        for h in doomed {
            if let Some(obj) = self.table.remove(h.raw()) {
                self.bucket_remove(obj.hierarchy_level, h);
                if let Some(key) = obj.global_key {
                    self.global_keys.remove(&key);
                }
                removed.push(obj);
            }
        }

        removed
    }

    pub fn delete_delayed(&mut self, handle: GameObjectHandle) {
        if self.contains(handle) && !self.delayed_delete.contains(&handle) {
            self.delayed_delete.push(handle);
        }
    }

    pub fn take_delayed_deletes(&mut self) -> Vec<GameObjectHandle> {
        std::mem::take(&mut self.delayed_delete)
    }

    pub fn set_global_key(&mut self, handle: GameObjectHandle, key: &str) -> bool {
        if !self.contains(handle) {
            return false;
        }

        let hashed = hash_global_key(key);
        match self.global_keys.entry(hashed) {
            Entry::Occupied(e) if *e.get() != handle => {
                warn!("global key already taken"; "key" => key);
                false
            }
            entry => {
                *entry.or_insert(handle) = handle;
                self.get_mut(handle).expect("checked above").global_key = Some(hashed);
                true
            }
        }
    }

    pub fn by_global_key(&self, key: &str) -> Option<GameObjectHandle> {
        self.by_hashed_global_key(hash_global_key(key))
    }

    pub fn by_hashed_global_key(&self, hashed: u64) -> Option<GameObjectHandle> {
        self.global_keys.get(&hashed).copied()
    }

    pub fn roots(&self) -> Vec<GameObjectHandle> {
        self.levels
            .first()
            .map(|bucket| bucket.clone())
            .unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameObject> {
        self.table.iter().map(|(_, o)| o)
    }

    /// Visits every live object exactly once; return false to stop early
    pub fn traverse(&self, order: TraversalOrder, visitor: &mut dyn FnMut(&GameObject) -> bool) {
        let roots = self.roots();

        match order {
            TraversalOrder::DepthFirst => {
                let mut stack: Vec<GameObjectHandle> = roots;
                while let Some(handle) = stack.pop() {
                    let obj = match self.get(handle) {
                        Some(o) => o,
                        None => continue,
                    };
                    if !visitor(obj) {
                        return;
                    }

                    let mut child = obj.first_child;
                    while let Some(c) = child {
                        stack.push(c);
                        child = self.get(c).and_then(|o| o.next_sibling);
                    }
                }
            }
            TraversalOrder::BreadthFirst => {
                let mut queue: std::collections::VecDeque<GameObjectHandle> = roots.into();
                while let Some(handle) = queue.pop_front() {
                    let obj = match self.get(handle) {
                        Some(o) => o,
                        None => continue,
                    };
                    if !visitor(obj) {
                        return;
                    }

                    let mut child = obj.first_child;
                    while let Some(c) = child {
                        queue.push_back(c);
                        child = self.get(c).and_then(|o| o.next_sibling);
                    }
                }
            }
        }
    }

    /// Transform phase: globals from locals, one hierarchy level after the
    /// other so parents are always up to date before their children
    pub fn update_global_transforms(&mut self) {
        for level in 0..self.levels.len() {
            let handles = self.levels[level].clone();
            for handle in handles {
                let (dynamic, parent) = match self.get(handle) {
                    Some(o) => (o.dynamic, o.parent),
                    None => continue,
                };
                if !dynamic {
                    continue;
                }

                let parent_global = parent.and_then(|p| self.get(p)).map(|p| p.global);
                let obj = self.get_mut(handle).expect("checked above");
                obj.global = match parent_global {
                    Some(pg) => pg.compose(&obj.local),
                    None => obj.local,
                };
            }
        }
    }

    /// Transform phase: derive velocities and store this frame's global for
    /// the next one
    pub fn update_velocities(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }

        let inv_dt = 1.0 / dt;
        for (_, obj) in self.table.iter_mut() {
            obj.linear_velocity = (obj.global.position - obj.prev_global.position) * inv_dt;

            // angular velocity from the delta rotation, axis * angle / dt
            let delta = obj.global.rotation * obj.prev_global.rotation.invert();
            let angle = 2.0 * delta.s.clamp(-1.0, 1.0).acos();
            let axis = delta.v;
            obj.angular_velocity = if axis.magnitude2() > 1e-12 {
                axis.normalize() * angle * inv_dt
            } else {
                Vector3::zero()
            };

            obj.prev_global = obj.global;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_chain() -> (ObjectStore, GameObjectHandle, GameObjectHandle, GameObjectHandle) {
        let mut store = ObjectStore::new();
        let a = store.create(GameObjectDesc::default());
        let b = store.create(GameObjectDesc {
            parent: Some(a),
            ..Default::default()
        });
        let c = store.create(GameObjectDesc {
            parent: Some(b),
            ..Default::default()
        });
        (store, a, b, c)
    }

    #[test]
    fn hierarchy_levels_follow_parents() {
        let (store, a, b, c) = store_with_chain();

        assert_eq!(store.get(a).unwrap().hierarchy_level(), 0);
        assert_eq!(store.get(b).unwrap().hierarchy_level(), 1);
        assert_eq!(store.get(c).unwrap().hierarchy_level(), 2);
    }

    #[test]
    fn reparenting_updates_descendant_levels() {
        let (mut store, a, b, c) = store_with_chain();

        // detach b (and its subtree) to the root
        store.set_parent(b, None).unwrap();
        assert_eq!(store.get(b).unwrap().hierarchy_level(), 0);
        assert_eq!(store.get(c).unwrap().hierarchy_level(), 1);
        assert_eq!(store.get(a).unwrap().first_child, None);
    }

    #[test]
    fn cycles_are_impossible() {
        let (mut store, a, _b, c) = store_with_chain();

        common::logging::for_tests();
        assert!(store.set_parent(a, Some(c)).is_err());
        assert!(store.set_parent(a, Some(a)).is_err());
        // hierarchy unchanged
        assert_eq!(store.get(a).unwrap().hierarchy_level(), 0);
    }

    #[test]
    fn delete_removes_descendants() {
        let (mut store, a, b, c) = store_with_chain();

        let removed = store.delete_now(b, false);
        assert_eq!(removed.len(), 2);
        assert!(store.contains(a));
        assert!(!store.contains(b));
        assert!(!store.contains(c));
        assert_eq!(store.get(a).unwrap().first_child, None);
    }

    #[test]
    fn delete_keep_children_reattaches() {
        let (mut store, a, b, c) = store_with_chain();

        let removed = store.delete_now(b, true);
        assert_eq!(removed.len(), 1);
        assert!(store.contains(c));
        assert_eq!(store.get(c).unwrap().parent(), Some(a));
        assert_eq!(store.get(c).unwrap().hierarchy_level(), 1);
    }

    #[test]
    fn traversal_visits_each_object_once() {
        let (mut store, a, _b, _c) = store_with_chain();
        // second subtree
        let d = store.create(GameObjectDesc {
            parent: Some(a),
            ..Default::default()
        });
        let _ = d;

        for order in [TraversalOrder::BreadthFirst, TraversalOrder::DepthFirst] {
            let mut seen = Vec::new();
            store.traverse(order, &mut |obj| {
                seen.push(obj.handle());
                true
            });
            assert_eq!(seen.len(), store.len(), "order {:?}", order);
            let unique: std::collections::HashSet<_> = seen.iter().collect();
            assert_eq!(unique.len(), seen.len());
        }
    }

    #[test]
    fn active_state_propagates_down() {
        let (mut store, a, b, c) = store_with_chain();

        let changed = store.set_active_flag(a, false);
        assert_eq!(changed.len(), 3);
        assert!(!store.get(c).unwrap().is_active());
        // own flag is untouched
        assert!(store.get(b).unwrap().active_flag());

        // reactivating the root reactivates the chain
        let changed = store.set_active_flag(a, true);
        assert_eq!(changed.len(), 3);
        assert!(store.get(c).unwrap().is_active());
    }

    #[test]
    fn static_global_updates_eagerly() {
        let mut store = ObjectStore::new();
        let parent = store.create(GameObjectDesc {
            local: Transform::from_position(Vector3::new(10.0, 0.0, 0.0)),
            ..Default::default()
        });
        let child = store.create(GameObjectDesc {
            parent: Some(parent),
            local: Transform::from_position(Vector3::new(0.0, 5.0, 0.0)),
            ..Default::default()
        });

        // no transform phase ran, the static child is already composed
        let global = store.get(child).unwrap().global_transform();
        assert!((global.position - Vector3::new(10.0, 5.0, 0.0)).magnitude() < 1e-6);
    }

    #[test]
    fn global_keys_address_objects() {
        let (mut store, a, b, _c) = store_with_chain();

        assert!(store.set_global_key(a, "player"));
        assert_eq!(store.by_global_key("player"), Some(a));

        common::logging::for_tests();
        assert!(!store.set_global_key(b, "player"));

        store.delete_now(a, false);
        assert_eq!(store.by_global_key("player"), None);
    }
}
