//! The world: object store, component managers, messaging, spatial index and
//! the frame update orchestrator

use std::any::TypeId;

use ahash::AHashMap;
use common::*;
use parking_lot::Mutex;

use crate::command::CommandBuffer;
use crate::component::{
    AnyManager, Component, ComponentHandle, ComponentManager, UpdateContext, UpdateFunctionDesc,
    UpdatePhase, WorldAccess,
};
use crate::message::{Message, MessageQueue, MessageQueueKind};
use crate::object::{GameObject, GameObjectDesc, GameObjectHandle, ObjectStore, TraversalOrder};
use crate::schedule::{Schedule, ScheduledFn};
use crate::spatial::{
    MsgUpdateLocalBounds, QueryParams, SpatialCategory, SpatialSystem, VisibilityState,
};

#[derive(Clone, Debug)]
pub struct WorldDesc {
    pub name: String,
    pub rng_seed: Option<u64>,
    pub simulating: bool,
}

impl WorldDesc {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rng_seed: None,
            simulating: true,
        }
    }

    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn start_paused(mut self) -> Self {
        self.simulating = false;
        self
    }
}

/// Everything except the component managers. Lifecycle callbacks and update
/// functions see the world through this
pub struct WorldData {
    name: String,
    pub(crate) objects: ObjectStore,
    pub(crate) spatial: SpatialSystem,
    pub(crate) messages: MessageQueue,
    frame: u64,
    sim_time: f64,
    dt: f32,
    simulating: bool,
    rng: SmallRng,
}

impl WorldData {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn is_simulating(&self) -> bool {
        self.simulating
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    pub fn try_get_object(&self, handle: GameObjectHandle) -> Option<&GameObject> {
        self.objects.get(handle)
    }

    /// Moves an object. Static objects recompute their (and their subtree's)
    /// globals immediately; moving one while simulating is reported
    pub fn set_local_transform(&mut self, handle: GameObjectHandle, local: Transform) -> bool {
        let is_static = match self.objects.get(handle) {
            Some(o) => o.is_static(),
            None => return false,
        };

        if is_static && self.simulating && config::get_or_defaults().world.error_on_static_move {
            error!("static object moved while simulating"; "object" => %handle.raw());
        }

        self.objects
            .get_mut(handle)
            .expect("checked above")
            .local = local;
        if is_static {
            self.objects.refresh_static_globals(handle);
        }
        true
    }

    pub fn set_local_position(&mut self, handle: GameObjectHandle, position: Vector3) -> bool {
        match self.objects.get(handle) {
            Some(o) => {
                let mut local = *o.local_transform();
                local.position = position;
                self.set_local_transform(handle, local)
            }
            None => false,
        }
    }

    pub fn set_local_rotation(&mut self, handle: GameObjectHandle, rotation: Quaternion) -> bool {
        match self.objects.get(handle) {
            Some(o) => {
                let mut local = *o.local_transform();
                local.rotation = rotation;
                self.set_local_transform(handle, local)
            }
            None => false,
        }
    }

    pub fn set_local_scale(&mut self, handle: GameObjectHandle, scale: Vector3) -> bool {
        match self.objects.get(handle) {
            Some(o) => {
                let mut local = *o.local_transform();
                local.scale = scale;
                self.set_local_transform(handle, local)
            }
            None => false,
        }
    }
}

struct ManagerSlot {
    type_name: &'static str,
    manager: Mutex<Box<dyn AnyManager>>,
}

pub struct World {
    data: WorldData,
    managers: Vec<ManagerSlot>,
    manager_index: AHashMap<TypeId, usize>,
    schedule: Schedule,
    schedule_dirty: bool,
    pending: CommandBuffer,
}

impl World {
    pub fn new(desc: WorldDesc) -> Self {
        info!("created world"; "name" => &desc.name);
        Self {
            data: WorldData {
                name: desc.name,
                objects: ObjectStore::new(),
                spatial: SpatialSystem::new(),
                messages: MessageQueue::default(),
                frame: 0,
                sim_time: 0.0,
                dt: 0.0,
                simulating: desc.simulating,
                rng: seeded_rng(desc.rng_seed),
            },
            managers: Vec::new(),
            manager_index: AHashMap::new(),
            schedule: Schedule::default(),
            schedule_dirty: false,
            pending: CommandBuffer::new(),
        }
    }

    pub fn data(&self) -> &WorldData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut WorldData {
        &mut self.data
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn frame(&self) -> u64 {
        self.data.frame
    }

    pub fn is_simulating(&self) -> bool {
        self.data.simulating
    }

    pub fn set_simulating(&mut self, simulating: bool) {
        self.data.simulating = simulating;
    }

    // ------------------------------------------------------------------
    // objects

    pub fn create_object(&mut self, desc: GameObjectDesc) -> GameObjectHandle {
        self.data.objects.create(desc)
    }

    pub fn try_get_object(&self, handle: GameObjectHandle) -> Option<&GameObject> {
        self.data.objects.get(handle)
    }

    pub fn object_count(&self) -> usize {
        self.data.objects.len()
    }

    pub fn traverse(&self, order: TraversalOrder, visitor: &mut dyn FnMut(&GameObject) -> bool) {
        self.data.objects.traverse(order, visitor)
    }

    pub fn set_parent(
        &mut self,
        child: GameObjectHandle,
        parent: Option<GameObjectHandle>,
    ) -> bool {
        match self.data.objects.set_parent(child, parent) {
            Ok(changes) => {
                self.dispatch_activation_changes(changes);
                true
            }
            Err(()) => false,
        }
    }

    /// Equivalent inverse of [set_parent](Self::set_parent)
    pub fn add_child(&mut self, parent: GameObjectHandle, child: GameObjectHandle) -> bool {
        self.set_parent(child, Some(parent))
    }

    pub fn set_active(&mut self, handle: GameObjectHandle, active: bool) {
        let changes = self.data.objects.set_active_flag(handle, active);
        self.dispatch_activation_changes(changes);
    }

    pub fn set_global_key(&mut self, handle: GameObjectHandle, key: &str) -> bool {
        self.data.objects.set_global_key(handle, key)
    }

    pub fn object_with_global_key(&self, key: &str) -> Option<GameObjectHandle> {
        self.data.objects.by_global_key(key)
    }

    pub fn object_with_hashed_global_key(&self, hashed: u64) -> Option<GameObjectHandle> {
        self.data.objects.by_hashed_global_key(hashed)
    }

    /// Immediate, synchronous removal of the object and (unless
    /// `keep_children`) its whole subtree
    pub fn delete_object_now(&mut self, handle: GameObjectHandle, keep_children: bool) {
        let removed = self.data.objects.delete_now(handle, keep_children);
        let mut buffer = CommandBuffer::new();

        for object in &removed {
            let handle = object.handle();
            self.data.spatial.remove(handle);
            self.data.messages.drop_for_target(handle);

            for slot in &self.managers {
                slot.manager.lock().destroy_components_of(
                    handle,
                    &mut self.data,
                    &mut buffer,
                );
            }
        }

        self.pending.append(buffer);
        self.apply_commands_and_lifecycle();
    }

    /// Queues the object for removal at the end of the current (or next)
    /// update, keeping iterators of the running phase valid
    pub fn delete_object_delayed(&mut self, handle: GameObjectHandle) {
        self.data.objects.delete_delayed(handle);
    }

    pub fn set_local_transform(&mut self, handle: GameObjectHandle, local: Transform) -> bool {
        self.data.set_local_transform(handle, local)
    }

    pub fn set_local_position(&mut self, handle: GameObjectHandle, position: Vector3) -> bool {
        self.data.set_local_position(handle, position)
    }

    pub fn set_local_rotation(&mut self, handle: GameObjectHandle, rotation: Quaternion) -> bool {
        self.data.set_local_rotation(handle, rotation)
    }

    pub fn set_local_scale(&mut self, handle: GameObjectHandle, scale: Vector3) -> bool {
        self.data.set_local_scale(handle, scale)
    }

    fn dispatch_activation_changes(&mut self, changes: Vec<(GameObjectHandle, bool)>) {
        if changes.is_empty() {
            return;
        }

        let simulating = self.data.simulating;
        let mut buffer = CommandBuffer::new();
        for (object, active) in changes {
            for slot in &self.managers {
                slot.manager.lock().sync_activation(
                    object,
                    active,
                    &mut self.data,
                    &mut buffer,
                    simulating,
                );
            }
        }

        self.pending.append(buffer);
        self.apply_commands_and_lifecycle();
    }

    // ------------------------------------------------------------------
    // components

    pub fn register_component_manager<C: Component>(&mut self, manager: ComponentManager<C>) {
        let type_id = TypeId::of::<C>();
        if self.manager_index.contains_key(&type_id) {
            warn!("component manager already registered"; "component" => std::any::type_name::<C>());
            return;
        }

        self.manager_index.insert(type_id, self.managers.len());
        self.managers.push(ManagerSlot {
            type_name: std::any::type_name::<C>(),
            manager: Mutex::new(Box::new(manager)),
        });
        self.schedule_dirty = true;
    }

    fn manager_slot<C: Component>(&self) -> Option<&ManagerSlot> {
        self.manager_index
            .get(&TypeId::of::<C>())
            .map(|idx| &self.managers[*idx])
    }

    /// Attaches a component to an object. The component initializes (and
    /// activates) during the next update step
    pub fn create_component<C: Component>(
        &mut self,
        owner: GameObjectHandle,
        component: C,
    ) -> Option<ComponentHandle<C>> {
        if !self.data.objects.contains(owner) {
            return None;
        }

        let slot = match self.manager_slot::<C>() {
            Some(slot) => slot,
            None => {
                warn!("no manager registered"; "component" => std::any::type_name::<C>());
                return None;
            }
        };

        let handle = {
            let mut manager = slot.manager.lock();
            let manager = manager
                .as_any_mut()
                .downcast_mut::<ComponentManager<C>>()
                .expect("manager slot type mismatch");
            manager.insert(owner, component)
        };

        self.data
            .objects
            .get_mut(owner)
            .expect("checked above")
            .components
            .push(handle.raw());
        Some(handle)
    }

    /// Reads a component under the manager lock
    pub fn with_component<C: Component, R>(
        &self,
        handle: ComponentHandle<C>,
        f: impl FnOnce(&C) -> R,
    ) -> Option<R> {
        let slot = self.manager_slot::<C>()?;
        let manager = slot.manager.lock();
        let manager = manager
            .as_any()
            .downcast_ref::<ComponentManager<C>>()
            .expect("manager slot type mismatch");
        manager.get(handle).map(f)
    }

    pub fn with_component_mut<C: Component, R>(
        &mut self,
        handle: ComponentHandle<C>,
        f: impl FnOnce(&mut C) -> R,
    ) -> Option<R> {
        let slot = self.manager_slot::<C>()?;
        let mut manager = slot.manager.lock();
        let manager = manager
            .as_any_mut()
            .downcast_mut::<ComponentManager<C>>()
            .expect("manager slot type mismatch");
        manager.get_mut(handle).map(f)
    }

    // ------------------------------------------------------------------
    // messaging

    /// Invokes every matching handler on the target immediately. Stale
    /// targets are ignored. Returns true when a handler ran
    pub fn send_message<M: Message>(&mut self, target: GameObjectHandle, message: &mut M) -> bool {
        self.dispatch_message(target, message)
    }

    fn dispatch_message(&mut self, target: GameObjectHandle, message: &mut dyn Message) -> bool {
        if !self.data.objects.contains(target) {
            return false;
        }

        let mut buffer = CommandBuffer::new();
        let mut handled = false;
        for slot in &self.managers {
            handled |= slot.manager.lock().handle_message(
                target,
                message,
                &mut self.data,
                &mut buffer,
            );
        }

        self.pending.append(buffer);
        self.apply_commands_and_lifecycle();
        handled
    }

    /// Queues a message for a later update. Messages whose target dies
    /// before dispatch are dropped silently
    pub fn post_message<M: Message>(
        &mut self,
        target: GameObjectHandle,
        message: M,
        delay: f64,
        kind: MessageQueueKind,
    ) {
        self.data.messages.post(
            target,
            Box::new(message),
            delay,
            kind,
            self.data.sim_time,
            self.data.frame,
        );
    }

    // ------------------------------------------------------------------
    // spatial

    /// Asks the target's components for their bounds and installs the result
    /// in the spatial index
    pub fn update_local_bounds(&mut self, target: GameObjectHandle) {
        let mut message = MsgUpdateLocalBounds::default();
        self.dispatch_message(target, &mut message);

        let (dynamic, global) = match self.data.objects.get(target) {
            Some(o) => (o.is_dynamic(), *o.global_transform()),
            None => return,
        };

        match message.take_result() {
            Some((volume, categories)) => {
                self.data
                    .spatial
                    .update_record(target, dynamic, volume, categories, &global);
            }
            None => self.data.spatial.remove(target),
        }
    }

    pub fn find_objects_in_sphere(
        &mut self,
        sphere: &Sphere,
        params: &QueryParams,
    ) -> Vec<GameObjectHandle> {
        let mut out = Vec::new();
        self.data.spatial.find_objects_in_sphere(sphere, params, &mut |h| {
            out.push(h);
            true
        });
        out
    }

    pub fn find_objects_in_sphere_visitor(
        &mut self,
        sphere: &Sphere,
        params: &QueryParams,
        visitor: &mut dyn FnMut(GameObjectHandle) -> bool,
    ) {
        self.data.spatial.find_objects_in_sphere(sphere, params, visitor);
    }

    pub fn find_objects_in_box(
        &mut self,
        aabb: &Aabb,
        params: &QueryParams,
    ) -> Vec<GameObjectHandle> {
        let mut out = Vec::new();
        self.data.spatial.find_objects_in_box(aabb, params, &mut |h| {
            out.push(h);
            true
        });
        out
    }

    pub fn find_visible_objects(
        &mut self,
        frustum: &Frustum,
        params: &QueryParams,
        visibility: VisibilityState,
    ) -> Vec<GameObjectHandle> {
        let mut out = Vec::new();
        let frame = self.data.frame;
        self.data
            .spatial
            .find_visible_objects(frustum, params, visibility, frame, &mut out);
        out
    }

    pub fn visibility_state(
        &self,
        object: GameObjectHandle,
        category: SpatialCategory,
    ) -> VisibilityState {
        self.data
            .spatial
            .visibility_state(object, category, self.data.frame)
    }

    pub fn spatial_record(&self, object: GameObjectHandle) -> Option<&crate::SpatialRecord> {
        self.data.spatial.record_for(object)
    }

    // ------------------------------------------------------------------
    // update

    pub fn update(&mut self, dt: f32) {
        self.data.frame += 1;
        self.data.dt = dt;
        if self.data.simulating {
            self.data.sim_time += dt as f64;
        }

        self.apply_commands_and_lifecycle();
        self.drain_due_messages();
        self.ensure_schedule();

        self.run_sequential_phase(UpdatePhase::PreAsync);
        self.run_async_phase();
        self.run_sequential_phase(UpdatePhase::PostAsync);

        // transform phases: globals level by level, then velocities
        self.data.objects.update_global_transforms();
        self.data.objects.update_velocities(dt);

        self.run_sequential_phase(UpdatePhase::PostTransform);

        self.data.spatial.update_dynamic_bounds(&self.data.objects);

        // end of frame: delayed deletes
        for handle in self.data.objects.take_delayed_deletes() {
            self.delete_object_now(handle, false);
        }

        self.apply_commands_and_lifecycle();
    }

    /// Applies queued structural changes and runs component lifecycle
    /// callbacks to a fixed point, so nested creations settle within the
    /// same step
    fn apply_commands_and_lifecycle(&mut self) {
        loop {
            let commands = self.pending.take();
            let had_commands = !commands.is_empty();
            for command in commands {
                command(self);
            }

            let simulating = self.data.simulating;
            let mut buffer = CommandBuffer::new();
            let mut did_work = false;
            for slot in &self.managers {
                did_work |= slot.manager.lock().process_pending(
                    &mut self.data,
                    &mut buffer,
                    simulating,
                );
            }
            self.pending.append(buffer);

            if !had_commands && !did_work && self.pending.is_empty() {
                break;
            }
        }
    }

    fn drain_due_messages(&mut self) {
        let mut queue = std::mem::take(&mut self.data.messages);
        let now = self.data.sim_time;
        let frame = self.data.frame;

        let due = {
            let world = &*self;
            queue.take_due(now, frame, |target| world.target_initialized(target))
        };
        self.data.messages = queue;

        for mut message in due {
            self.dispatch_message(message.target, message.message.as_mut());
        }
    }

    fn target_initialized(&self, target: GameObjectHandle) -> bool {
        if !self.data.objects.contains(target) {
            // dead targets become due and drop silently at dispatch
            return true;
        }
        !self
            .managers
            .iter()
            .any(|slot| slot.manager.lock().has_uninitialized(target))
    }

    fn ensure_schedule(&mut self) {
        if !self.schedule_dirty {
            return;
        }
        self.schedule_dirty = false;

        let mut functions: Vec<(usize, UpdateFunctionDesc)> = Vec::new();
        for (index, slot) in self.managers.iter().enumerate() {
            for desc in slot.manager.lock().update_function_descs() {
                functions.push((index, desc));
            }
        }

        match Schedule::build(&functions) {
            Ok(schedule) => self.schedule = schedule,
            Err(e) => {
                error!("invalid update function configuration"; "error" => %e);
            }
        }
    }

    fn run_sequential_phase(&mut self, phase: UpdatePhase) {
        let fns: Vec<ScheduledFn> = self.schedule.phase(phase).to_vec();
        let dt = self.data.dt;

        for scheduled in fns {
            if scheduled.desc.only_when_simulating && !self.data.simulating {
                continue;
            }

            let simulating = self.data.simulating;
            let mut buffer = CommandBuffer::new();
            {
                let slot = &self.managers[scheduled.manager_index];
                let mut manager = slot.manager.lock();
                let count = manager.component_count();
                let mut ctx = UpdateContext {
                    world: WorldAccess::Exclusive(&mut self.data),
                    commands: &mut buffer,
                    dt,
                    simulating,
                    first: 0,
                    count,
                };
                manager.run_update(&scheduled.desc.name, &mut ctx);
            }

            self.pending.append(buffer);
            self.apply_commands_and_lifecycle();
        }
    }

    /// Async phase: dependency waves run one after the other; within a wave,
    /// managers update in parallel on scoped threads with shared world
    /// access. Structural changes queue up and apply at the phase barrier
    fn run_async_phase(&mut self) {
        let fns: Vec<ScheduledFn> = self.schedule.phase(UpdatePhase::Async).to_vec();
        if fns.is_empty() {
            return;
        }

        let dt = self.data.dt;
        let simulating = self.data.simulating;

        // wave = one step of the happens-before chain
        let mut waves: Vec<Vec<ScheduledFn>> = Vec::new();
        let mut wave_of: AHashMap<String, usize> = AHashMap::new();
        for scheduled in fns {
            let wave = scheduled
                .desc
                .depends_on
                .iter()
                .filter_map(|dep| wave_of.get(dep))
                .map(|w| w + 1)
                .max()
                .unwrap_or(0);
            wave_of.insert(scheduled.desc.name.clone(), wave);
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(scheduled);
        }

        for wave in waves {
            // group by manager: one thread per manager, batches sequential
            let mut by_manager: Vec<(usize, Vec<ScheduledFn>)> = Vec::new();
            for scheduled in wave {
                if scheduled.desc.only_when_simulating && !simulating {
                    continue;
                }
                match by_manager
                    .iter_mut()
                    .find(|(idx, _)| *idx == scheduled.manager_index)
                {
                    Some((_, tasks)) => tasks.push(scheduled),
                    None => by_manager.push((scheduled.manager_index, vec![scheduled])),
                }
            }

            let data = &self.data;
            let managers = &self.managers;
            let collected: Mutex<Vec<CommandBuffer>> = Mutex::new(Vec::new());

            std::thread::scope(|scope| {
                for (manager_index, tasks) in by_manager {
                    let slot = &managers[manager_index];
                    let collected = &collected;

                    scope.spawn(move || {
                        let mut manager = slot.manager.lock();
                        let mut local = CommandBuffer::new();

                        for task in tasks {
                            let total = manager.component_count();
                            if total == 0 {
                                continue;
                            }
                            let batch = match task.desc.granularity {
                                0 => total,
                                g => g as usize,
                            };

                            let mut first = 0;
                            while first < total {
                                let count = batch.min(total - first);
                                let mut ctx = UpdateContext {
                                    world: WorldAccess::Shared(data),
                                    commands: &mut local,
                                    dt,
                                    simulating,
                                    first,
                                    count,
                                };
                                manager.run_update(&task.desc.name, &mut ctx);
                                first += count;
                            }
                        }

                        collected.lock().push(local);
                    });
                }
            });

            for buffer in collected.into_inner() {
                self.pending.append(buffer);
            }
        }

        // phase barrier
        self.apply_commands_and_lifecycle();
    }

    pub fn manager_names(&self) -> Vec<&'static str> {
        self.managers.iter().map(|slot| slot.type_name).collect()
    }
}
