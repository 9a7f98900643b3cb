//! Typed component storage and managers: lifecycle callbacks, message
//! handlers and registered update functions

use std::any::{Any, TypeId};

use ahash::AHashMap;
use common::*;

use crate::command::CommandBuffer;
use crate::handle::{HandleTable, RawHandle, TypedHandle};
use crate::message::Message;
use crate::object::GameObjectHandle;
use crate::world::WorldData;

pub(crate) const COMPONENT_TYPE_TAG: u8 = 2;

pub type ComponentHandle<C> = TypedHandle<C>;

/// Lifecycle of a component instance
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ComponentState {
    /// Created, waiting for its first update to initialize
    Initializing,
    Initialized,
    Dead,
}

/// A typed behavior attached to exactly one game object. All callbacks on a
/// single instance are serialized by the world
pub trait Component: Send + Sync + Sized + 'static {
    /// Once per component, before its first update after creation
    fn initialize(&mut self, ctx: &mut ComponentCtx) {
        let _ = ctx;
    }

    /// Once on destruction, after deactivation
    fn deinitialize(&mut self, ctx: &mut ComponentCtx) {
        let _ = ctx;
    }

    /// Every time the owner's effective active state becomes true
    fn on_activated(&mut self, ctx: &mut ComponentCtx) {
        let _ = ctx;
    }

    /// Every time the owner's effective active state becomes false
    fn on_deactivated(&mut self, ctx: &mut ComponentCtx) {
        let _ = ctx;
    }

    /// Once, at the first update where the world simulates while this
    /// component is active
    fn on_simulation_started(&mut self, ctx: &mut ComponentCtx) {
        let _ = ctx;
    }
}

/// World access handed to lifecycle callbacks and message handlers.
/// Structural changes (new objects, new components) go through `commands`
/// and are applied before the current update step finishes
pub struct ComponentCtx<'a> {
    pub owner: GameObjectHandle,
    pub world: &'a mut WorldData,
    pub commands: &'a mut CommandBuffer,
}

/// Which block-storage flavor backs a manager
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageType {
    /// Stable slots with a free list, for types that churn
    FreeList,
    /// Swap-removed dense array behind a slot indirection, for types that are
    /// mostly iterated
    Compact,
}

pub(crate) struct ComponentEntry<C> {
    pub component: C,
    pub owner: GameObjectHandle,
    pub state: ComponentState,
    pub was_active: bool,
    pub sim_started: bool,
}

pub(crate) enum ComponentStorage<C> {
    FreeList(HandleTable<ComponentEntry<C>>),
    Compact {
        sparse: HandleTable<u32>,
        dense: Vec<(RawHandle, ComponentEntry<C>)>,
    },
}

impl<C> ComponentStorage<C> {
    fn new(flavor: StorageType) -> Self {
        match flavor {
            StorageType::FreeList => Self::FreeList(HandleTable::new(COMPONENT_TYPE_TAG)),
            StorageType::Compact => Self::Compact {
                sparse: HandleTable::new(COMPONENT_TYPE_TAG),
                dense: Vec::new(),
            },
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::FreeList(table) => table.len(),
            Self::Compact { dense, .. } => dense.len(),
        }
    }

    pub fn insert(&mut self, entry: ComponentEntry<C>) -> RawHandle {
        match self {
            Self::FreeList(table) => table.insert(entry),
            Self::Compact { sparse, dense } => {
                let index = dense.len() as u32;
                let handle = sparse.insert(index);
                dense.push((handle, entry));
                handle
            }
        }
    }

    pub fn get(&self, handle: RawHandle) -> Option<&ComponentEntry<C>> {
        match self {
            Self::FreeList(table) => table.get(handle),
            Self::Compact { sparse, dense } => sparse
                .get(handle)
                .and_then(|idx| dense.get(*idx as usize))
                .map(|(_, entry)| entry),
        }
    }

    pub fn get_mut(&mut self, handle: RawHandle) -> Option<&mut ComponentEntry<C>> {
        match self {
            Self::FreeList(table) => table.get_mut(handle),
            Self::Compact { sparse, dense } => sparse
                .get(handle)
                .copied()
                .and_then(move |idx| dense.get_mut(idx as usize))
                .map(|(_, entry)| entry),
        }
    }

    pub fn remove(&mut self, handle: RawHandle) -> Option<ComponentEntry<C>> {
        match self {
            Self::FreeList(table) => table.remove(handle),
            Self::Compact { sparse, dense } => {
                let index = sparse.remove(handle)? as usize;
                let (_, entry) = dense.swap_remove(index);
                // the moved entry's slot must point at its new position
                if let Some((moved_handle, _)) = dense.get(index) {
                    let moved_handle = *moved_handle;
                    if let Some(slot) = sparse.get_mut(moved_handle) {
                        *slot = index as u32;
                    }
                }
                Some(entry)
            }
        }
    }

    pub fn iter_mut(&mut self) -> Box<dyn Iterator<Item = (RawHandle, &mut ComponentEntry<C>)> + '_> {
        match self {
            Self::FreeList(table) => Box::new(table.iter_mut()),
            Self::Compact { dense, .. } => {
                Box::new(dense.iter_mut().map(|(h, entry)| (*h, entry)))
            }
        }
    }

    /// Handles of the `count` components starting at dense position `first`
    fn range_handles(&self, first: usize, count: usize) -> Vec<RawHandle> {
        match self {
            Self::FreeList(table) => table
                .iter()
                .skip(first)
                .take(count)
                .map(|(h, _)| h)
                .collect(),
            Self::Compact { dense, .. } => dense
                .iter()
                .skip(first)
                .take(count)
                .map(|(h, _)| *h)
                .collect(),
        }
    }
}

/// View over one manager's components handed to update functions
pub struct Components<'a, C: Component> {
    storage: &'a mut ComponentStorage<C>,
    first: usize,
    count: usize,
}

impl<'a, C: Component> Components<'a, C> {
    /// Visits active, initialized components in the update batch
    pub fn for_each(&mut self, mut f: impl FnMut(&mut C)) {
        let handles = self.storage.range_handles(self.first, self.count);
        for handle in handles {
            if let Some(entry) = self.storage.get_mut(handle) {
                if entry.state == ComponentState::Initialized && entry.was_active {
                    f(&mut entry.component);
                }
            }
        }
    }

    /// Visits every component in the batch regardless of active state
    pub fn for_each_with_inactive(&mut self, mut f: impl FnMut(&mut C, bool)) {
        let handles = self.storage.range_handles(self.first, self.count);
        for handle in handles {
            if let Some(entry) = self.storage.get_mut(handle) {
                if entry.state == ComponentState::Initialized {
                    f(&mut entry.component, entry.was_active);
                }
            }
        }
    }
}

/// Phase an update function runs in
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum UpdatePhase {
    PreAsync,
    Async,
    PostAsync,
    PostTransform,
}

#[derive(Clone, Debug)]
pub struct UpdateFunctionDesc {
    pub name: String,
    pub phase: UpdatePhase,
    /// Higher runs earlier within the phase
    pub priority: f32,
    /// Names of update functions that must run before this one
    pub depends_on: Vec<String>,
    pub only_when_simulating: bool,
    /// Async only: components per parallel batch, 0 = whole storage at once
    pub granularity: u32,
}

impl UpdateFunctionDesc {
    pub fn new(name: impl Into<String>, phase: UpdatePhase) -> Self {
        Self {
            name: name.into(),
            phase,
            priority: 0.0,
            depends_on: Vec::new(),
            only_when_simulating: false,
            granularity: 0,
        }
    }

    pub fn priority(mut self, priority: f32) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    pub fn only_when_simulating(mut self) -> Self {
        self.only_when_simulating = true;
        self
    }

    pub fn granularity(mut self, granularity: u32) -> Self {
        self.granularity = granularity;
        self
    }
}

/// Shared or exclusive world view, depending on the phase
pub enum WorldAccess<'a> {
    Exclusive(&'a mut WorldData),
    Shared(&'a WorldData),
}

impl<'a> WorldAccess<'a> {
    pub fn data(&self) -> &WorldData {
        match self {
            WorldAccess::Exclusive(data) => data,
            WorldAccess::Shared(data) => data,
        }
    }

    /// None during Async phases, which only get shared access
    pub fn data_mut(&mut self) -> Option<&mut WorldData> {
        match self {
            WorldAccess::Exclusive(data) => Some(data),
            WorldAccess::Shared(_) => None,
        }
    }
}

pub struct UpdateContext<'a> {
    pub world: WorldAccess<'a>,
    pub commands: &'a mut CommandBuffer,
    pub dt: f32,
    pub simulating: bool,
    pub(crate) first: usize,
    pub(crate) count: usize,
}

type UpdateFn<C> = Box<dyn Fn(Components<C>, &mut UpdateContext) + Send + Sync>;
type MessageHandlerFn<C> =
    Box<dyn Fn(&mut C, &mut ComponentCtx, &mut dyn Message) + Send + Sync>;

struct RegisteredUpdate<C: Component> {
    desc: UpdateFunctionDesc,
    run: UpdateFn<C>,
}

/// Owns all components of one concrete type within a world
pub struct ComponentManager<C: Component> {
    storage: ComponentStorage<C>,
    by_owner: AHashMap<GameObjectHandle, SmallVec<[RawHandle; 1]>>,
    pending_init: Vec<RawHandle>,
    updates: Vec<RegisteredUpdate<C>>,
    message_handlers: AHashMap<TypeId, MessageHandlerFn<C>>,
}

impl<C: Component> ComponentManager<C> {
    pub fn new(flavor: StorageType) -> Self {
        Self {
            storage: ComponentStorage::new(flavor),
            by_owner: AHashMap::new(),
            pending_init: Vec::new(),
            updates: Vec::new(),
            message_handlers: AHashMap::new(),
        }
    }

    pub fn register_update_function(
        &mut self,
        desc: UpdateFunctionDesc,
        run: impl Fn(Components<C>, &mut UpdateContext) + Send + Sync + 'static,
    ) {
        self.updates.push(RegisteredUpdate {
            desc,
            run: Box::new(run),
        });
    }

    pub fn add_message_handler<M: Message>(
        &mut self,
        handler: fn(&mut C, &mut ComponentCtx, &mut M),
    ) {
        self.message_handlers.insert(
            TypeId::of::<M>(),
            Box::new(move |component, ctx, message| {
                if let Some(concrete) = message.as_any_mut().downcast_mut::<M>() {
                    handler(component, ctx, concrete);
                }
            }),
        );
    }

    pub(crate) fn insert(
        &mut self,
        owner: GameObjectHandle,
        component: C,
    ) -> ComponentHandle<C> {
        let raw = self.storage.insert(ComponentEntry {
            component,
            owner,
            state: ComponentState::Initializing,
            was_active: false,
            sim_started: false,
        });
        self.by_owner.entry(owner).or_default().push(raw);
        self.pending_init.push(raw);
        TypedHandle::from_raw(raw)
    }

    pub(crate) fn get(&self, handle: ComponentHandle<C>) -> Option<&C> {
        self.storage
            .get(handle.raw())
            .filter(|e| e.state != ComponentState::Dead)
            .map(|e| &e.component)
    }

    pub(crate) fn get_mut(&mut self, handle: ComponentHandle<C>) -> Option<&mut C> {
        self.storage
            .get_mut(handle.raw())
            .filter(|e| e.state != ComponentState::Dead)
            .map(|e| &mut e.component)
    }
}

/// Type-erased manager surface the world drives
pub(crate) trait AnyManager: Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn component_count(&self) -> usize;

    fn update_function_descs(&self) -> Vec<UpdateFunctionDesc>;

    fn run_update(&mut self, name: &str, ctx: &mut UpdateContext);

    /// Initializes and activates pending components, fires
    /// on-simulation-started where due. Returns true when any callback ran
    fn process_pending(
        &mut self,
        data: &mut WorldData,
        commands: &mut CommandBuffer,
        simulating: bool,
    ) -> bool;

    /// Owner's effective active state changed
    fn sync_activation(
        &mut self,
        object: GameObjectHandle,
        active: bool,
        data: &mut WorldData,
        commands: &mut CommandBuffer,
        simulating: bool,
    );

    /// Tears down all components of a (deleted) object
    fn destroy_components_of(
        &mut self,
        object: GameObjectHandle,
        data: &mut WorldData,
        commands: &mut CommandBuffer,
    );

    /// Routes a message to this manager's components on `object`. Returns
    /// true when at least one handler ran
    fn handle_message(
        &mut self,
        object: GameObjectHandle,
        message: &mut dyn Message,
        data: &mut WorldData,
        commands: &mut CommandBuffer,
    ) -> bool;

    /// Whether any component of `object` is still waiting for initialization
    fn has_uninitialized(&self, object: GameObjectHandle) -> bool;
}

impl<C: Component> AnyManager for ComponentManager<C> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn component_count(&self) -> usize {
        self.storage.len()
    }

    fn update_function_descs(&self) -> Vec<UpdateFunctionDesc> {
        self.updates.iter().map(|u| u.desc.clone()).collect()
    }

    fn run_update(&mut self, name: &str, ctx: &mut UpdateContext) {
        let index = match self.updates.iter().position(|u| u.desc.name == name) {
            Some(i) => i,
            None => return,
        };

        let components = Components {
            storage: &mut self.storage,
            first: ctx.first,
            count: ctx.count,
        };
        (self.updates[index].run)(components, ctx);
    }

    fn process_pending(
        &mut self,
        data: &mut WorldData,
        commands: &mut CommandBuffer,
        simulating: bool,
    ) -> bool {
        let mut did_work = false;

        let pending = std::mem::take(&mut self.pending_init);
        for raw in pending {
            let entry = match self.storage.get_mut(raw) {
                Some(e) if e.state == ComponentState::Initializing => e,
                _ => continue,
            };

            let owner = entry.owner;
            let owner_active = data
                .objects()
                .get(owner)
                .map(|o| o.is_active())
                .unwrap_or(false);

            let mut ctx = ComponentCtx {
                owner,
                world: &mut *data,
                commands: &mut *commands,
            };

            entry.state = ComponentState::Initialized;
            entry.component.initialize(&mut ctx);
            did_work = true;

            if owner_active {
                entry.was_active = true;
                entry.component.on_activated(&mut ctx);
            }
        }

        // simulation-start fires once per component, the first update where
        // the world simulates while it is active
        if simulating {
            let mut ctxless: Vec<RawHandle> = Vec::new();
            for (raw, entry) in self.storage.iter_mut() {
                if entry.state == ComponentState::Initialized
                    && entry.was_active
                    && !entry.sim_started
                {
                    ctxless.push(raw);
                }
            }

            for raw in ctxless {
                let entry = match self.storage.get_mut(raw) {
                    Some(e) => e,
                    None => continue,
                };
                entry.sim_started = true;
                let mut ctx = ComponentCtx {
                    owner: entry.owner,
                    world: &mut *data,
                    commands: &mut *commands,
                };
                entry.component.on_simulation_started(&mut ctx);
                did_work = true;
            }
        }

        did_work
    }

    fn sync_activation(
        &mut self,
        object: GameObjectHandle,
        active: bool,
        data: &mut WorldData,
        commands: &mut CommandBuffer,
        simulating: bool,
    ) {
        let handles = match self.by_owner.get(&object) {
            Some(handles) => handles.clone(),
            None => return,
        };

        for raw in handles {
            let entry = match self.storage.get_mut(raw) {
                Some(e) if e.state == ComponentState::Initialized => e,
                _ => continue,
            };
            if entry.was_active == active {
                continue;
            }

            entry.was_active = active;
            let mut ctx = ComponentCtx {
                owner: object,
                world: &mut *data,
                commands: &mut *commands,
            };

            if active {
                entry.component.on_activated(&mut ctx);
                if simulating && !entry.sim_started {
                    entry.sim_started = true;
                    entry.component.on_simulation_started(&mut ctx);
                }
            } else {
                entry.component.on_deactivated(&mut ctx);
            }
        }
    }

    fn destroy_components_of(
        &mut self,
        object: GameObjectHandle,
        data: &mut WorldData,
        commands: &mut CommandBuffer,
    ) {
        let handles = match self.by_owner.remove(&object) {
            Some(handles) => handles,
            None => return,
        };

        for raw in handles {
            let mut entry = match self.storage.remove(raw) {
                Some(e) => e,
                None => continue,
            };
            if entry.state != ComponentState::Initialized {
                continue;
            }

            let mut ctx = ComponentCtx {
                owner: object,
                world: &mut *data,
                commands: &mut *commands,
            };
            if entry.was_active {
                entry.component.on_deactivated(&mut ctx);
            }
            entry.component.deinitialize(&mut ctx);
            entry.state = ComponentState::Dead;
        }
    }

    fn handle_message(
        &mut self,
        object: GameObjectHandle,
        message: &mut dyn Message,
        data: &mut WorldData,
        commands: &mut CommandBuffer,
    ) -> bool {
        let handler = match self.message_handlers.get(&message.as_any().type_id()) {
            Some(h) => h,
            None => return false,
        };

        let handles = match self.by_owner.get(&object) {
            Some(handles) => handles.clone(),
            None => return false,
        };

        let mut handled = false;
        for raw in handles {
            let entry = match self.storage.get_mut(raw) {
                Some(e) if e.state == ComponentState::Initialized => e,
                _ => continue,
            };

            let mut ctx = ComponentCtx {
                owner: object,
                world: &mut *data,
                commands: &mut *commands,
            };
            handler(&mut entry.component, &mut ctx, message);
            handled = true;
        }

        handled
    }

    fn has_uninitialized(&self, object: GameObjectHandle) -> bool {
        match self.by_owner.get(&object) {
            Some(handles) => handles.iter().any(|raw| {
                self.storage
                    .get(*raw)
                    .map(|e| e.state == ComponentState::Initializing)
                    .unwrap_or(false)
            }),
            None => false,
        }
    }
}
