//! Game-object runtime: handle-addressed objects with cached transforms,
//! typed component managers with phased update scheduling, deferred
//! messaging and a categorized spatial index

mod command;
mod component;
mod handle;
mod message;
mod object;
mod schedule;
mod spatial;
mod world;

pub use command::CommandBuffer;
pub use component::{
    Component, ComponentCtx, ComponentHandle, ComponentManager, ComponentState, Components,
    StorageType, UpdateContext, UpdateFunctionDesc, UpdatePhase, WorldAccess,
};
pub use handle::{HandleTable, RawHandle, TypedHandle};
pub use message::{Message, MessageQueueKind};
pub use object::{GameObject, GameObjectDesc, GameObjectHandle, ObjectStore, TraversalOrder};
pub use schedule::ScheduleError;
pub use spatial::{
    register_category, render_dynamic, render_static, MsgUpdateLocalBounds, QueryParams,
    SpatialCategory, SpatialRecord, VisibilityState,
};
pub use world::{World, WorldData, WorldDesc};
