//! Deferred world mutations. Structural changes requested from component
//! callbacks and async updates are queued here and applied by the world as
//! soon as the current dispatch step finishes

use crate::message::{Message, MessageQueueKind};
use crate::object::{GameObjectDesc, GameObjectHandle};
use crate::world::World;

pub(crate) type Command = Box<dyn FnOnce(&mut World) + Send>;

#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Queues an arbitrary mutation
    pub fn queue(&mut self, f: impl FnOnce(&mut World) + Send + 'static) {
        self.commands.push(Box::new(f));
    }

    /// Creates an object and hands its handle to the continuation, which
    /// typically attaches components
    pub fn create_object_with(
        &mut self,
        desc: GameObjectDesc,
        f: impl FnOnce(&mut World, GameObjectHandle) + Send + 'static,
    ) {
        self.queue(move |world| {
            let handle = world.create_object(desc);
            f(world, handle);
        });
    }

    pub fn create_object(&mut self, desc: GameObjectDesc) {
        self.queue(move |world| {
            world.create_object(desc);
        });
    }

    pub fn delete_object_delayed(&mut self, handle: GameObjectHandle) {
        self.queue(move |world| world.delete_object_delayed(handle));
    }

    pub fn send_message<M: Message>(&mut self, target: GameObjectHandle, message: M) {
        self.queue(move |world| {
            let mut message = message;
            world.send_message(target, &mut message);
        });
    }

    pub fn post_message<M: Message>(
        &mut self,
        target: GameObjectHandle,
        message: M,
        delay: f64,
        kind: MessageQueueKind,
    ) {
        self.queue(move |world| world.post_message(target, message, delay, kind));
    }

    /// Re-publishes the target's local bounds into the spatial index
    pub fn update_local_bounds(&mut self, target: GameObjectHandle) {
        self.queue(move |world| world.update_local_bounds(target));
    }

    pub(crate) fn append(&mut self, mut other: CommandBuffer) {
        self.commands.append(&mut other.commands);
    }

    pub(crate) fn take(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }
}
