use std::sync::Arc;

use common::*;

/// Broadcast whenever a plugin is (un)loaded
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PluginEvent {
    /// Shortly before a new plugin is loaded
    BeforeLoading { plugin: String },
    /// Immediately after load, before initialization (which may pull in more plugins)
    AfterLoadingBeforeInit { plugin: String },
    /// After a plugin has been loaded and initialized
    AfterLoading { plugin: String },
    /// Before a plugin is unloaded
    BeforeUnloading { plugin: String },
    /// Engine shutdown hooks run during unload
    StartupShutdown,
    /// Resource cleanup point after shutdown hooks
    AfterStartupShutdown,
    /// After a plugin has been unloaded
    AfterUnloading { plugin: String },
    /// Once before a batch of plugin changes
    BeforePluginChanges,
    /// Once after a batch of plugin changes
    AfterPluginChanges,
}

slog_kv_debug!(PluginEvent, "event");

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Arc<dyn Fn(&PluginEvent) + Send + Sync>;

#[derive(Default)]
struct EventBus {
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_id: u64,
}

lazy_static! {
    static ref BUS: parking_lot::Mutex<EventBus> = parking_lot::Mutex::new(EventBus::default());
}

pub fn subscribe(subscriber: impl Fn(&PluginEvent) + Send + Sync + 'static) -> SubscriptionId {
    let mut bus = BUS.lock();
    bus.next_id += 1;
    let id = SubscriptionId(bus.next_id);
    bus.subscribers.push((id, Arc::new(subscriber)));
    id
}

pub fn unsubscribe(id: SubscriptionId) {
    BUS.lock().subscribers.retain(|(sub_id, _)| *sub_id != id);
}

/// Copy-on-broadcast: the subscriber list is snapshotted so callbacks may
/// (un)subscribe or load plugins without deadlocking the bus
pub(crate) fn broadcast(event: &PluginEvent) {
    trace!("plugin event"; "event" => ?event);

    let snapshot: Vec<Subscriber> = BUS
        .lock()
        .subscribers
        .iter()
        .map(|(_, sub)| Arc::clone(sub))
        .collect();

    for subscriber in snapshot {
        subscriber(event);
    }
}
