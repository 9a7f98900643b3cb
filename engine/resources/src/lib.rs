//! Asynchronous typed-resource management: id-addressed handles, background
//! loading on a worker runtime, scoped ref-counted access, quality levels
//! and reload

mod handle;
mod resource;

pub use handle::{AcquireMode, AcquireResult, ResourceHandle, ResourceLock};
pub use resource::{
    LoadContext, MemoryUsage, Resource, ResourceLoadDesc, ResourceState, ResourceTypeLoader,
    Unload,
};

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use common::*;
use parking_lot::Mutex;

use handle::Entry;

thread_local! {
    /// Types currently running update_content on this thread, innermost last
    static CURRENT_LOADS: RefCell<Vec<TypeId>> = RefCell::new(Vec::new());
}

trait RegistryOps: Any + Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn reload_all(&self, manager: &ResourceManager) -> usize;

    fn free_unused(&self) -> usize;
}

struct Registry<T: Resource> {
    by_id: AHashMap<String, Arc<Entry<T>>>,
    loader: Option<Arc<dyn ResourceTypeLoader<T>>>,
}

impl<T: Resource> Default for Registry<T> {
    fn default() -> Self {
        Self {
            by_id: AHashMap::new(),
            loader: None,
        }
    }
}

impl<T: Resource> RegistryOps for Registry<T> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn reload_all(&self, manager: &ResourceManager) -> usize {
        let mut reloaded = 0;
        for entry in self.by_id.values() {
            let was_loaded = {
                let mut meta = entry.meta.lock();
                let was = meta.state != ResourceState::Unloaded;
                if was {
                    entry.payload.write().unload_data(Unload::AllQualityLevels);
                    meta.state = ResourceState::Unloaded;
                }
                was
            };

            if was_loaded {
                manager.spawn_load(Arc::clone(entry), self.loader.clone());
                reloaded += 1;
            }
        }
        reloaded
    }

    fn free_unused(&self) -> usize {
        let mut freed = 0;
        for entry in self.by_id.values() {
            let mut meta = entry.meta.lock();
            if entry.refcount.load(Ordering::SeqCst) == 0
                && !meta.loading
                && meta.state != ResourceState::Unloaded
            {
                let desc = entry.payload.write().unload_data(Unload::AllQualityLevels);
                meta.state = desc.state;
                meta.quality_levels_discardable = desc.quality_levels_discardable;
                meta.quality_levels_loadable = desc.quality_levels_loadable;
                freed += 1;
            }
        }
        freed
    }
}

struct Inner {
    registries: Mutex<AHashMap<TypeId, Box<dyn RegistryOps>>>,
    nested_whitelist: Mutex<AHashSet<(TypeId, TypeId)>>,
    runtime: tokio::runtime::Runtime,
}

/// The resource manager. Clones share the same state
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    pub fn new() -> Self {
        let workers = config::get_or_defaults()
            .resources
            .worker_threads
            .unwrap_or(2)
            .max(2); // nested blocking loads need a second worker

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name_fn(|| {
                use std::sync::atomic::AtomicUsize;
                static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
                let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
                format!("res-worker-{}", id)
            })
            .enable_time()
            .build()
            .expect("failed to start resource worker runtime");

        Self {
            inner: Arc::new(Inner {
                registries: Mutex::new(AHashMap::new()),
                nested_whitelist: Mutex::new(AHashSet::new()),
                runtime,
            }),
        }
    }

    fn with_registry<T: Resource, R>(&self, f: impl FnOnce(&mut Registry<T>) -> R) -> R {
        let mut registries = self.inner.registries.lock();
        let registry = registries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Registry::<T>::default()));
        let registry = registry
            .as_any_mut()
            .downcast_mut::<Registry<T>>()
            .expect("registry type mismatch");
        f(registry)
    }

    pub fn set_resource_type_loader<T: Resource>(
        &self,
        loader: impl ResourceTypeLoader<T>,
    ) {
        self.with_registry::<T, _>(|registry| {
            registry.loader = Some(Arc::new(loader));
        });
    }

    /// Allows a resource of type `Parent` to synchronously block on loading
    /// a `Child` from within its update_content
    pub fn allow_resource_type_acquire_during_update_content<Parent: Resource, Child: Resource>(
        &self,
    ) {
        self.inner
            .nested_whitelist
            .lock()
            .insert((TypeId::of::<Parent>(), TypeId::of::<Child>()));
    }

    /// Finds or creates the resource with this id. The first request fixes
    /// the id; no loading is triggered yet
    pub fn load_resource<T: Resource>(&self, id: &str) -> ResourceHandle<T> {
        let entry = self.with_registry::<T, _>(|registry| {
            Arc::clone(
                registry
                    .by_id
                    .entry(id.to_owned())
                    .or_insert_with(|| Entry::new(id.to_owned())),
            )
        });
        ResourceHandle { entry }
    }

    /// Starts loading in the background if the content is not there yet
    pub fn preload<T: Resource>(&self, handle: &ResourceHandle<T>) {
        self.trigger_load::<T>(&handle.entry);
    }

    fn loader_for<T: Resource>(&self) -> Option<Arc<dyn ResourceTypeLoader<T>>> {
        self.with_registry::<T, _>(|registry| registry.loader.clone())
    }

    fn trigger_load<T: Resource>(&self, entry: &Arc<Entry<T>>) {
        {
            let mut meta = entry.meta.lock();
            if meta.loading || meta.state == ResourceState::Loaded {
                return;
            }
            meta.loading = true;
            meta.missing = false;
        }

        self.spawn_load(Arc::clone(entry), self.loader_for::<T>());
    }

    fn spawn_load<T: Resource>(
        &self,
        entry: Arc<Entry<T>>,
        loader: Option<Arc<dyn ResourceTypeLoader<T>>>,
    ) {
        {
            // reload path arrives without the loading flag set
            let mut meta = entry.meta.lock();
            meta.loading = true;
            meta.missing = false;
        }

        let manager = self.clone();
        self.inner.runtime.spawn(async move {
            manager.run_load(entry, loader);
        });
    }

    /// The actual load, on a worker thread
    fn run_load<T: Resource>(
        &self,
        entry: Arc<Entry<T>>,
        loader: Option<Arc<dyn ResourceTypeLoader<T>>>,
    ) {
        let stream = match &loader {
            Some(loader) => loader.open_data_stream(&entry.id),
            None => {
                warn!("no resource type loader registered"; "id" => &entry.id);
                Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no loader",
                ))
            }
        };

        match stream {
            Ok(mut stream) => {
                let desc = {
                    let mut ctx = LoadContext {
                        manager: self.clone(),
                    };

                    CURRENT_LOADS.with(|loads| loads.borrow_mut().push(TypeId::of::<T>()));
                    let desc = entry
                        .payload
                        .write()
                        .update_content(stream.as_mut(), &mut ctx);
                    CURRENT_LOADS.with(|loads| {
                        loads.borrow_mut().pop();
                    });
                    desc
                };

                let mut meta = entry.meta.lock();
                meta.state = desc.state;
                meta.quality_levels_discardable = desc.quality_levels_discardable;
                meta.quality_levels_loadable = desc.quality_levels_loadable;
                meta.loading = false;
                meta.missing = false;
            }
            Err(e) => {
                debug!("resource load failed"; "id" => &entry.id, "error" => %e);
                let mut meta = entry.meta.lock();
                meta.state = ResourceState::Unloaded;
                meta.loading = false;
                meta.missing = true;
            }
        }

        entry.loaded_cond.notify_all();
    }

    /// Scoped acquire. Increments the ref count until the returned lock
    /// drops
    pub fn acquire<T: Resource>(
        &self,
        handle: &ResourceHandle<T>,
        mode: AcquireMode,
    ) -> ResourceLock<T> {
        let entry = &handle.entry;

        match mode {
            AcquireMode::PointerOnly => {}
            AcquireMode::AllowLoadingFallback => self.trigger_load::<T>(entry),
            AcquireMode::BlockTillLoaded | AcquireMode::NoFallback => {
                // a blocking acquire from inside another resource's load is
                // only honored for whitelisted type pairs
                let parent = CURRENT_LOADS.with(|loads| loads.borrow().last().copied());
                let may_block = match parent {
                    Some(parent_type) => self
                        .inner
                        .nested_whitelist
                        .lock()
                        .contains(&(parent_type, TypeId::of::<T>())),
                    None => true,
                };

                self.trigger_load::<T>(entry);
                if may_block {
                    let mut meta = entry.meta.lock();
                    while meta.state != ResourceState::Loaded && !meta.missing {
                        entry.loaded_cond.wait(&mut meta);
                    }
                }
            }
        }

        let result = {
            let meta = entry.meta.lock();
            if meta.state == ResourceState::Loaded {
                AcquireResult::Final
            } else if meta.missing {
                match mode {
                    AcquireMode::NoFallback => AcquireResult::Missing,
                    _ => AcquireResult::MissingFallback,
                }
            } else {
                AcquireResult::LoadingFallback
            }
        };

        entry.refcount.fetch_add(1, Ordering::SeqCst);
        ResourceLock {
            guard: entry.payload.read_arc(),
            entry: Arc::clone(entry),
            result,
        }
    }

    /// Unloads content of every resource nobody holds a lock on. Returns how
    /// many were collected
    pub fn free_all_unused_resources(&self) -> usize {
        let registries = self.inner.registries.lock();
        registries.values().map(|r| r.free_unused()).sum()
    }

    /// Marks every loaded resource dirty and re-enters the loading pipeline.
    /// Handles stay valid throughout
    pub fn reload_all_resources(&self) -> usize {
        let registries = self.inner.registries.lock();
        let total: usize = registries.values().map(|r| r.reload_all(self)).sum();
        info!("reloading resources"; "count" => total);
        total
    }

    /// Blocks the calling thread until no load is in flight for the handle
    pub fn wait_for<T: Resource>(&self, handle: &ResourceHandle<T>) {
        let mut meta = handle.entry.meta.lock();
        while meta.loading {
            handle.entry.loaded_cond.wait(&mut meta);
        }
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct BlobResource {
        bytes: Vec<u8>,
    }

    impl Resource for BlobResource {
        fn update_content(
            &mut self,
            stream: &mut dyn Read,
            _ctx: &mut LoadContext,
        ) -> ResourceLoadDesc {
            self.bytes.clear();
            stream.read_to_end(&mut self.bytes).ok();
            ResourceLoadDesc::loaded()
        }

        fn unload_data(&mut self, _unload: Unload) -> ResourceLoadDesc {
            self.bytes = Vec::new();
            ResourceLoadDesc::unloaded()
        }

        fn memory_usage(&self) -> MemoryUsage {
            MemoryUsage {
                cpu: self.bytes.len() as u64,
                gpu: 0,
            }
        }
    }

    static LOAD_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn counting_loader(id: &str) -> std::io::Result<Box<dyn Read + Send>> {
        LOAD_COUNT.fetch_add(1, Ordering::SeqCst);
        if id.starts_with("missing") {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "nope"));
        }
        Ok(Box::new(std::io::Cursor::new(
            format!("content of {}", id).into_bytes(),
        )))
    }

    #[test]
    fn blocking_acquire_loads_content() {
        common::logging::for_tests();
        let manager = ResourceManager::new();
        manager.set_resource_type_loader::<BlobResource>(counting_loader);

        let handle = manager.load_resource::<BlobResource>("a.blob");
        assert_eq!(handle.state(), ResourceState::Unloaded);

        let lock = manager.acquire(&handle, AcquireMode::BlockTillLoaded);
        assert_eq!(lock.acquire_result(), AcquireResult::Final);
        assert_eq!(lock.bytes, b"content of a.blob");
    }

    #[test]
    fn same_id_resolves_to_the_same_resource() {
        common::logging::for_tests();
        let manager = ResourceManager::new();
        manager.set_resource_type_loader::<BlobResource>(counting_loader);

        let a = manager.load_resource::<BlobResource>("same.blob");
        let b = manager.load_resource::<BlobResource>("same.blob");
        assert_eq!(a, b);
        assert_eq!(a.id(), "same.blob");
    }

    #[test]
    fn missing_resources_report_fallback_states() {
        common::logging::for_tests();
        let manager = ResourceManager::new();
        manager.set_resource_type_loader::<BlobResource>(counting_loader);

        let handle = manager.load_resource::<BlobResource>("missing.blob");

        let lock = manager.acquire(&handle, AcquireMode::BlockTillLoaded);
        assert_eq!(lock.acquire_result(), AcquireResult::MissingFallback);
        drop(lock);

        let lock = manager.acquire(&handle, AcquireMode::NoFallback);
        assert_eq!(lock.acquire_result(), AcquireResult::Missing);
    }

    #[test]
    fn locks_pin_resources_against_collection() {
        common::logging::for_tests();
        let manager = ResourceManager::new();
        manager.set_resource_type_loader::<BlobResource>(counting_loader);

        let handle = manager.load_resource::<BlobResource>("pinned.blob");
        let lock = manager.acquire(&handle, AcquireMode::BlockTillLoaded);
        assert_eq!(handle.ref_count(), 1);

        assert_eq!(manager.free_all_unused_resources(), 0);
        assert_eq!(handle.state(), ResourceState::Loaded);

        drop(lock);
        assert_eq!(handle.ref_count(), 0);
        assert_eq!(manager.free_all_unused_resources(), 1);
        assert_eq!(handle.state(), ResourceState::Unloaded);
    }

    #[test]
    fn reload_keeps_handles_valid() {
        common::logging::for_tests();
        let manager = ResourceManager::new();
        manager.set_resource_type_loader::<BlobResource>(counting_loader);

        let handle = manager.load_resource::<BlobResource>("reload.blob");
        drop(manager.acquire(&handle, AcquireMode::BlockTillLoaded));

        let before = LOAD_COUNT.load(Ordering::SeqCst);
        assert_eq!(manager.reload_all_resources(), 1);
        manager.wait_for(&handle);

        assert!(LOAD_COUNT.load(Ordering::SeqCst) > before);
        let lock = manager.acquire(&handle, AcquireMode::BlockTillLoaded);
        assert_eq!(lock.acquire_result(), AcquireResult::Final);
        assert_eq!(lock.bytes, b"content of reload.blob");
    }

    // -----------------------------------------------------------------
    // nested loads

    /// Takes a noticeable moment to load, so a parent that does not block
    /// observably sees it unfinished
    fn slow_loader(id: &str) -> std::io::Result<Box<dyn Read + Send>> {
        std::thread::sleep(std::time::Duration::from_millis(300));
        Ok(Box::new(std::io::Cursor::new(
            format!("slow content of {}", id).into_bytes(),
        )))
    }

    #[derive(Default)]
    struct ParentResource {
        child: Option<ResourceHandle<BlobResource>>,
        child_was_final: bool,
    }

    impl Resource for ParentResource {
        fn update_content(
            &mut self,
            _stream: &mut dyn Read,
            ctx: &mut LoadContext,
        ) -> ResourceLoadDesc {
            let manager = ctx.manager().clone();
            let child = manager.load_resource::<BlobResource>("child.blob");
            let lock = manager.acquire(&child, AcquireMode::BlockTillLoaded);
            self.child_was_final = lock.acquire_result() == AcquireResult::Final;
            drop(lock);
            self.child = Some(child);
            ResourceLoadDesc::loaded()
        }

        fn unload_data(&mut self, _unload: Unload) -> ResourceLoadDesc {
            self.child = None;
            ResourceLoadDesc::unloaded()
        }
    }

    #[test]
    fn whitelisted_nested_loads_block_inline() {
        common::logging::for_tests();
        let manager = ResourceManager::new();
        manager.set_resource_type_loader::<BlobResource>(slow_loader);
        manager.set_resource_type_loader::<ParentResource>(counting_loader);
        manager.allow_resource_type_acquire_during_update_content::<ParentResource, BlobResource>();

        let handle = manager.load_resource::<ParentResource>("parent.blob");
        let lock = manager.acquire(&handle, AcquireMode::BlockTillLoaded);
        assert_eq!(lock.acquire_result(), AcquireResult::Final);
        assert!(lock.child_was_final, "whitelisted child must load inline");
    }

    #[test]
    fn non_whitelisted_nested_loads_stay_async() {
        common::logging::for_tests();
        let manager = ResourceManager::new();
        manager.set_resource_type_loader::<BlobResource>(slow_loader);
        manager.set_resource_type_loader::<ParentResource>(counting_loader);
        // note: no whitelist entry

        let handle = manager.load_resource::<ParentResource>("parent2.blob");
        let lock = manager.acquire(&handle, AcquireMode::BlockTillLoaded);
        assert_eq!(lock.acquire_result(), AcquireResult::Final);
        assert!(
            !lock.child_was_final,
            "non-whitelisted child must not block the parent load"
        );

        // the child still finishes asynchronously
        let child = manager.load_resource::<BlobResource>("child.blob");
        manager.wait_for(&child);
        assert_eq!(child.state(), ResourceState::Loaded);
    }
}
