use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};

use crate::resource::{Resource, ResourceState};

pub(crate) struct Meta {
    pub state: ResourceState,
    pub quality_levels_discardable: u8,
    pub quality_levels_loadable: u8,
    pub loading: bool,
    pub missing: bool,
}

pub(crate) struct Entry<T> {
    pub id: String,
    pub payload: Arc<RwLock<T>>,
    pub meta: Mutex<Meta>,
    pub loaded_cond: Condvar,
    pub refcount: AtomicU32,
    pub priority: AtomicI32,
}

impl<T: Resource> Entry<T> {
    pub fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            payload: Arc::new(RwLock::new(T::default())),
            meta: Mutex::new(Meta {
                state: ResourceState::Unloaded,
                quality_levels_discardable: 0,
                quality_levels_loadable: 0,
                loading: false,
                missing: false,
            }),
            loaded_cond: Condvar::new(),
            refcount: AtomicU32::new(0),
            priority: AtomicI32::new(0),
        })
    }
}

/// Cheap, copyable reference to a resource. Holding a handle alone does not
/// pin content in memory; acquiring a [ResourceLock] does
pub struct ResourceHandle<T: Resource> {
    pub(crate) entry: Arc<Entry<T>>,
}

impl<T: Resource> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<T: Resource> PartialEq for ResourceHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}
impl<T: Resource> Eq for ResourceHandle<T> {}

impl<T: Resource> std::fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.entry.id)
            .finish()
    }
}

impl<T: Resource> ResourceHandle<T> {
    pub fn id(&self) -> &str {
        &self.entry.id
    }

    pub fn state(&self) -> ResourceState {
        self.entry.meta.lock().state
    }

    pub fn ref_count(&self) -> u32 {
        self.entry.refcount.load(Ordering::SeqCst)
    }

    pub fn set_priority(&self, priority: i32) {
        self.entry.priority.store(priority, Ordering::SeqCst);
    }

    pub fn priority(&self) -> i32 {
        self.entry.priority.load(Ordering::SeqCst)
    }

    pub fn quality_levels(&self) -> (u8, u8) {
        let meta = self.entry.meta.lock();
        (
            meta.quality_levels_discardable,
            meta.quality_levels_loadable,
        )
    }
}

/// How an acquire behaves when the content is not loaded yet
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AcquireMode {
    /// Just the pointer, no loading triggered
    PointerOnly,
    /// Block until loaded; failed loads still hand out the (empty) instance
    BlockTillLoaded,
    /// Kick off loading and return immediately; the lock may see fallback
    /// content
    AllowLoadingFallback,
    /// Block until the load succeeds or definitively fails
    NoFallback,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AcquireResult {
    /// The real, fully loaded content
    Final,
    /// Content still loading, fallback handed out
    LoadingFallback,
    /// Load failed, fallback handed out
    MissingFallback,
    /// Load failed and the caller wanted no fallback
    Missing,
}

/// Scoped read access to a resource. Holds a strong reference for its
/// lifetime, releasing it on drop
pub struct ResourceLock<T: Resource> {
    pub(crate) guard: ArcRwLockReadGuard<RawRwLock, T>,
    pub(crate) entry: Arc<Entry<T>>,
    pub(crate) result: AcquireResult,
}

impl<T: Resource> ResourceLock<T> {
    pub fn acquire_result(&self) -> AcquireResult {
        self.result
    }
}

impl<T: Resource> std::ops::Deref for ResourceLock<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: Resource> Drop for ResourceLock<T> {
    fn drop(&mut self) {
        self.entry.refcount.fetch_sub(1, Ordering::SeqCst);
    }
}
