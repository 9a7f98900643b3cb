use std::io::Read;

/// Load progress of a resource's content
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResourceState {
    Unloaded,
    LoadedPartially,
    Loaded,
}

/// What [Resource::unload_data] should release
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Unload {
    AllQualityLevels,
    OneQualityLevel,
}

/// Result of a content update or unload
#[derive(Copy, Clone, Debug)]
pub struct ResourceLoadDesc {
    pub state: ResourceState,
    pub quality_levels_discardable: u8,
    pub quality_levels_loadable: u8,
}

impl ResourceLoadDesc {
    pub fn loaded() -> Self {
        Self {
            state: ResourceState::Loaded,
            quality_levels_discardable: 0,
            quality_levels_loadable: 0,
        }
    }

    pub fn unloaded() -> Self {
        Self {
            state: ResourceState::Unloaded,
            quality_levels_discardable: 0,
            quality_levels_loadable: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct MemoryUsage {
    pub cpu: u64,
    pub gpu: u64,
}

/// A typed, id-addressed asset. Instances start in their Default state and
/// are filled by [update_content](Resource::update_content) on a worker
pub trait Resource: Default + Send + Sync + 'static {
    /// Consumes the loader-provided stream and fills this instance. Runs on
    /// a worker thread; nested loads go through the passed context
    fn update_content(&mut self, stream: &mut dyn Read, ctx: &mut LoadContext) -> ResourceLoadDesc;

    /// Releases memory. Returns the remaining load state
    fn unload_data(&mut self, unload: Unload) -> ResourceLoadDesc;

    fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage::default()
    }
}

/// Opens the data stream a resource's content comes from
pub trait ResourceTypeLoader<T: Resource>: Send + Sync + 'static {
    fn open_data_stream(&self, id: &str) -> std::io::Result<Box<dyn Read + Send>>;
}

impl<T: Resource, F> ResourceTypeLoader<T> for F
where
    F: Fn(&str) -> std::io::Result<Box<dyn Read + Send>> + Send + Sync + 'static,
{
    fn open_data_stream(&self, id: &str) -> std::io::Result<Box<dyn Read + Send>> {
        self(id)
    }
}

/// Handed to [Resource::update_content] so a loading resource can request
/// its dependencies
pub struct LoadContext {
    pub(crate) manager: crate::ResourceManager,
}

impl LoadContext {
    /// The manager driving this load. Blocking acquires of other resources
    /// from here are only honored for whitelisted parent/child type pairs
    pub fn manager(&self) -> &crate::ResourceManager {
        &self.manager
    }
}
