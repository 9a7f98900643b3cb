use serde::Deserialize;

#[derive(Deserialize, Clone)]
pub struct Config {
    pub fileserve: Fileserve,
    pub plugins: Plugins,
    pub resources: Resources,
    pub world: World,
}

#[derive(Deserialize, Clone)]
pub struct Fileserve {
    /// Server port, 1042 unless overridden
    pub port: u16,
    /// "host:port" of a known server, tried before discovery
    pub server: Option<String>,
    pub timeout_secs: f32,
    /// Start serving on launch
    pub start: bool,
    /// Seconds a cached file-status answer stays valid
    pub cache_status_ttl_secs: f32,
}

#[derive(Deserialize, Clone)]
pub struct Plugins {
    /// How many numbered copies of a plugin binary to try when load-copy is requested
    pub max_parallel_instances: u32,
}

#[derive(Deserialize, Clone)]
pub struct Resources {
    pub worker_threads: Option<usize>,
}

#[derive(Deserialize, Clone)]
pub struct World {
    /// Complain when a static object is moved during simulation
    pub error_on_static_move: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fileserve: Fileserve {
                port: 1042,
                server: None,
                timeout_secs: 5.0,
                start: false,
                cache_status_ttl_secs: 5.0,
            },
            plugins: Plugins {
                max_parallel_instances: 32,
            },
            resources: Resources {
                worker_threads: None,
            },
            world: World {
                error_on_static_move: true,
            },
        }
    }
}
