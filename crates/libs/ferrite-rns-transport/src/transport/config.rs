use rns_core::identity::PrivateIdentity;

// Pathfinder behavior.
pub const PATHFINDER_MAX_HOPS: u8 = 128;
pub const PATHFINDER_RETRIES: u8 = 1;
pub const PATHFINDER_GRACE: f64 = 0.4;
pub const PATHFINDER_RANDOM_WINDOW: f64 = 0.5;

// Table lifetimes, seconds.
pub const DESTINATION_TIMEOUT: f64 = 60.0 * 60.0 * 24.0 * 7.0;
pub const AP_PATH_TIME: f64 = 60.0 * 60.0 * 24.0;
pub const ROAMING_PATH_TIME: f64 = 60.0 * 60.0 * 6.0;
pub const REVERSE_TIMEOUT: f64 = 8.0 * 60.0;
pub const LINK_TIMEOUT: f64 = 60.0 * 15.0;
pub const PATH_REQUEST_TIMEOUT: f64 = 15.0;
pub const PATH_REQUEST_THROTTLE: f64 = 30.0;
/// Minimum interval between locally originated path requests for the same
/// destination.
pub const PATH_REQUEST_MIN_INTERVAL: f64 = 20.0;
pub const TUNNEL_TIMEOUT: f64 = 60.0 * 15.0;

// Job cadence, seconds.
pub const JOB_INTERVAL: f64 = 0.25;
pub const LINKS_CHECK_INTERVAL: f64 = 1.0;
pub const RECEIPTS_CHECK_INTERVAL: f64 = 1.0;
pub const ANNOUNCES_CHECK_INTERVAL: f64 = 1.0;
pub const TABLES_CULL_INTERVAL: f64 = 60.0;

// Fixed table capacities for constrained targets; hosted builds may raise
// them through `TableCapacities`.
pub const MAX_PATHS: usize = 32;
pub const MAX_DESTINATIONS: usize = 32;
pub const MAX_ANNOUNCES: usize = 8;
pub const MAX_HELD_ANNOUNCES: usize = 8;
pub const MAX_REVERSE_ENTRIES: usize = 8;
pub const MAX_LINK_ENTRIES: usize = 8;
pub const MAX_TUNNELS: usize = 16;
pub const MAX_ANNOUNCE_RATE_ENTRIES: usize = 8;
pub const MAX_PATH_REQUEST_THROTTLE: usize = 8;
pub const MAX_DISCOVERY_PATH_REQUESTS: usize = 32;
pub const MAX_LOCAL_PATH_REQUESTS: usize = 32;
pub const MAX_DISCOVERY_TAGS: usize = 32;
pub const PACKET_HASHLIST_SIZE: usize = 64;
pub const MAX_ACTIVE_LINKS: usize = 4;
pub const MAX_PENDING_LINKS: usize = 4;
pub const MAX_LOCAL_CLIENT_INTERFACES: usize = 8;
pub const MAX_CONTROL_HASHES: usize = 8;
pub const MAX_ANNOUNCE_HANDLERS: usize = 8;
pub const MAX_RECEIPTS: usize = 8;
pub const MAX_KNOWN_DESTINATIONS: usize = 32;
pub const MAX_RANDOM_BLOBS: usize = 32;

// Low-memory culling targets.
pub const LOW_MEM_PATH_TARGET: usize = 16;
pub const CRITICAL_MEM_PATH_TARGET: usize = 8;
pub const LOW_MEM_HASHLIST_TARGET: usize = 30;
pub const CRITICAL_MEM_HASHLIST_TARGET: usize = 20;

/// Heap headroom reported by the platform hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressure {
    Normal,
    Low,
    Critical,
}

#[derive(Clone, Copy)]
pub struct TableCapacities {
    pub paths: usize,
    pub announces: usize,
    pub held_announces: usize,
    pub reverse: usize,
    pub links: usize,
    pub tunnels: usize,
    pub hashlist: usize,
    pub receipts: usize,
}

impl Default for TableCapacities {
    fn default() -> Self {
        Self {
            paths: MAX_PATHS,
            announces: MAX_ANNOUNCES,
            held_announces: MAX_HELD_ANNOUNCES,
            reverse: MAX_REVERSE_ENTRIES,
            links: MAX_LINK_ENTRIES,
            tunnels: MAX_TUNNELS,
            hashlist: PACKET_HASHLIST_SIZE,
            receipts: MAX_RECEIPTS,
        }
    }
}

pub struct TransportConfig {
    pub name: String,
    pub identity: PrivateIdentity,
    /// Forward traffic for other nodes and retransmit announces.
    pub transport_enabled: bool,
    pub capacities: TableCapacities,
    /// Platform heap probe; `None` disables memory-driven culling.
    pub memory_pressure: Option<Box<dyn Fn() -> MemoryPressure>>,
}

impl TransportConfig {
    pub fn new(name: &str, identity: PrivateIdentity) -> Self {
        Self {
            name: name.to_string(),
            identity,
            transport_enabled: false,
            capacities: TableCapacities::default(),
            memory_pressure: None,
        }
    }

    pub fn with_transport(mut self, enabled: bool) -> Self {
        self.transport_enabled = enabled;
        self
    }
}
