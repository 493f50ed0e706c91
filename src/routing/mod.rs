pub mod bucket;
pub mod table;

pub use bucket::{Bucket, CACHE_CAP, HOME_CAPACITY, K, MIN_FORK_POWER};
pub use table::{MaintenanceAction, RoutingTable};
