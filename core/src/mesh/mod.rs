//! Mesh growth: control protocol, brokered introductions and the scheduler

pub mod protocol;
pub mod proxy;
pub mod scheduler;

pub use protocol::MeshMessage;
pub use proxy::{send_main, MeshError, ProxyRelationTable, ProxyRelayCoordinator};
pub use scheduler::{should_request, MeshGrowthScheduler};
