pub mod channel;
pub mod destination;
pub mod iface;
pub mod packet;
pub mod receipt;
pub mod resource;
pub mod storage;
pub mod transport;

pub use crate::destination::link::{Link, LinkStatus};
pub use crate::destination::{DestinationName, SingleInputDestination};
pub use crate::packet::Packet;
pub use crate::transport::{SendOptions, Transport, TransportEvent};
pub use crate::transport::config::TransportConfig;
