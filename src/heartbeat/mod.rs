//! The shard side of the shard/master heartbeat.
//!
//! One heartbeat is one request/response round-trip:
//!
//! 1. [`PacketBuilder`] reads the local store: ids of jobs still in progress,
//!    ids of valid hosts, and finished jobs waiting for upload
//! 2. [`HeartbeatTransport`] carries the packet to the master
//! 3. uploaded jobs are stamped with this shard's id ([`ShardIdentity`])
//! 4. [`ResponseApplier`] writes the hosts and jobs the master sent back
//!
//! The ordering is driven by [`ShardClient`](crate::client::ShardClient).

pub mod identity;
pub mod packet;
pub mod response;
pub mod transport;

pub use identity::ShardIdentity;
pub use packet::{HeartbeatPacket, PacketBuilder};
pub use response::{ApplyReport, HeartbeatResponse, RecordFailure, ResponseApplier};
pub use transport::{HeartbeatTransport, RetryPolicy, RpcTransport};
