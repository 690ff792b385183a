//! Process-wide serving layer.
//!
//! - **`router`**: Path-prefix table mapping requests to shared handlers
//! - **`worker`**: One single-threaded reactor per OS thread, each owning
//!   a disjoint shard of connections
//! - **`daemon`**: Listener, round-robin sharding and graceful shutdown

pub mod daemon;
pub mod router;
pub mod worker;
