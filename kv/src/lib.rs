//! `meshkv` is a distributed, partitioned in-memory key/value cache.
//!
//! Keys are distributed across cluster members by consistent-hash
//! affinity; each partition has a primary owner and zero or more backups.
//! Reads can be served from a near cache colocated with the caller, writes
//! go through the owning partition under a pessimistic transaction (or a
//! direct fast path when the caller is already the owner and the cache is
//! configured atomic). Membership changes trigger a DHT-style rebalance
//! that streams only the partitions that moved.
//!
//! ## Getting started
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshkv::cluster::Node;
//! use meshkv::config::CacheConfig;
//! use meshkv::net::transport::local::Registry;
//!
//! # async fn run() -> meshkv::error::CResult<()> {
//! let registry = Registry::new();
//! let transport = Arc::new(registry.register(1).await);
//! let node = Node::new(1, CacheConfig::default(), transport)?;
//!
//! node.put(b"hello".to_vec(), b"world".to_vec()).await?;
//! let value = node.get(b"hello").await?;
//! assert_eq!(value, Some(b"world".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod affinity;
pub mod cluster;
pub mod config;
pub mod encoding;
pub mod entry;
pub mod error;
pub mod eviction;
pub mod near;
pub mod net;
pub mod persist;
pub mod preloader;
pub mod store;
pub mod topology;
pub mod txn;
pub mod version;
