//! dirsync Core - Domain model and port definitions
//!
//! This crate contains everything the synchronization engine reasons about
//! without touching the network or spawning tasks:
//! - **Configuration** - the YAML file model, defaults, validation and a builder
//! - **Domain types** - `Job`, `Settings`, `RemotePath`, `AssetMetadata`,
//!   `PosixAttributes`, `TaskState`
//! - **Path mapping** - pure functions between local paths and remote namespaces
//! - **Port definitions** - the `RemoteTransport` trait that adapters implement
//!
//! # Architecture
//!
//! The domain module is pure logic over `std` types. The ports module
//! defines the single abstract RPC boundary to the remote store; concrete
//! transports live in `dirsync-remote`, and the engine that drives them
//! lives in `dirsync-sync`.

pub mod config;
pub mod domain;
pub mod ports;
