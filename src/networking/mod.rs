//! Pluggable peer-to-peer (P2P) networking.

pub mod network;

pub mod messages;

pub mod receiving;

pub mod sending;

pub mod worker_pool;
