//! Durable replication positions.

pub mod base;
