//! Change stream sources.

pub mod base;
pub mod couchdb;
