//! Test doubles and fixtures for exercising pipelines without a CouchDB server.
//!
//! [`source::MemorySource`] stands in for the change source and
//! [`test_destination_wrapper::TestDestinationWrapper`] observes any destination.

pub mod fixtures;
pub mod source;
pub mod test_destination_wrapper;
