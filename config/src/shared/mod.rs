mod base;
mod batch;
mod connection;
mod destination;
mod pipeline;
mod replicator;
mod source;

pub use base::*;
pub use batch::*;
pub use connection::*;
pub use destination::*;
pub use pipeline::*;
pub use replicator::*;
pub use source::*;
