pub mod feed;
pub mod shutdown;
