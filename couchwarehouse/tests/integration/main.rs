#[path = "../common/mod.rs"]
mod common;

mod pipeline_test;
mod postgres_destination_test;
mod sqlite_destination_test;
