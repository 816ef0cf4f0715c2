use std::future::Future;

use crate::destination::base::sanitize_identifier;
use crate::error::EtlResult;
use crate::types::SequenceToken;

/// Name of the table or index holding replication checkpoints.
pub const CHECKPOINT_TABLE_NAME: &str = "couchwarehouse_checkpoints";

/// Returns the key under which the checkpoint of `database` is stored.
///
/// The key is the database name reduced to the characters allowed in a target name, so it is
/// shared by every target the database is split into.
pub fn checkpoint_key_for(database: &str) -> String {
    sanitize_identifier(database)
}

/// Durable storage for the last fully applied position of a change stream.
///
/// Checkpoints live next to the replicated data so that both are lost or kept together.
pub trait CheckpointStore {
    /// Records `token` as the position to resume `key` from.
    fn write_checkpoint(
        &self,
        key: &str,
        token: &SequenceToken,
    ) -> impl Future<Output = EtlResult<()>> + Send;

    /// Returns the most recent position recorded for `key`, if any.
    fn read_checkpoint(
        &self,
        key: &str,
    ) -> impl Future<Output = EtlResult<Option<SequenceToken>>> + Send;
}
