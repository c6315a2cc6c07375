//! Rebuilding engine state from the request log.
//!
//! All engine state is in memory. On startup the request stream is replayed through
//! `handle` with each entry's own timestamp as logical time, so a replay produces the same
//! ledger, books and position ids as the original run. Responses are discarded.
//!
//! Only the retained window can be replayed. Once the stream has been trimmed the rebuilt
//! ledger can differ from the live one; an exact restart past the retention limit needs a
//! state snapshot taken before the trimmed entries went away.

use super::core::Engine;
use crate::broker::{BrokerError, EntryId, EventLog};
use crate::message::decode_request;
use crate::types::Timestamp;
use tracing::{debug, info, warn};

/// Logical time of a stream entry: the millisecond part of its id.
pub fn entry_time(id: EntryId) -> Timestamp {
    Timestamp::from_millis(i64::try_from(id.ms).unwrap_or(i64::MAX))
}

/// What a rebuild replayed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    /// Id of the last entry applied, if any.
    pub last_applied: Option<EntryId>,
    pub applied: usize,
    /// Undecodable entries passed over.
    pub skipped: usize,
    /// Entries trimmed from the stream before the replay started.
    pub trimmed: u64,
}

impl Engine {
    /// Replays every retained entry of `stream`.
    pub async fn rebuild(
        &mut self,
        log: &dyn EventLog,
        stream: &str,
        batch_size: usize,
    ) -> Result<RebuildSummary, BrokerError> {
        self.rebuild_through(log, stream, None, batch_size).await
    }

    /// Replays retained entries of `stream` up to and including `through`.
    ///
    /// Entries that do not decode are skipped; they stay on the group's pending list and the
    /// dispatcher's poison handling deals with them.
    pub async fn rebuild_through(
        &mut self,
        log: &dyn EventLog,
        stream: &str,
        through: Option<EntryId>,
        batch_size: usize,
    ) -> Result<RebuildSummary, BrokerError> {
        let info = log.info(stream).await?;
        let mut summary = RebuildSummary {
            trimmed: info.trimmed(),
            ..RebuildSummary::default()
        };
        if summary.trimmed > 0 {
            warn!(
                stream,
                trimmed = summary.trimmed,
                first_retained = ?info.first_id.map(|id| id.to_string()),
                "request stream was trimmed; rebuilding from partial history"
            );
        }

        let mut cursor = EntryId::ZERO;
        'read: loop {
            let batch = log.read_after(stream, cursor, batch_size.max(1), None).await?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                if through.is_some_and(|through| entry.id > through) {
                    break 'read;
                }
                cursor = entry.id;
                match decode_request(&entry) {
                    Ok(envelope) => {
                        self.handle(envelope, entry_time(entry.id));
                        summary.last_applied = Some(entry.id);
                        summary.applied += 1;
                    }
                    Err(err) => {
                        debug!(entry_id = %entry.id, error = %err, "skipping undecodable entry during rebuild");
                        summary.skipped += 1;
                    }
                }
            }
        }

        info!(
            stream,
            applied = summary.applied,
            skipped = summary.skipped,
            last_applied = ?summary.last_applied.map(|id| id.to_string()),
            users = self.ledger.users().count(),
            open_positions = self.positions.open_count(),
            "engine state rebuilt"
        );
        Ok(summary)
    }
}
