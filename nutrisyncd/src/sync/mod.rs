pub mod connectivity;
pub mod delivery;
pub mod events;
pub mod gallery;
pub mod local_watcher;
pub mod pending;
pub mod pipeline;
pub mod retry;

use time::OffsetDateTime;

pub(crate) fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
