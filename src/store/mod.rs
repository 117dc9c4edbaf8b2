//! On-disk state: per-session message logs and the shared record document.

mod atomic;
mod message_log;
mod records;

pub(crate) use atomic::{write_atomic, write_atomic_sync};
pub use message_log::{MessageLog, read_messages, read_messages_sync};
pub use records::{JsonRecordStore, MemoryRecordStore, RecordStore, SessionRecord};
