mod record;
mod store;

pub use record::{ConnectionState, DriverRecord, Quality, TagSample, Value, WriteCommand};
pub use store::Snapshot;
