//! Sample records and their storage.
pub mod sample;
pub mod storage;

pub use sample::Sample;
#[cfg(feature = "storage_csv")]
pub use storage::CsvSink;
pub use storage::{MemorySink, SampleSink};
