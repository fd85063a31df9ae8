pub mod dataset;
pub mod record;
pub mod stats;

pub use dataset::{BackupPayload, Dataset, DatasetDiff, Document};
pub use record::{
    normalize_records, BackupRecord, BackupStatus, BackupType, MetadataSource, RecordFilter,
};
pub use stats::{BlobStats, LedgerStats, PrimaryStats, StorageStats};
