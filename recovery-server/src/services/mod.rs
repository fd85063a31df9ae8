pub mod mirror_sweeper;
pub mod retention_scheduler;
