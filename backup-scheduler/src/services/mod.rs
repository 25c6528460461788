pub mod backup_scheduler;
pub mod run_queue;
