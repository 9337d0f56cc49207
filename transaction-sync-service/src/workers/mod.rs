mod scheduler;

pub use scheduler::SyncWorker;
