pub mod retry;
pub mod scheduler;
