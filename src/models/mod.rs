pub mod event;
pub mod health;
pub mod retry;
pub mod schedule;
pub mod topology;
