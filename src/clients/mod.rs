pub mod database;
pub mod health;
pub mod listener;
pub mod rbmq;
