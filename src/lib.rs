pub mod api;
pub mod clients;
pub mod config;
pub mod daemons;
pub mod error;
pub mod models;
pub mod schedules;
pub mod utils;
