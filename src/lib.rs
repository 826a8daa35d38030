pub mod admin;
pub mod auth;
pub mod booking;
pub mod calendar;
pub mod config;
pub mod draft;
pub mod forms;
pub mod limits;
pub mod mail;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod session;
pub mod store;
pub mod wal;
pub mod wire;
