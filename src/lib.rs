pub mod api;
pub mod config;
pub mod controller;
pub mod datum;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
