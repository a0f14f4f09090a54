pub mod actor;
pub mod config;
pub mod error;
pub mod guards;
pub mod logging;
pub mod market;
pub mod notify;
pub mod pipeline;
pub mod rbac;
pub mod service;
pub mod store;
pub mod trade;
pub mod utils;
