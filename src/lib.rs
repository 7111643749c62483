pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod ops;
pub mod oracle;
pub mod payment;
pub mod quote;
pub mod registry;
pub mod scheduler;
pub mod telemetry;
pub mod wallet;
