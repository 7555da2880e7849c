pub mod error;
pub mod fetch;
pub mod provider;
pub mod throttle;
pub mod types;
