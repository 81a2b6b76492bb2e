//! Operational HTTP surface.

pub mod health;

pub use health::HealthServer;
