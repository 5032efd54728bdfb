pub mod configuration;
pub mod cors;
pub mod domain;
pub mod idempotency;
pub mod routes;
pub mod square_client;
pub mod startup;
pub mod telemetry;
pub mod utils;
