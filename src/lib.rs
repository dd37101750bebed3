//! Energy dispatch engine for a residential HVAC, solar and battery
//! installation. Sensor reports come in from the field nodes; relay routing
//! and HVAC power commands go back out.

pub mod alerts;
pub mod api;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod domain;
pub mod ingest;
pub mod store;
pub mod telemetry;
pub mod transport;
