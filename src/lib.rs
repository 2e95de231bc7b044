//! Mobile-money payment request lifecycle and reconciliation engine for
//! micro-insurance premiums.

pub mod api;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
