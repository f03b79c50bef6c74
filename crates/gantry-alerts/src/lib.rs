//! gantry-alerts — alert and billing sinks for the Gantry control plane.
//!
//! Alert delivery is fire-and-forget: a failed driver is logged and never
//! propagates into the cycle that raised the alert. Drivers are a closed
//! set selected by configuration at startup.

pub mod billing;
pub mod sink;

pub use billing::BillingSink;
pub use sink::{AlertDriver, AlertKind, Alerter};
