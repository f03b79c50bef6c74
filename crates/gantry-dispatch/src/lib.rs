//! gantry-dispatch — pushes load-balancer configuration to device workers.
//!
//! The dispatcher turns stored state into UPDATE / DELETE / ARCHIVE job
//! payloads, submits them to the device's queue, and reconciles device and
//! load-balancer statuses from the result. Deleting one load balancer from
//! a device that still hosts others is an UPDATE retaining the rest; a true
//! DELETE only goes out when the device would be left empty.

pub mod dispatcher;
pub mod error;
pub mod payload;

pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult};
