//! Blue-green deployment subsystem: the container driver seam and the
//! controller that drives a hostname's blue/green pair through it.

pub mod controller;
pub mod driver;

pub use controller::{Controller, ControllerTiming, DeployError};
pub use driver::{ContainerDriver, ContainerStatus, DriverError, MockDriver};
