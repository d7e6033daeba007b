//! Remote editing sessions.
//!
//! [`SessionManager`] owns the lifecycle, [`SessionRegistry`] is the
//! process-wide table of open sessions and [`SessionProvisioner`] is the
//! backend creating the environments.

mod manager;
mod provisioner;
mod registry;

pub use manager::SessionManager;
pub use provisioner::{LocalIdeProvisioner, ProvisionedEnvironment, SessionProvisioner};
pub use registry::SessionRegistry;
