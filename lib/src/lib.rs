pub mod cloud;
pub mod config;
pub mod error;
pub mod images;
pub mod openstack;
pub mod puppet;
pub mod remote;
pub mod roles;
pub mod topology;

pub use config::{Role, Topology};
pub use error::{Error, Result};
pub use topology::{DeployOptions, Orchestrator, Outcome};
