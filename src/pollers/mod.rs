//! The acquire and publish halves of the two sensor tasks.

pub mod environment;
pub mod location;

pub use environment::EnvironmentPoller;
pub use location::{LocationPoller, Sighting};
