//! Guest container service - shared code for host and guest
//!
//! This crate contains the request model, error types, path layouts and
//! constants used on both sides of the host-guest boundary.

pub mod constants;
pub mod errors;
pub mod layout;
pub mod settings;
pub mod transport;

pub use errors::{ErrorKind, GcsError, GcsResult, ResultExt};
pub use settings::{ModifySettingRequest, RequestType, ResourceSettings, ResourceType};
pub use transport::Transport;
