//! Wire types shared by the imgstash upload client and server.
//!
//! The HTTP surface is conceptual and not externally versioned: these
//! structs describe the JSON bodies exchanged for session creation, chunk
//! acknowledgement, completion and cancellation.

pub mod constants;
pub mod error;
pub mod messages;
pub mod types;

pub use error::{ErrorBody, ErrorKind};
pub use types::SessionStatus;
