//! Kernel session orchestration.
//!
//! Provides:
//! - `Session` - binds the channel sockets and drives the poll loop
//! - `SessionWorker` - the thread that runs queued execute requests
//! - `SessionOptions` - connection-file configuration
//! - `DisplayFormatter` / `MimeFormatter` - result rendering
//! - `Heartbeat` - the liveness echo channel

pub mod display;
pub mod heartbeat;
pub mod options;
pub mod session;
pub mod worker;

pub use display::{DisplayFormatter, MimeFormatter};
pub use heartbeat::Heartbeat;
pub use options::{OptionsError, SessionOptions};
pub use session::{Session, SessionEndpoints, SessionError};
pub use worker::{PublishQueue, SessionTask, SessionWorker, TaskQueue};
