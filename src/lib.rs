//! Sandboxed JavaScript execution in a permission-restricted Deno
//! subprocess.
//!
//! A [`Session`] owns one `deno` worker process and talks to it over
//! newline-delimited JSON on stdin/stdout. Any number of [`Vm`]s —
//! isolated execution contexts — can be bound to a session; calls from
//! concurrent tasks are multiplexed over the single stream pair and
//! matched back by correlation id.
//!
//! ```no_run
//! use deno_vm::{ServerConfig, Session, Vm, VmOptions};
//!
//! # async fn demo() -> deno_vm::Result<()> {
//! // No permissions at all unless granted explicitly.
//! let session = Session::start(Default::default(), &ServerConfig::default()).await?;
//! let vm = Vm::create(&session, VmOptions::default()).await?;
//! assert_eq!(vm.run("1 + 1").await?, 2);
//! vm.destroy().await;
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod permissions;
pub mod protocol;
mod process;
pub mod session;
pub mod vm;

pub use config::ServerConfig;
pub use error::{Result, VmError};
pub use permissions::{Grant, PermissionKind, PermissionSet};
pub use session::{PendingCall, Session};
pub use vm::{ConsoleMode, Vm, VmOptions};
