//! External command execution for the tunnel control plane.
//!
//! Every external tool this system touches (`awg`, `awg-quick`, `ip`, the
//! firewall scripts) is invoked through [`SafeCommand`]:
//!
//! - **No shell invocation**: programs are spawned directly, never `sh -c`
//! - **Allowlist**: only the programs named in [`AllowedProgram`] can run
//! - **Argument validation**: NUL and line breaks are rejected up front
//! - **Bounded runtime**: a timeout turns a hung tool into a command failure
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), awg_exec::CommandError> {
//! use std::time::Duration;
//! use awg_exec::{AllowedProgram, SafeCommand};
//!
//! let output = SafeCommand::new(AllowedProgram::Awg)
//!     .arg("show")
//!     .arg("wg-a1b2c3")
//!     .timeout(Duration::from_secs(10))
//!     .execute()
//!     .await?;
//! println!("{}", output.stdout_lossy());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod command;
pub mod error;

pub use command::{AllowedProgram, CommandError, CommandOutput, SafeCommand};
pub use error::{ValidationError, ValidationErrorKind};
