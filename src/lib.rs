//! # winrm-client - WS-Management (WinRM) Protocol Core
//!
//! An async client for the WS-Management wire protocol used to query
//! Windows management data (WQL enumeration over WMI) and to execute
//! remote shell commands, including long-running commands whose output
//! streams across many polling cycles.
//!
//! ## Core Concepts
//!
//! - **ConnectionInfo**: immutable description of one target host
//!   (endpoint, credentials, timeouts); copies with overrides support
//!   failover routing
//! - **Enumeration**: the Enumerate/Pull loop that walks a WQL result
//!   set page by page until the server reports end of sequence
//! - **Shell sessions**: server-side remote shells addressed by shell
//!   and command ids, running single-shot or long-running commands
//! - **Counter sessions**: groups of sharded long-running collection
//!   commands managed as one state machine with bounded retry
//! - **Host registry**: process-lifetime memory of unauthorized or
//!   unreachable hosts and of counters a host cannot collect
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      Embedding Application                       │
//! │          (scheduling, persistence, device configuration)         │
//! └──────────────────────────────────────────────────────────────────┘
//!            │                      │                      │
//!            ▼                      ▼                      ▼
//! ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │    Enumerator    │   │      WinRs       │   │  CounterSession  │
//! │ (Enumerate/Pull  │   │ (shell lifecycle,│   │ (sharding, merge,│
//! │      loop)       │   │  receive loops)  │   │  failure budget) │
//! └──────────────────┘   └──────────────────┘   └──────────────────┘
//!            │                      │                      │
//!            └──────────────────────┼──────────────────────┘
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 EnvelopeFactory + Response Parsers               │
//! │      (SOAP construction; tree / event / token XML backends)      │
//! └──────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      WsmanSender / HttpSender                    │
//! │       (reqwest transport, status classification, registry)       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use winrm_client::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> WinRmResult<()> {
//!     let registry = Arc::new(HostRegistry::new());
//!     let info = ConnectionInfo::new("srv1.example.com", Auth::basic("admin", "secret"));
//!
//!     // Enumerate running services.
//!     let enumerator = Enumerator::connect(info.clone(), Arc::clone(&registry))?;
//!     let query = EnumInfo::wmi(r"root\cimv2", "SELECT Name, State FROM Win32_Service");
//!     for service in enumerator.enumerate(&query).await? {
//!         println!("{} is {}", service["Name"], service["State"]);
//!     }
//!
//!     // Run a one-shot command.
//!     let shell = WinRs::connect(info, registry)?;
//!     let response = shell.run_powershell("Get-Date").await?;
//!     println!("{}", response.stdout);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bisect;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod parser;
pub mod registry;
pub mod session;
pub mod shell;
pub mod soap;
pub mod transport;

pub use bisect::{
    detect_and_record, detect_corrupt_counters, CounterProbe, ProbeOutcome, ShellProbe,
};
pub use config::{Auth, ConnectionInfo, TokenSource};
pub use enumerate::{EnumInfo, Enumerator};
pub use error::{WinRmError, WinRmResult};
pub use parser::{EnumerationPage, Instance, ParserKind};
pub use registry::HostRegistry;
pub use session::{CommandBuilder, CounterSession, PluginState, SessionConfig, TypeperfBuilder};
pub use shell::{CommandResponse, LongRunningCommand, WinRs};
pub use soap::{powershell_command, EnvelopeFactory, SignalCode};
pub use transport::{HttpSender, SoapReply, WsmanSender};

pub mod prelude {
    //! Convenient re-exports of the types most callers need.
    //!
    //! # Example
    //!
    //! ```rust,ignore
    //! use winrm_client::prelude::*;
    //! ```

    pub use crate::bisect::{detect_corrupt_counters, CounterProbe, ProbeOutcome};
    pub use crate::config::{Auth, ConnectionInfo};
    pub use crate::enumerate::{EnumInfo, Enumerator};
    pub use crate::error::{WinRmError, WinRmResult};
    pub use crate::parser::{Instance, ParserKind};
    pub use crate::registry::HostRegistry;
    pub use crate::session::{CounterSession, PluginState, SessionConfig, TypeperfBuilder};
    pub use crate::shell::{CommandResponse, WinRs};
}
