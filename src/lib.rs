//! A pure Rust iSCSI initiator
//!
//! This library issues SCSI commands to a remote iSCSI target and hands back
//! status, sense and data. The protocol engine is single-threaded and
//! reactive: the caller waits on [`IscsiInitiator::get_fd`] for
//! [`IscsiInitiator::which_events`] and feeds the ready events to
//! [`IscsiInitiator::service`]. The same engine rides a TCP stream or an
//! iSER (RDMA) queue pair, chosen once at construction.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_initiator::{IscsiInitiator, ScsiTask};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut initiator = IscsiInitiator::builder()
//!     .initiator_name("iqn.2025-12.local:initiator")
//!     .target_name("iqn.2025-12.local:storage.disk1")
//!     .portal("192.168.1.10:3260")
//!     .chap("user", "secret")
//!     .build()?;
//!
//! initiator.login_sync()?;
//!
//! let task = initiator.scsi_command_sync(ScsiTask::read10(0, 8, 512), 0)?;
//! println!("read {} bytes, status {:?}", task.data().len(), task.status);
//!
//! initiator.logout_sync()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod command;
pub mod error;
pub mod initiator;
pub mod login;
pub mod nop;
pub mod pdu;
pub mod queue;
pub mod reconnect;
pub mod scsi;
pub mod session;
pub mod sync;
pub mod task_mgmt;
pub mod transport;

pub use auth::{AuthConfig, ChapCredentials};
pub use command::WriteSplit;
pub use error::{IscsiError, ScsiResult};
pub use initiator::{InitiatorConfig, IscsiInitiator, IscsiInitiatorBuilder};
pub use login::DiscoveryAddress;
pub use queue::{Outcome, Reply, TaskHandle};
pub use scsi::{CommandStatus, IoVector, ScsiTask, SenseData, XferDir};
pub use session::{DigestPreference, SessionType};
pub use transport::{Events, Transport, TransportKind};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
