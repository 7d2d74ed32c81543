//! A pure Rust iSCSI target server
//!
//! This library accepts iSCSI initiator connections over TCP, negotiates
//! login, tracks sessions and connections, and forwards SCSI commands to a
//! storage backend. Users implement the `ScsiBlockDevice` trait for simple
//! block storage, or `ScsiBackend` to execute raw CDBs themselves.
//!
//! # Example
//!
//! ```no_run
//! use iscsi_target::{IscsiServer, IscsiTarget, ScsiBlockDevice, ScsiResult};
//!
//! struct MyStorage {
//!     data: Vec<u8>,
//! }
//!
//! impl ScsiBlockDevice for MyStorage {
//!     fn read(&self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>> {
//!         let offset = (lba * block_size as u64) as usize;
//!         let len = (blocks * block_size) as usize;
//!         Ok(self.data[offset..offset + len].to_vec())
//!     }
//!
//!     fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()> {
//!         let offset = (lba * block_size as u64) as usize;
//!         self.data[offset..offset + data.len()].copy_from_slice(data);
//!         Ok(())
//!     }
//!
//!     fn capacity(&self) -> u64 {
//!         (self.data.len() / 512) as u64
//!     }
//!
//!     fn block_size(&self) -> u32 {
//!         512
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MyStorage { data: vec![0u8; 1024 * 1024] };
//! let server = IscsiServer::builder()
//!     .bind_addr("0.0.0.0:3260")
//!     .target(IscsiTarget::with_block_device("iqn.2025-12.local:storage.disk1", storage))
//!     .build()?;
//! server.run()?;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod login;
pub mod messages;
pub mod pdu;
pub mod registry;
pub mod scsi;
pub mod server;
pub mod session;
pub mod target;
pub mod transfer;

pub use config::OfferedParameters;
pub use error::{IscsiError, ScsiResult};
pub use logging::LogEntry;
pub use scsi::{InquiryHooks, ScsiBackend, ScsiBlockDevice, ScsiOutcome};
pub use server::{IscsiServer, IscsiServerBuilder};
pub use target::IscsiTarget;

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
