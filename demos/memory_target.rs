//! iSCSI target with in-memory storage
//!
//! Usage: `cargo run --example memory_target [bind-addr] [session.toml]`
//!
//! The optional TOML file overrides the offered session parameters:
//!
//! ```toml
//! [session]
//! InitialR2T = "No"
//! MaxConnections = 4
//! ```

use iscsi_target::{IscsiError, IscsiServer, IscsiTarget, OfferedParameters, ScsiBlockDevice, ScsiResult};
use std::env;

const TARGET_NAME: &str = "iqn.2025-12.local:storage.memory-disk";

/// Simple in-memory storage backend
struct MemoryStorage {
    data: Vec<u8>,
    block_size: u32,
}

impl MemoryStorage {
    fn new(size_mb: usize, block_size: u32) -> Self {
        Self {
            data: vec![0u8; size_mb * 1024 * 1024],
            block_size,
        }
    }

    fn range(&self, lba: u64, len: usize) -> ScsiResult<std::ops::Range<usize>> {
        let offset = (lba * self.block_size as u64) as usize;
        if offset + len > self.data.len() {
            return Err(IscsiError::Scsi(format!(
                "access beyond device capacity: LBA {}, bytes {}",
                lba, len
            )));
        }
        Ok(offset..offset + len)
    }
}

impl ScsiBlockDevice for MemoryStorage {
    fn read(&self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>> {
        if block_size != self.block_size {
            return Err(IscsiError::Scsi(format!(
                "block size mismatch: expected {}, got {}",
                self.block_size, block_size
            )));
        }
        let range = self.range(lba, (blocks * block_size) as usize)?;
        Ok(self.data[range].to_vec())
    }

    fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()> {
        if block_size != self.block_size {
            return Err(IscsiError::Scsi(format!(
                "block size mismatch: expected {}, got {}",
                self.block_size, block_size
            )));
        }
        let range = self.range(lba, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }

    fn capacity(&self) -> u64 {
        (self.data.len() / self.block_size as usize) as u64
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let bind_addr = args.next().unwrap_or_else(|| "0.0.0.0:3260".to_string());
    let offered = match args.next() {
        Some(path) => OfferedParameters::from_toml_str(&std::fs::read_to_string(path)?)?,
        None => OfferedParameters::default(),
    };

    let storage = MemoryStorage::new(100, 512);
    println!(
        "Capacity: {} blocks of {} bytes",
        storage.capacity(),
        storage.block_size()
    );

    let server = IscsiServer::builder()
        .bind_addr(&bind_addr)
        .target(IscsiTarget::with_block_device(TARGET_NAME, storage))
        .offered_parameters(offered)
        .on_log_entry(|entry| {
            if entry.level == log::Level::Error {
                eprintln!("{}: {}", entry.source, entry.message);
            }
        })
        .build()?;

    let addr = server.start()?;
    println!("Serving {} on {}", TARGET_NAME, addr);
    server.run()?;
    Ok(())
}
