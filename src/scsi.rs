//! SCSI execution backends
//!
//! The iSCSI layer hands each command to a [`ScsiBackend`] as an opaque CDB
//! plus LUN and write data, and gets back a status byte and response bytes
//! (read data, or sense data for CHECK CONDITION).
//!
//! [`BlockDeviceBackend`] is a reference backend implementing a small subset
//! of the SCSI Block Commands (SBC) on top of a [`ScsiBlockDevice`].

use crate::error::ScsiResult;
use byteorder::{BigEndian, ByteOrder};
use std::sync::{Mutex, PoisonError};

/// SCSI block device trait
///
/// Implement this trait to provide storage for [`BlockDeviceBackend`].
pub trait ScsiBlockDevice: Send {
    /// Read `blocks` blocks starting at `lba`
    ///
    /// Returns exactly `blocks * block_size` bytes.
    fn read(&self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>>;

    /// Write whole blocks starting at `lba`
    fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()>;

    /// Get total capacity in logical blocks
    fn capacity(&self) -> u64;

    /// Get block size in bytes (typically 512 or 4096)
    fn block_size(&self) -> u32;

    /// Flush any pending writes to stable storage
    fn flush(&mut self) -> ScsiResult<()> {
        Ok(())
    }

    /// Vendor identification (8 chars max)
    fn vendor_id(&self) -> &str {
        "RUST"
    }

    /// Product identification (16 chars max)
    fn product_id(&self) -> &str {
        "Virtual Disk"
    }

    /// Product revision (4 chars max)
    fn product_rev(&self) -> &str {
        "1.0"
    }

    /// Unit serial number reported in VPD page 0x80
    fn serial_number(&self) -> &str {
        "00000000"
    }
}

/// SCSI operation codes handled by [`BlockDeviceBackend`]
pub mod scsi_opcode {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const START_STOP_UNIT: u8 = 0x1B;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
    pub const VERIFY_10: u8 = 0x2F;
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    pub const MODE_SENSE_10: u8 = 0x5A;
    pub const READ_16: u8 = 0x88;
    pub const WRITE_16: u8 = 0x8A;
    pub const VERIFY_16: u8 = 0x8F;
    pub const SYNCHRONIZE_CACHE_16: u8 = 0x91;
    /// READ CAPACITY (16) is service action 0x10 of this opcode
    pub const SERVICE_ACTION_IN_16: u8 = 0x9E;
    pub const REPORT_LUNS: u8 = 0xA0;
}

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const WRITE_ERROR: u8 = 0x0C;
    pub const UNRECOVERED_READ_ERROR: u8 = 0x11;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// Version descriptor values for standard INQUIRY data
pub mod version_descriptor {
    pub const SAM_5: u16 = 0x00A0;
    pub const ISCSI: u16 = 0x0960;
    pub const SBC_3: u16 = 0x04C0;
    pub const SPC_4: u16 = 0x0460;
}

/// Extract the logical unit number from an 8-byte SAM LUN field.
///
/// Peripheral and flat-space addressing both carry the unit number in the
/// low 14 bits of the first level.
pub fn decode_lun(lun: u64) -> u16 {
    ((lun >> 48) & 0x3FFF) as u16
}

/// Encode a logical unit number as a single-level SAM LUN field
pub fn encode_lun(lun: u16) -> u64 {
    let first_level = if lun < 256 {
        lun as u64
    } else {
        0x4000 | (lun as u64 & 0x3FFF)
    };
    first_level << 48
}

// ============================================================================
// Sense data and outcomes
// ============================================================================

/// SCSI sense data (fixed format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,
    pub ascq: u8,
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];
        // Current error, fixed format; VALID when INFORMATION is meaningful
        data[0] = if self.information != 0 { 0xF0 } else { 0x70 };
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);
        data[7] = 10;
        data[12] = self.asc;
        data[13] = self.ascq;
        data
    }

    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    pub fn invalid_field() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
    }

    pub fn lba_out_of_range(lba: u64) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0)
            .with_info((lba & 0xFFFF_FFFF) as u32)
    }

    pub fn lun_not_supported() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LOGICAL_UNIT_NOT_SUPPORTED, 0)
    }

    pub fn read_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::UNRECOVERED_READ_ERROR, 0)
    }

    pub fn write_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::WRITE_ERROR, 0)
    }
}

/// Result of executing one SCSI command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiOutcome {
    /// SCSI status code
    pub status: u8,
    /// Read data for GOOD, sense data for CHECK CONDITION
    pub response: Vec<u8>,
}

impl ScsiOutcome {
    pub fn good(response: Vec<u8>) -> Self {
        ScsiOutcome {
            status: scsi_status::GOOD,
            response,
        }
    }

    pub fn good_no_data() -> Self {
        Self::good(Vec::new())
    }

    pub fn check_condition(sense: SenseData) -> Self {
        ScsiOutcome {
            status: scsi_status::CHECK_CONDITION,
            response: sense.to_bytes(),
        }
    }
}

// ============================================================================
// Inquiry data
// ============================================================================

/// Standard INQUIRY data before serialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardInquiryData {
    pub peripheral_qualifier: u8,
    pub peripheral_device_type: u8,
    pub version: u8,
    pub vendor_id: String,
    pub product_id: String,
    pub product_rev: String,
    /// Up to eight version descriptors, in order
    pub version_descriptors: Vec<u16>,
}

impl StandardInquiryData {
    /// Serialize to the 96-byte standard INQUIRY layout
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 96];
        data[0] = (self.peripheral_qualifier << 5) | (self.peripheral_device_type & 0x1F);
        data[2] = self.version;
        // HiSup, response data format 2
        data[3] = 0x12;
        data[4] = (data.len() - 5) as u8;
        // CmdQue
        data[7] = 0x02;
        write_padded(&mut data[8..16], &self.vendor_id);
        write_padded(&mut data[16..32], &self.product_id);
        write_padded(&mut data[32..36], &self.product_rev);
        for (i, descriptor) in self.version_descriptors.iter().take(8).enumerate() {
            BigEndian::write_u16(&mut data[58 + i * 2..60 + i * 2], *descriptor);
        }
        data
    }
}

fn write_padded(field: &mut [u8], value: &str) {
    field.fill(b' ');
    for (dst, src) in field.iter_mut().zip(value.bytes()) {
        *dst = src;
    }
}

/// One designation descriptor of VPD page 0x83
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentificationDescriptor {
    pub protocol_identifier: u8,
    pub code_set: u8,
    pub protocol_identifier_valid: bool,
    pub association: u8,
    pub identifier_type: u8,
    pub identifier: Vec<u8>,
}

impl IdentificationDescriptor {
    /// Protocol identifier for iSCSI
    pub const PROTOCOL_ISCSI: u8 = 0x5;
    pub const CODE_SET_BINARY: u8 = 0x1;
    pub const CODE_SET_UTF8: u8 = 0x3;
    pub const ASSOCIATION_LOGICAL_UNIT: u8 = 0x0;
    pub const ASSOCIATION_TARGET_DEVICE: u8 = 0x2;
    pub const TYPE_NAA: u8 = 0x3;
    pub const TYPE_SCSI_NAME_STRING: u8 = 0x8;

    /// NAA identifier of the logical unit
    pub fn naa(identifier: [u8; 8]) -> Self {
        IdentificationDescriptor {
            protocol_identifier: 0,
            code_set: Self::CODE_SET_BINARY,
            protocol_identifier_valid: false,
            association: Self::ASSOCIATION_LOGICAL_UNIT,
            identifier_type: Self::TYPE_NAA,
            identifier: identifier.to_vec(),
        }
    }

    /// SCSI name string identifying an iSCSI target device.
    ///
    /// The string is null terminated and padded to a multiple of four bytes.
    pub fn scsi_name_string(name: &str) -> Self {
        let mut identifier = name.as_bytes().to_vec();
        identifier.push(0);
        identifier.resize(identifier.len().div_ceil(4) * 4, 0);
        IdentificationDescriptor {
            protocol_identifier: Self::PROTOCOL_ISCSI,
            code_set: Self::CODE_SET_UTF8,
            protocol_identifier_valid: true,
            association: Self::ASSOCIATION_TARGET_DEVICE,
            identifier_type: Self::TYPE_SCSI_NAME_STRING,
            identifier,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.identifier.len());
        bytes.push((self.protocol_identifier << 4) | (self.code_set & 0x0F));
        bytes.push(
            (if self.protocol_identifier_valid { 0x80 } else { 0 })
                | ((self.association & 0x03) << 4)
                | (self.identifier_type & 0x0F),
        );
        bytes.push(0);
        bytes.push(self.identifier.len() as u8);
        bytes.extend_from_slice(&self.identifier);
        bytes
    }
}

/// Device Identification VPD page (0x83)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentificationPage {
    pub peripheral_device_type: u8,
    pub descriptors: Vec<IdentificationDescriptor>,
}

impl DeviceIdentificationPage {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![self.peripheral_device_type & 0x1F, 0x83, 0, 0];
        for descriptor in &self.descriptors {
            data.extend_from_slice(&descriptor.to_bytes());
        }
        let page_length = (data.len() - 4) as u16;
        BigEndian::write_u16(&mut data[2..4], page_length);
        data
    }
}

/// Callbacks a backend raises while building INQUIRY responses
///
/// Both default to leaving the data untouched.
pub trait InquiryHooks {
    fn standard_inquiry(&self, _lun: u16, _data: &mut StandardInquiryData) {}

    fn device_identification(&self, _lun: u16, _page: &mut DeviceIdentificationPage) {}
}

/// Hooks that change nothing
pub struct NoInquiryHooks;

impl InquiryHooks for NoInquiryHooks {}

/// A SCSI command execution engine
pub trait ScsiBackend: Send + Sync {
    /// Execute one command.
    ///
    /// `cdb` is the command descriptor block, `data` the complete write data
    /// (empty for commands without a data-out phase).
    fn execute_command(
        &self,
        cdb: &[u8],
        lun: u16,
        data: &[u8],
        hooks: &dyn InquiryHooks,
    ) -> ScsiOutcome;
}

// ============================================================================
// Block device backend
// ============================================================================

/// Exposes one [`ScsiBlockDevice`] as LUN 0
pub struct BlockDeviceBackend<D: ScsiBlockDevice> {
    device: Mutex<D>,
}

impl<D: ScsiBlockDevice> BlockDeviceBackend<D> {
    pub fn new(device: D) -> Self {
        BlockDeviceBackend {
            device: Mutex::new(device),
        }
    }

    /// Consume the backend and return the device
    pub fn into_inner(self) -> D {
        self.device.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<D: ScsiBlockDevice> ScsiBackend for BlockDeviceBackend<D> {
    fn execute_command(
        &self,
        cdb: &[u8],
        lun: u16,
        data: &[u8],
        hooks: &dyn InquiryHooks,
    ) -> ScsiOutcome {
        let Some(&opcode) = cdb.first() else {
            return ScsiOutcome::check_condition(SenseData::invalid_command());
        };

        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);

        if lun != 0 {
            return match opcode {
                scsi_opcode::INQUIRY => inquiry(cdb, lun, &*device, hooks),
                scsi_opcode::REPORT_LUNS => report_luns(cdb),
                scsi_opcode::REQUEST_SENSE => request_sense(cdb, SenseData::lun_not_supported()),
                _ => ScsiOutcome::check_condition(SenseData::lun_not_supported()),
            };
        }

        match opcode {
            scsi_opcode::TEST_UNIT_READY => ScsiOutcome::good_no_data(),
            scsi_opcode::INQUIRY => inquiry(cdb, lun, &*device, hooks),
            scsi_opcode::READ_CAPACITY_10 => read_capacity_10(&*device),
            scsi_opcode::SERVICE_ACTION_IN_16 => service_action_in_16(cdb, &*device),
            scsi_opcode::READ_10 | scsi_opcode::READ_16 => match parse_rw_cdb(cdb) {
                Some((lba, blocks)) => read(&*device, lba, blocks),
                None => ScsiOutcome::check_condition(SenseData::invalid_field()),
            },
            scsi_opcode::WRITE_10 | scsi_opcode::WRITE_16 => match parse_rw_cdb(cdb) {
                Some((lba, blocks)) => write(&mut *device, lba, blocks, data),
                None => ScsiOutcome::check_condition(SenseData::invalid_field()),
            },
            scsi_opcode::MODE_SENSE_6 => mode_sense_6(cdb),
            scsi_opcode::MODE_SENSE_10 => mode_sense_10(cdb),
            scsi_opcode::REQUEST_SENSE => {
                request_sense(cdb, SenseData::new(sense_key::NO_SENSE, asc::NO_ADDITIONAL_SENSE, 0))
            }
            scsi_opcode::SYNCHRONIZE_CACHE_10 | scsi_opcode::SYNCHRONIZE_CACHE_16 => {
                match device.flush() {
                    Ok(()) => ScsiOutcome::good_no_data(),
                    Err(_) => ScsiOutcome::check_condition(SenseData::write_error()),
                }
            }
            scsi_opcode::REPORT_LUNS => report_luns(cdb),
            // VERIFY without BYTCHK only checks the medium
            scsi_opcode::START_STOP_UNIT | scsi_opcode::VERIFY_10 | scsi_opcode::VERIFY_16 => {
                ScsiOutcome::good_no_data()
            }
            _ => ScsiOutcome::check_condition(SenseData::invalid_command()),
        }
    }
}

/// Parse LBA and transfer length from a READ/WRITE (10) or (16) CDB
pub fn parse_rw_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
    match *cdb.first()? {
        scsi_opcode::READ_10 | scsi_opcode::WRITE_10 if cdb.len() >= 10 => Some((
            BigEndian::read_u32(&cdb[2..6]) as u64,
            BigEndian::read_u16(&cdb[7..9]) as u32,
        )),
        scsi_opcode::READ_16 | scsi_opcode::WRITE_16 if cdb.len() >= 16 => Some((
            BigEndian::read_u64(&cdb[2..10]),
            BigEndian::read_u32(&cdb[10..14]),
        )),
        _ => None,
    }
}

fn truncated(mut data: Vec<u8>, alloc_len: usize) -> ScsiOutcome {
    data.truncate(alloc_len);
    ScsiOutcome::good(data)
}

fn inquiry(
    cdb: &[u8],
    lun: u16,
    device: &dyn ScsiBlockDevice,
    hooks: &dyn InquiryHooks,
) -> ScsiOutcome {
    if cdb.len() < 6 {
        return ScsiOutcome::check_condition(SenseData::invalid_field());
    }

    let evpd = cdb[1] & 0x01 != 0;
    let page_code = cdb[2];
    let alloc_len = BigEndian::read_u16(&cdb[3..5]) as usize;

    if lun != 0 {
        // Peripheral qualifier 3: no logical unit at this address
        let mut data = vec![0u8; 36];
        data[0] = 0x7F;
        data[4] = 31;
        return truncated(data, alloc_len);
    }

    if !evpd {
        if page_code != 0 {
            return ScsiOutcome::check_condition(SenseData::invalid_field());
        }
        let mut standard = StandardInquiryData {
            peripheral_qualifier: 0,
            peripheral_device_type: 0,
            // SPC-4
            version: 0x06,
            vendor_id: device.vendor_id().to_string(),
            product_id: device.product_id().to_string(),
            product_rev: device.product_rev().to_string(),
            version_descriptors: vec![version_descriptor::SAM_5, version_descriptor::SPC_4],
        };
        hooks.standard_inquiry(lun, &mut standard);
        standard.version_descriptors.push(version_descriptor::SBC_3);
        return truncated(standard.to_bytes(), alloc_len);
    }

    match page_code {
        0x00 => {
            let data = vec![0x00, 0x00, 0x00, 3, 0x00, 0x80, 0x83];
            truncated(data, alloc_len)
        }
        0x80 => {
            let serial = device.serial_number().as_bytes();
            let mut data = vec![0x00, 0x80, 0x00, serial.len().min(251) as u8];
            data.extend_from_slice(&serial[..serial.len().min(251)]);
            truncated(data, alloc_len)
        }
        0x83 => {
            let mut page = DeviceIdentificationPage {
                peripheral_device_type: 0,
                descriptors: vec![IdentificationDescriptor::naa([
                    0x60, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
                ])],
            };
            hooks.device_identification(lun, &mut page);
            truncated(page.to_bytes(), alloc_len)
        }
        _ => ScsiOutcome::check_condition(SenseData::invalid_field()),
    }
}

fn read_capacity_10(device: &dyn ScsiBlockDevice) -> ScsiOutcome {
    let last_lba = device.capacity().saturating_sub(1);
    let mut data = vec![0u8; 8];
    // 0xFFFFFFFF tells the initiator to use READ CAPACITY (16)
    BigEndian::write_u32(&mut data[0..4], last_lba.min(0xFFFF_FFFF) as u32);
    BigEndian::write_u32(&mut data[4..8], device.block_size());
    ScsiOutcome::good(data)
}

fn service_action_in_16(cdb: &[u8], device: &dyn ScsiBlockDevice) -> ScsiOutcome {
    // Service action 0x10 = READ CAPACITY (16)
    if cdb.len() < 16 || cdb[1] & 0x1F != 0x10 {
        return ScsiOutcome::check_condition(SenseData::invalid_command());
    }

    let alloc_len = BigEndian::read_u32(&cdb[10..14]) as usize;
    let mut data = vec![0u8; 32];
    BigEndian::write_u64(&mut data[0..8], device.capacity().saturating_sub(1));
    BigEndian::write_u32(&mut data[8..12], device.block_size());
    truncated(data, alloc_len)
}

fn in_range(device: &dyn ScsiBlockDevice, lba: u64, blocks: u32) -> bool {
    lba.checked_add(blocks as u64)
        .is_some_and(|end| end <= device.capacity())
}

fn read(device: &dyn ScsiBlockDevice, lba: u64, blocks: u32) -> ScsiOutcome {
    if blocks == 0 {
        return ScsiOutcome::good_no_data();
    }
    if !in_range(device, lba, blocks) {
        return ScsiOutcome::check_condition(SenseData::lba_out_of_range(lba));
    }

    match device.read(lba, blocks, device.block_size()) {
        Ok(data) => ScsiOutcome::good(data),
        Err(e) => {
            log::warn!("Read of {} blocks at LBA {} failed: {}", blocks, lba, e);
            ScsiOutcome::check_condition(SenseData::read_error())
        }
    }
}

fn write(device: &mut dyn ScsiBlockDevice, lba: u64, blocks: u32, data: &[u8]) -> ScsiOutcome {
    if blocks == 0 {
        return ScsiOutcome::good_no_data();
    }
    if !in_range(device, lba, blocks) {
        return ScsiOutcome::check_condition(SenseData::lba_out_of_range(lba));
    }

    let block_size = device.block_size();
    let expected = blocks as usize * block_size as usize;
    if data.len() < expected {
        log::warn!(
            "Write data too short: got {}, need {}",
            data.len(),
            expected
        );
        return ScsiOutcome::check_condition(SenseData::invalid_field());
    }

    match device.write(lba, &data[..expected], block_size) {
        Ok(()) => ScsiOutcome::good_no_data(),
        Err(e) => {
            log::warn!("Write of {} blocks at LBA {} failed: {}", blocks, lba, e);
            ScsiOutcome::check_condition(SenseData::write_error())
        }
    }
}

fn mode_sense_6(cdb: &[u8]) -> ScsiOutcome {
    if cdb.len() < 6 {
        return ScsiOutcome::check_condition(SenseData::invalid_field());
    }
    // Header only: mode data length, medium type, device-specific, block descriptor length
    truncated(vec![3, 0, 0, 0], cdb[4] as usize)
}

fn mode_sense_10(cdb: &[u8]) -> ScsiOutcome {
    if cdb.len() < 10 {
        return ScsiOutcome::check_condition(SenseData::invalid_field());
    }
    let alloc_len = BigEndian::read_u16(&cdb[7..9]) as usize;
    let mut data = vec![0u8; 8];
    BigEndian::write_u16(&mut data[0..2], 6);
    truncated(data, alloc_len)
}

fn request_sense(cdb: &[u8], sense: SenseData) -> ScsiOutcome {
    if cdb.len() < 6 {
        return ScsiOutcome::check_condition(SenseData::invalid_field());
    }
    truncated(sense.to_bytes(), cdb[4] as usize)
}

fn report_luns(cdb: &[u8]) -> ScsiOutcome {
    if cdb.len() < 12 {
        return ScsiOutcome::check_condition(SenseData::invalid_field());
    }
    let alloc_len = BigEndian::read_u32(&cdb[6..10]) as usize;
    // LUN list length 8 (one entry: LUN 0)
    let mut data = vec![0u8; 16];
    BigEndian::write_u32(&mut data[0..4], 8);
    truncated(data, alloc_len)
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct MemoryDevice {
        capacity: u64,
        block_size: u32,
        data: Vec<u8>,
        flushes: usize,
    }

    impl MemoryDevice {
        fn new(capacity: u64, block_size: u32) -> Self {
            MemoryDevice {
                capacity,
                block_size,
                data: vec![0u8; (capacity * block_size as u64) as usize],
                flushes: 0,
            }
        }
    }

    impl ScsiBlockDevice for MemoryDevice {
        fn read(&self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>> {
            let offset = (lba * block_size as u64) as usize;
            let len = (blocks * block_size) as usize;
            Ok(self.data[offset..offset + len].to_vec())
        }

        fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()> {
            let offset = (lba * block_size as u64) as usize;
            self.data[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }

        fn capacity(&self) -> u64 {
            self.capacity
        }

        fn block_size(&self) -> u32 {
            self.block_size
        }

        fn flush(&mut self) -> ScsiResult<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    fn exec(backend: &BlockDeviceBackend<MemoryDevice>, cdb: &[u8], data: &[u8]) -> ScsiOutcome {
        backend.execute_command(cdb, 0, data, &NoInquiryHooks)
    }

    fn sense_key_of(outcome: &ScsiOutcome) -> u8 {
        outcome.response[2] & 0x0F
    }

    #[test]
    fn test_test_unit_ready() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(1000, 512));
        let outcome = exec(&backend, &[0x00, 0, 0, 0, 0, 0], &[]);
        assert_eq!(outcome, ScsiOutcome::good_no_data());
    }

    #[test]
    fn test_standard_inquiry_layout() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(1000, 512));
        let outcome = exec(&backend, &[0x12, 0, 0, 0, 96, 0], &[]);
        assert_eq!(outcome.status, scsi_status::GOOD);
        assert_eq!(outcome.response.len(), 96);
        assert_eq!(outcome.response[0], 0x00);
        assert_eq!(&outcome.response[8..16], b"RUST    ");
        assert_eq!(&outcome.response[16..28], b"Virtual Disk");
        assert_eq!(BigEndian::read_u16(&outcome.response[58..60]), version_descriptor::SAM_5);
    }

    #[test]
    fn test_inquiry_respects_allocation_length() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(1000, 512));
        let outcome = exec(&backend, &[0x12, 0, 0, 0, 36, 0], &[]);
        assert_eq!(outcome.response.len(), 36);
    }

    #[test]
    fn test_inquiry_hooks_see_data() {
        struct AddDescriptor;
        impl InquiryHooks for AddDescriptor {
            fn standard_inquiry(&self, _lun: u16, data: &mut StandardInquiryData) {
                data.version_descriptors.push(version_descriptor::ISCSI);
            }
            fn device_identification(&self, _lun: u16, page: &mut DeviceIdentificationPage) {
                page.descriptors
                    .push(IdentificationDescriptor::scsi_name_string("iqn.2025-12.test:t"));
            }
        }

        let backend = BlockDeviceBackend::new(MemoryDevice::new(8, 512));
        let standard = backend.execute_command(&[0x12, 0, 0, 0, 96, 0], 0, &[], &AddDescriptor);
        assert_eq!(BigEndian::read_u16(&standard.response[62..64]), version_descriptor::ISCSI);

        let page = backend.execute_command(&[0x12, 1, 0x83, 0, 255, 0], 0, &[], &AddDescriptor);
        let text = String::from_utf8_lossy(&page.response);
        assert!(text.contains("iqn.2025-12.test:t"));
        let page_length = BigEndian::read_u16(&page.response[2..4]) as usize;
        assert_eq!(page_length + 4, page.response.len());
    }

    #[test]
    fn test_inquiry_vpd_supported_pages() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(1000, 512));
        let outcome = exec(&backend, &[0x12, 0x01, 0x00, 0, 255, 0], &[]);
        assert_eq!(outcome.status, scsi_status::GOOD);
        assert_eq!(&outcome.response[4..], &[0x00, 0x80, 0x83]);
    }

    #[test]
    fn test_read_capacity_10() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(1000, 512));
        let outcome = exec(&backend, &[0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0], &[]);
        assert_eq!(outcome.response.len(), 8);
        assert_eq!(BigEndian::read_u32(&outcome.response[0..4]), 999);
        assert_eq!(BigEndian::read_u32(&outcome.response[4..8]), 512);
    }

    #[test]
    fn test_read_capacity_16() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(1000, 4096));
        let cdb = [0x9E, 0x10, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 32, 0, 0];
        let outcome = exec(&backend, &cdb, &[]);
        assert_eq!(BigEndian::read_u64(&outcome.response[0..8]), 999);
        assert_eq!(BigEndian::read_u32(&outcome.response[8..12]), 4096);
    }

    #[test]
    fn test_write_then_read_10() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(100, 512));
        let payload = vec![0xA5; 1024];
        let write = exec(&backend, &[0x2A, 0, 0, 0, 0, 4, 0, 0, 2, 0], &payload);
        assert_eq!(write.status, scsi_status::GOOD);

        let read = exec(&backend, &[0x28, 0, 0, 0, 0, 4, 0, 0, 2, 0], &[]);
        assert_eq!(read.status, scsi_status::GOOD);
        assert_eq!(read.response, payload);

        let device = backend.into_inner();
        assert_eq!(&device.data[4 * 512..6 * 512], &payload[..]);
    }

    #[test]
    fn test_write_16_short_data() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(100, 512));
        let mut cdb = [0u8; 16];
        cdb[0] = 0x8A;
        cdb[13] = 2;
        let outcome = exec(&backend, &cdb, &[0u8; 512]);
        assert_eq!(outcome.status, scsi_status::CHECK_CONDITION);
        assert_eq!(sense_key_of(&outcome), sense_key::ILLEGAL_REQUEST);
    }

    #[test]
    fn test_read_10_out_of_range() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(100, 512));
        let outcome = exec(&backend, &[0x28, 0, 0, 0, 0, 200, 0, 0, 1, 0], &[]);
        assert_eq!(outcome.status, scsi_status::CHECK_CONDITION);
        assert_eq!(outcome.response[12], asc::LBA_OUT_OF_RANGE);
        assert_eq!(BigEndian::read_u32(&outcome.response[3..7]), 200);
    }

    #[test]
    fn test_synchronize_cache_flushes() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(10, 512));
        let outcome = exec(&backend, &[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0], &[]);
        assert_eq!(outcome.status, scsi_status::GOOD);
        assert_eq!(backend.into_inner().flushes, 1);
    }

    #[test]
    fn test_report_luns() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(10, 512));
        let outcome = exec(&backend, &[0xA0, 0, 0, 0, 0, 0, 0, 0, 0, 16, 0, 0], &[]);
        assert_eq!(outcome.response.len(), 16);
        assert_eq!(BigEndian::read_u32(&outcome.response[0..4]), 8);
    }

    #[test]
    fn test_mode_sense() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(10, 512));
        assert_eq!(exec(&backend, &[0x1A, 0, 0x3F, 0, 255, 0], &[]).response.len(), 4);
        assert_eq!(
            exec(&backend, &[0x5A, 0, 0x3F, 0, 0, 0, 0, 0, 255, 0], &[]).response.len(),
            8
        );
    }

    #[test]
    fn test_unsupported_command() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(10, 512));
        let outcome = exec(&backend, &[0xFF, 0, 0, 0, 0, 0], &[]);
        assert_eq!(outcome.status, scsi_status::CHECK_CONDITION);
        assert_eq!(outcome.response.len(), 18);
        assert_eq!(sense_key_of(&outcome), sense_key::ILLEGAL_REQUEST);
        assert_eq!(outcome.response[12], asc::INVALID_COMMAND_OPERATION_CODE);
    }

    #[test]
    fn test_nonzero_lun() {
        let backend = BlockDeviceBackend::new(MemoryDevice::new(10, 512));
        let tur = backend.execute_command(&[0x00, 0, 0, 0, 0, 0], 3, &[], &NoInquiryHooks);
        assert_eq!(tur.status, scsi_status::CHECK_CONDITION);
        assert_eq!(tur.response[12], asc::LOGICAL_UNIT_NOT_SUPPORTED);

        let inquiry = backend.execute_command(&[0x12, 0, 0, 0, 36, 0], 3, &[], &NoInquiryHooks);
        assert_eq!(inquiry.status, scsi_status::GOOD);
        assert_eq!(inquiry.response[0], 0x7F);
    }

    #[test]
    fn test_parse_rw_cdb() {
        assert_eq!(parse_rw_cdb(&[0x28, 0, 0, 0, 0, 100, 0, 0, 10, 0]), Some((100, 10)));
        let cdb = [0x88, 0, 0, 0, 0, 0, 0, 0, 0, 100, 0, 0, 0, 10, 0, 0];
        assert_eq!(parse_rw_cdb(&cdb), Some((100, 10)));
        assert_eq!(parse_rw_cdb(&[0x28, 0, 0]), None);
        assert_eq!(parse_rw_cdb(&[0x00; 10]), None);
    }

    #[test]
    fn test_lun_encoding() {
        assert_eq!(decode_lun(0), 0);
        assert_eq!(decode_lun(encode_lun(5)), 5);
        assert_eq!(decode_lun(encode_lun(300)), 300);
        assert_eq!(encode_lun(1), 0x0001_0000_0000_0000);
    }

    #[test]
    fn test_scsi_name_string_padding() {
        let descriptor = IdentificationDescriptor::scsi_name_string("iqn.a");
        assert_eq!(descriptor.identifier.len(), 8);
        let bytes = descriptor.to_bytes();
        assert_eq!(bytes[0], 0x53);
        assert_eq!(bytes[1], 0x80 | 0x20 | 0x08);
        assert_eq!(bytes[3], 8);
    }
}
