//! iSCSI PDU (Protocol Data Unit) framing and raw serialization
//!
//! This module handles the binary layout shared by every iSCSI PDU
//! based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! [`IscsiPdu`] is the untyped view of one PDU: the 48-byte Basic Header
//! Segment split into its common fields, the optional AHS and the data
//! segment. Typed messages live in [`crate::messages`].

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Bytes needed before [`pdu_length`] can size a PDU
pub const LENGTH_PROBE_SIZE: usize = 8;

/// Initiator/target task tag meaning "no task" or "no response expected"
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (client → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → client)
    pub const NOP_IN: u8 = 0x20;
    pub const SCSI_RESPONSE: u8 = 0x21;
    pub const TASK_MANAGEMENT_RESPONSE: u8 = 0x22;
    pub const LOGIN_RESPONSE: u8 = 0x23;
    pub const TEXT_RESPONSE: u8 = 0x24;
    pub const SCSI_DATA_IN: u8 = 0x25;
    pub const LOGOUT_RESPONSE: u8 = 0x26;
    pub const R2T: u8 = 0x31;
    pub const ASYNC_MESSAGE: u8 = 0x32;
    pub const REJECT: u8 = 0x3F;
}

/// iSCSI PDU flags (commonly used across PDU types)
pub mod flags {
    // Common flags
    pub const FINAL: u8 = 0x80;
    pub const CONTINUE: u8 = 0x40;

    // SCSI command flags
    pub const READ: u8 = 0x40;
    pub const WRITE: u8 = 0x20;
    pub const ATTRIBUTE_MASK: u8 = 0x07;

    // SCSI Data-In / SCSI Response flags
    pub const ACKNOWLEDGE: u8 = 0x40;
    pub const OVERFLOW: u8 = 0x04;
    pub const UNDERFLOW: u8 = 0x02;
    pub const STATUS_PRESENT: u8 = 0x01;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;
}

/// Login stages carried in the CSG/NSG fields
pub mod stage {
    pub const SECURITY_NEGOTIATION: u8 = 0;
    pub const LOGIN_OPERATIONAL_NEGOTIATION: u8 = 1;
    pub const FULL_FEATURE_PHASE: u8 = 3;
}

/// Login status (class << 8 | detail, RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u16 = 0x0000;
    pub const TARGET_MOVED_TEMPORARILY: u16 = 0x0101;
    pub const TARGET_MOVED_PERMANENTLY: u16 = 0x0102;
    pub const INITIATOR_ERROR: u16 = 0x0200;
    pub const AUTH_FAILURE: u16 = 0x0201;
    pub const AUTHORIZATION_FAILURE: u16 = 0x0202;
    pub const TARGET_NOT_FOUND: u16 = 0x0203;
    pub const TARGET_REMOVED: u16 = 0x0204;
    pub const UNSUPPORTED_VERSION: u16 = 0x0205;
    pub const TOO_MANY_CONNECTIONS: u16 = 0x0206;
    pub const MISSING_PARAMETER: u16 = 0x0207;
    pub const CANT_INCLUDE_IN_SESSION: u16 = 0x0208;
    pub const SESSION_TYPE_NOT_SUPPORTED: u16 = 0x0209;
    pub const SESSION_DOES_NOT_EXIST: u16 = 0x020A;
    pub const INVALID_DURING_LOGIN: u16 = 0x020B;
    pub const TARGET_ERROR: u16 = 0x0300;
    pub const SERVICE_UNAVAILABLE: u16 = 0x0301;
    pub const OUT_OF_RESOURCES: u16 = 0x0302;
}

/// Reject reasons (RFC 3720 Section 10.17.1)
pub mod reject_reason {
    pub const DATA_DIGEST_ERROR: u8 = 0x02;
    pub const SNACK_REJECT: u8 = 0x03;
    pub const PROTOCOL_ERROR: u8 = 0x04;
    pub const COMMAND_NOT_SUPPORTED: u8 = 0x05;
    pub const IMMEDIATE_COMMAND_REJECT: u8 = 0x06;
    pub const TASK_IN_PROGRESS: u8 = 0x07;
    pub const INVALID_DATA_ACK: u8 = 0x08;
    pub const INVALID_PDU_FIELD: u8 = 0x09;
    pub const LONG_OPERATION_REJECT: u8 = 0x0A;
    pub const NEGOTIATION_RESET: u8 = 0x0B;
    pub const WAITING_FOR_LOGOUT: u8 = 0x0C;
}

/// Logout reason codes
pub mod logout_reason {
    pub const CLOSE_SESSION: u8 = 0;
    pub const CLOSE_CONNECTION: u8 = 1;
    pub const REMOVE_CONNECTION_FOR_RECOVERY: u8 = 2;
}

/// Logout response codes
pub mod logout_response {
    pub const SUCCESS: u8 = 0;
    pub const CID_NOT_FOUND: u8 = 1;
    pub const CONNECTION_RECOVERY_NOT_SUPPORTED: u8 = 2;
    pub const CLEANUP_FAILED: u8 = 3;
}

/// Total length of the PDU that starts at `offset`.
///
/// Only the first eight bytes of the header are consulted (TotalAHSLength and
/// DataSegmentLength), so the caller can size a PDU before it has fully
/// arrived. The data segment is padded to a 4-byte boundary. Digests are never
/// negotiated, so they never contribute to the length.
///
/// # Panics
///
/// If fewer than [`LENGTH_PROBE_SIZE`] bytes are available at `offset`.
pub fn pdu_length(buf: &[u8], offset: usize) -> usize {
    let header = &buf[offset..offset + LENGTH_PROBE_SIZE];
    let ahs_bytes = header[4] as usize * 4;
    let data_length = BigEndian::read_u24(&header[5..8]) as usize;
    BHS_SIZE + ahs_bytes + padded(data_length)
}

fn padded(len: usize) -> usize {
    len.div_ceil(4) * 4
}

/// Basic Header Segment (BHS) - 48 bytes
///
/// ```text
/// Byte/     0       |       1       |       2       |       3       |
///     /              |               |               |               |
///    |0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|0 1 2 3 4 5 6 7|
///    +---------------+---------------+---------------+---------------+
///   0|.|I| Opcode    |F|  Opcode-specific fields                     |
///    +---------------+---------------+---------------+---------------+
///   4|TotalAHSLength | DataSegmentLength                             |
///    +---------------+---------------+---------------+---------------+
///   8| LUN or Opcode-specific fields                                 |
///    +                                                               +
///  12|                                                               |
///    +---------------+---------------+---------------+---------------+
///  16| Initiator Task Tag                                            |
///    +---------------+---------------+---------------+---------------+
///  20| Opcode-specific fields (28 bytes)                             |
///    +                                                               +
///  ...
///  44|                                                               |
///    +---------------+---------------+---------------+---------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiPdu {
    /// Opcode identifies the PDU type (lower 6 bits of byte 0)
    pub opcode: u8,
    /// Immediate flag (bit 6 of byte 0)
    pub immediate: bool,
    /// Opcode-specific flags (byte 1)
    pub flags: u8,
    /// Opcode-specific bytes 2-3 (versions, response/status, reject reason)
    pub opcode_fields: [u8; 2],
    /// Additional Header Segments, a multiple of 4 bytes
    pub ahs: Vec<u8>,
    /// Logical Unit Number or opcode-specific (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47, 28 bytes)
    pub specific: [u8; 28],
    /// Data segment without padding
    pub data: Vec<u8>,
}

impl Default for IscsiPdu {
    fn default() -> Self {
        Self::new(0)
    }
}

impl IscsiPdu {
    /// Create an empty PDU with the given opcode
    pub fn new(opcode: u8) -> Self {
        IscsiPdu {
            opcode,
            immediate: false,
            flags: 0,
            opcode_fields: [0; 2],
            ahs: Vec::new(),
            lun: 0,
            itt: 0,
            specific: [0u8; 28],
            data: Vec::new(),
        }
    }

    /// Parse a PDU from exactly the bytes [`pdu_length`] reported for it
    pub fn from_bytes(buf: &[u8]) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let total_len = pdu_length(buf, 0);
        if buf.len() != total_len {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU length mismatch: {} bytes, header describes {}",
                buf.len(),
                total_len
            )));
        }

        let ahs_bytes = buf[4] as usize * 4;
        let data_length = BigEndian::read_u24(&buf[5..8]) as usize;
        let data_start = BHS_SIZE + ahs_bytes;

        let mut specific = [0u8; 28];
        specific.copy_from_slice(&buf[20..BHS_SIZE]);

        Ok(IscsiPdu {
            opcode: buf[0] & 0x3F,
            immediate: (buf[0] & 0x40) != 0,
            flags: buf[1],
            opcode_fields: [buf[2], buf[3]],
            ahs: buf[BHS_SIZE..data_start].to_vec(),
            lun: BigEndian::read_u64(&buf[8..16]),
            itt: BigEndian::read_u32(&buf[16..20]),
            specific,
            data: buf[data_start..data_start + data_length].to_vec(),
        })
    }

    /// Serialize PDU to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.total_length());

        buf.push((if self.immediate { 0x40 } else { 0 }) | (self.opcode & 0x3F));
        buf.push(self.flags);
        buf.extend_from_slice(&self.opcode_fields);
        buf.push((self.ahs.len() / 4) as u8);
        // Writes into a Vec cannot fail
        let _ = buf.write_u24::<BigEndian>(self.data.len() as u32);
        let _ = buf.write_u64::<BigEndian>(self.lun);
        let _ = buf.write_u32::<BigEndian>(self.itt);
        buf.extend_from_slice(&self.specific);
        buf.extend_from_slice(&self.ahs);
        buf.extend_from_slice(&self.data);
        buf.resize(self.total_length(), 0);

        buf
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        opcode_name(self.opcode)
    }

    /// Get the total PDU length including headers and padded data
    pub fn total_length(&self) -> usize {
        BHS_SIZE + self.ahs.len() + padded(self.data.len())
    }

    pub(crate) fn read_u32(&self, at: usize) -> u32 {
        BigEndian::read_u32(&self.specific[at..at + 4])
    }

    pub(crate) fn write_u32(&mut self, at: usize, value: u32) {
        BigEndian::write_u32(&mut self.specific[at..at + 4], value);
    }

    pub(crate) fn read_u16(&self, at: usize) -> u16 {
        BigEndian::read_u16(&self.specific[at..at + 2])
    }

    pub(crate) fn write_u16(&mut self, at: usize, value: u16) {
        BigEndian::write_u16(&mut self.specific[at..at + 2], value);
    }
}

/// Human-readable opcode name
pub fn opcode_name(op: u8) -> &'static str {
    match op {
        opcode::NOP_OUT => "NOP-Out",
        opcode::SCSI_COMMAND => "SCSI Command",
        opcode::TASK_MANAGEMENT_REQUEST => "Task Management Request",
        opcode::LOGIN_REQUEST => "Login Request",
        opcode::TEXT_REQUEST => "Text Request",
        opcode::SCSI_DATA_OUT => "SCSI Data-Out",
        opcode::LOGOUT_REQUEST => "Logout Request",
        opcode::SNACK_REQUEST => "SNACK Request",
        opcode::NOP_IN => "NOP-In",
        opcode::SCSI_RESPONSE => "SCSI Response",
        opcode::TASK_MANAGEMENT_RESPONSE => "Task Management Response",
        opcode::LOGIN_RESPONSE => "Login Response",
        opcode::TEXT_RESPONSE => "Text Response",
        opcode::SCSI_DATA_IN => "SCSI Data-In",
        opcode::LOGOUT_RESPONSE => "Logout Response",
        opcode::R2T => "Ready To Transfer",
        opcode::ASYNC_MESSAGE => "Async Message",
        opcode::REJECT => "Reject",
        _ => "Unknown",
    }
}

// ============================================================================
// Utility functions
// ============================================================================

/// Parse iSCSI text parameters (null-terminated key=value pairs)
pub fn parse_text_parameters(data: &[u8]) -> ScsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }

        let s = String::from_utf8_lossy(chunk);
        match s.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                params.push((key.to_string(), value.to_string()));
            }
            _ => {
                return Err(IscsiError::InvalidPdu(format!(
                    "Malformed text parameter: {:?}",
                    s
                )));
            }
        }
    }

    Ok(params)
}

/// Serialize text parameters to null-terminated format
pub fn serialize_text_parameters(params: &[(String, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_new() {
        let pdu = IscsiPdu::new(opcode::NOP_OUT);
        assert_eq!(pdu.opcode, 0);
        assert!(!pdu.immediate);
        assert_eq!(pdu.flags, 0);
        assert!(pdu.ahs.is_empty());
        assert!(pdu.data.is_empty());
    }

    #[test]
    fn test_pdu_roundtrip_simple() {
        let mut pdu = IscsiPdu::new(opcode::NOP_OUT);
        pdu.flags = flags::FINAL;
        pdu.itt = 0x12345678;
        pdu.lun = 0x0001020304050607;

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), BHS_SIZE);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, pdu);
    }

    #[test]
    fn test_opcode_fields_and_ahs_preserved() {
        let mut pdu = IscsiPdu::new(opcode::SCSI_COMMAND);
        pdu.opcode_fields = [0xAB, 0xCD];
        pdu.ahs = vec![0, 4, 1, 0, 1, 2, 3, 4];
        pdu.data = vec![9; 5];

        let bytes = pdu.to_bytes();
        assert_eq!(bytes[2], 0xAB);
        assert_eq!(bytes[3], 0xCD);
        assert_eq!(bytes[4], 2);
        assert_eq!(pdu_length(&bytes, 0), bytes.len());
        assert_eq!(IscsiPdu::from_bytes(&bytes).unwrap(), pdu);
    }

    #[test]
    fn test_pdu_length_needs_only_eight_bytes() {
        let mut pdu = IscsiPdu::new(opcode::TEXT_REQUEST);
        pdu.data = vec![1; 13];
        let bytes = pdu.to_bytes();

        assert_eq!(pdu_length(&bytes[..LENGTH_PROBE_SIZE], 0), BHS_SIZE + 16);

        let mut stream = vec![0xEE; 3];
        stream.extend_from_slice(&bytes);
        assert_eq!(pdu_length(&stream, 3), bytes.len());
    }

    #[test]
    fn test_pdu_too_short() {
        let bytes = vec![0u8; 20];
        assert!(IscsiPdu::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_pdu_truncated_data() {
        let mut pdu = IscsiPdu::new(opcode::TEXT_REQUEST);
        pdu.data = vec![1; 8];
        let bytes = pdu.to_bytes();
        assert!(IscsiPdu::from_bytes(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn test_parse_text_parameters() {
        let data = b"Key1=Value1\0Key2=Value2\0\0\0";
        let params = parse_text_parameters(data).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("Key1".to_string(), "Value1".to_string()));
        assert_eq!(params[1], ("Key2".to_string(), "Value2".to_string()));
    }

    #[test]
    fn test_parse_text_parameters_value_with_equals() {
        let params = parse_text_parameters(b"TargetAddress=a=b\0").unwrap();
        assert_eq!(params[0].1, "a=b");
    }

    #[test]
    fn test_parse_text_parameters_malformed() {
        assert!(parse_text_parameters(b"NoEquals\0").is_err());
        assert!(parse_text_parameters(b"=value\0").is_err());
    }

    #[test]
    fn test_serialize_text_parameters() {
        let params = vec![
            ("Key1".to_string(), "Value1".to_string()),
            ("Key2".to_string(), "Value2".to_string()),
        ];
        let data = serialize_text_parameters(&params);
        assert_eq!(data, b"Key1=Value1\0Key2=Value2\0");
    }

    #[test]
    fn test_opcode_names() {
        assert_eq!(opcode_name(opcode::LOGIN_REQUEST), "Login Request");
        assert_eq!(opcode_name(opcode::SCSI_COMMAND), "SCSI Command");
        assert_eq!(opcode_name(opcode::R2T), "Ready To Transfer");
        assert_eq!(opcode_name(0x3E), "Unknown");
    }

    #[test]
    fn test_immediate_flag() {
        let mut pdu = IscsiPdu::new(opcode::LOGIN_REQUEST);
        pdu.immediate = true;

        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0] & 0x40, 0x40);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert!(parsed.immediate);
    }

    #[test]
    fn test_data_padding() {
        let mut pdu = IscsiPdu::new(opcode::TEXT_REQUEST);
        pdu.data = vec![1, 2, 3];

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(bytes.len(), BHS_SIZE + 4);
        assert_eq!(bytes[7], 3);
    }
}
