//! Typed iSCSI messages
//!
//! Each struct mirrors one PDU layout from RFC 3720 Section 10. [`Pdu`] is the
//! closed set the server understands; anything else that frames correctly
//! decodes to [`Pdu::Unsupported`] so it can be answered with a Reject.

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::{
    flags, opcode, opcode_name, parse_text_parameters, IscsiPdu, BHS_SIZE, RESERVED_TAG,
};
use thiserror::Error;

/// A PDU that framed correctly but could not be decoded
#[derive(Debug, Error)]
#[error("failed to decode {name} PDU: {source}")]
pub struct DecodeError {
    /// Opcode name taken from the first header byte
    pub name: &'static str,
    /// At most the first 48 bytes of the offending PDU, for a Reject payload
    pub header: Vec<u8>,
    #[source]
    pub source: IscsiError,
}

/// At most the first 48 bytes of an encoded PDU
pub fn reject_payload(bytes: &[u8]) -> Vec<u8> {
    bytes[..bytes.len().min(BHS_SIZE)].to_vec()
}

fn expect_opcode(raw: &IscsiPdu, expected: u8) -> ScsiResult<()> {
    if raw.opcode != expected {
        return Err(IscsiError::InvalidPdu(format!(
            "Expected {} opcode 0x{:02x}, got 0x{:02x}",
            opcode_name(expected),
            expected,
            raw.opcode
        )));
    }
    Ok(())
}

fn split_isid_tsih(lun: u64) -> ([u8; 6], u16) {
    let bytes = lun.to_be_bytes();
    let mut isid = [0u8; 6];
    isid.copy_from_slice(&bytes[0..6]);
    (isid, u16::from_be_bytes([bytes[6], bytes[7]]))
}

fn join_isid_tsih(isid: [u8; 6], tsih: u16) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[0..6].copy_from_slice(&isid);
    bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
    u64::from_be_bytes(bytes)
}

fn login_flags(transit: bool, cont: bool, csg: u8, nsg: u8) -> u8 {
    (if transit { flags::TRANSIT } else { 0 })
        | (if cont { flags::CONTINUE_LOGIN } else { 0 })
        | ((csg & 0x03) << 2)
        | (nsg & 0x03)
}

fn final_flag(set: bool) -> u8 {
    if set {
        flags::FINAL
    } else {
        0
    }
}

// ============================================================================
// Login
// ============================================================================

/// Login Request (opcode 0x03)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub version_max: u8,
    pub version_min: u8,
    pub isid: [u8; 6],
    pub tsih: u16,
    pub itt: u32,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub data: Vec<u8>,
}

impl LoginRequest {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::LOGIN_REQUEST)?;
        let csg = (raw.flags >> 2) & 0x03;
        let nsg = raw.flags & 0x03;
        if csg == 2 || nsg == 2 {
            return Err(IscsiError::InvalidPdu(format!(
                "Reserved login stage: CSG={}, NSG={}",
                csg, nsg
            )));
        }
        let (isid, tsih) = split_isid_tsih(raw.lun);
        Ok(LoginRequest {
            transit: raw.flags & flags::TRANSIT != 0,
            cont: raw.flags & flags::CONTINUE_LOGIN != 0,
            csg,
            nsg,
            version_max: raw.opcode_fields[0],
            version_min: raw.opcode_fields[1],
            isid,
            tsih,
            itt: raw.itt,
            cid: raw.read_u16(0),
            cmd_sn: raw.read_u32(4),
            exp_stat_sn: raw.read_u32(8),
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::LOGIN_REQUEST);
        raw.immediate = true;
        raw.flags = login_flags(self.transit, self.cont, self.csg, self.nsg);
        raw.opcode_fields = [self.version_max, self.version_min];
        raw.lun = join_isid_tsih(self.isid, self.tsih);
        raw.itt = self.itt;
        raw.write_u16(0, self.cid);
        raw.write_u32(4, self.cmd_sn);
        raw.write_u32(8, self.exp_stat_sn);
        raw.data = self.data.clone();
        raw
    }

    /// Decoded key=value pairs of the data segment
    pub fn parameters(&self) -> ScsiResult<Vec<(String, String)>> {
        parse_text_parameters(&self.data)
    }
}

/// Login Response (opcode 0x23)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginResponse {
    pub transit: bool,
    pub cont: bool,
    pub csg: u8,
    pub nsg: u8,
    pub version_max: u8,
    pub version_active: u8,
    pub isid: [u8; 6],
    pub tsih: u16,
    pub itt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    /// Status class in the high byte, detail in the low byte
    pub status: u16,
    pub data: Vec<u8>,
}

impl LoginResponse {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::LOGIN_RESPONSE)?;
        let (isid, tsih) = split_isid_tsih(raw.lun);
        Ok(LoginResponse {
            transit: raw.flags & flags::TRANSIT != 0,
            cont: raw.flags & flags::CONTINUE_LOGIN != 0,
            csg: (raw.flags >> 2) & 0x03,
            nsg: raw.flags & 0x03,
            version_max: raw.opcode_fields[0],
            version_active: raw.opcode_fields[1],
            isid,
            tsih,
            itt: raw.itt,
            stat_sn: raw.read_u32(4),
            exp_cmd_sn: raw.read_u32(8),
            max_cmd_sn: raw.read_u32(12),
            status: raw.read_u16(16),
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::LOGIN_RESPONSE);
        raw.flags = login_flags(self.transit, self.cont, self.csg, self.nsg);
        raw.opcode_fields = [self.version_max, self.version_active];
        raw.lun = join_isid_tsih(self.isid, self.tsih);
        raw.itt = self.itt;
        raw.write_u32(4, self.stat_sn);
        raw.write_u32(8, self.exp_cmd_sn);
        raw.write_u32(12, self.max_cmd_sn);
        raw.write_u16(16, self.status);
        raw.data = self.data.clone();
        raw
    }

    pub fn status_class(&self) -> u8 {
        (self.status >> 8) as u8
    }
}

// ============================================================================
// Text
// ============================================================================

/// Text Request (opcode 0x04)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextRequest {
    pub immediate: bool,
    pub final_flag: bool,
    pub cont: bool,
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub data: Vec<u8>,
}

impl TextRequest {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::TEXT_REQUEST)?;
        Ok(TextRequest {
            immediate: raw.immediate,
            final_flag: raw.flags & flags::FINAL != 0,
            cont: raw.flags & flags::CONTINUE != 0,
            lun: raw.lun,
            itt: raw.itt,
            ttt: raw.read_u32(0),
            cmd_sn: raw.read_u32(4),
            exp_stat_sn: raw.read_u32(8),
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::TEXT_REQUEST);
        raw.immediate = self.immediate;
        raw.flags = final_flag(self.final_flag) | if self.cont { flags::CONTINUE } else { 0 };
        raw.lun = self.lun;
        raw.itt = self.itt;
        raw.write_u32(0, self.ttt);
        raw.write_u32(4, self.cmd_sn);
        raw.write_u32(8, self.exp_stat_sn);
        raw.data = self.data.clone();
        raw
    }

    pub fn parameters(&self) -> ScsiResult<Vec<(String, String)>> {
        parse_text_parameters(&self.data)
    }
}

/// Text Response (opcode 0x24)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextResponse {
    pub final_flag: bool,
    pub cont: bool,
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data: Vec<u8>,
}

impl TextResponse {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::TEXT_RESPONSE)?;
        Ok(TextResponse {
            final_flag: raw.flags & flags::FINAL != 0,
            cont: raw.flags & flags::CONTINUE != 0,
            lun: raw.lun,
            itt: raw.itt,
            ttt: raw.read_u32(0),
            stat_sn: raw.read_u32(4),
            exp_cmd_sn: raw.read_u32(8),
            max_cmd_sn: raw.read_u32(12),
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::TEXT_RESPONSE);
        raw.flags = final_flag(self.final_flag) | if self.cont { flags::CONTINUE } else { 0 };
        raw.lun = self.lun;
        raw.itt = self.itt;
        raw.write_u32(0, self.ttt);
        raw.write_u32(4, self.stat_sn);
        raw.write_u32(8, self.exp_cmd_sn);
        raw.write_u32(12, self.max_cmd_sn);
        raw.data = self.data.clone();
        raw
    }
}

// ============================================================================
// Logout
// ============================================================================

/// Logout Request (opcode 0x06)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    pub immediate: bool,
    pub reason: u8,
    pub itt: u32,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
}

impl LogoutRequest {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::LOGOUT_REQUEST)?;
        Ok(LogoutRequest {
            immediate: raw.immediate,
            reason: raw.flags & 0x7F,
            itt: raw.itt,
            cid: raw.read_u16(0),
            cmd_sn: raw.read_u32(4),
            exp_stat_sn: raw.read_u32(8),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::LOGOUT_REQUEST);
        raw.immediate = self.immediate;
        raw.flags = flags::FINAL | (self.reason & 0x7F);
        raw.itt = self.itt;
        raw.write_u16(0, self.cid);
        raw.write_u32(4, self.cmd_sn);
        raw.write_u32(8, self.exp_stat_sn);
        raw
    }
}

/// Logout Response (opcode 0x26)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutResponse {
    pub response: u8,
    pub itt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub time2wait: u16,
    pub time2retain: u16,
}

impl LogoutResponse {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::LOGOUT_RESPONSE)?;
        Ok(LogoutResponse {
            response: raw.opcode_fields[0],
            itt: raw.itt,
            stat_sn: raw.read_u32(4),
            exp_cmd_sn: raw.read_u32(8),
            max_cmd_sn: raw.read_u32(12),
            time2wait: raw.read_u16(20),
            time2retain: raw.read_u16(22),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::LOGOUT_RESPONSE);
        raw.flags = flags::FINAL;
        raw.opcode_fields[0] = self.response;
        raw.itt = self.itt;
        raw.write_u32(4, self.stat_sn);
        raw.write_u32(8, self.exp_cmd_sn);
        raw.write_u32(12, self.max_cmd_sn);
        raw.write_u16(20, self.time2wait);
        raw.write_u16(22, self.time2retain);
        raw
    }
}

// ============================================================================
// NOP
// ============================================================================

/// NOP-Out (opcode 0x00)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NopOut {
    pub immediate: bool,
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub data: Vec<u8>,
}

impl NopOut {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::NOP_OUT)?;
        Ok(NopOut {
            immediate: raw.immediate,
            lun: raw.lun,
            itt: raw.itt,
            ttt: raw.read_u32(0),
            cmd_sn: raw.read_u32(4),
            exp_stat_sn: raw.read_u32(8),
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::NOP_OUT);
        raw.immediate = self.immediate;
        raw.flags = flags::FINAL;
        raw.lun = self.lun;
        raw.itt = self.itt;
        raw.write_u32(0, self.ttt);
        raw.write_u32(4, self.cmd_sn);
        raw.write_u32(8, self.exp_stat_sn);
        raw.data = self.data.clone();
        raw
    }
}

/// NOP-In (opcode 0x20)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NopIn {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data: Vec<u8>,
}

impl NopIn {
    /// Echo of a NOP-Out ping
    pub fn echo(request: &NopOut) -> Self {
        NopIn {
            lun: request.lun,
            itt: request.itt,
            ttt: RESERVED_TAG,
            stat_sn: 0,
            exp_cmd_sn: 0,
            max_cmd_sn: 0,
            data: request.data.clone(),
        }
    }

    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::NOP_IN)?;
        Ok(NopIn {
            lun: raw.lun,
            itt: raw.itt,
            ttt: raw.read_u32(0),
            stat_sn: raw.read_u32(4),
            exp_cmd_sn: raw.read_u32(8),
            max_cmd_sn: raw.read_u32(12),
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::NOP_IN);
        raw.flags = flags::FINAL;
        raw.lun = self.lun;
        raw.itt = self.itt;
        raw.write_u32(0, self.ttt);
        raw.write_u32(4, self.stat_sn);
        raw.write_u32(8, self.exp_cmd_sn);
        raw.write_u32(12, self.max_cmd_sn);
        raw.data = self.data.clone();
        raw
    }
}

// ============================================================================
// SCSI Command / Response
// ============================================================================

/// SCSI Command (opcode 0x01)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiCommand {
    pub immediate: bool,
    pub final_flag: bool,
    pub read: bool,
    pub write: bool,
    pub attributes: u8,
    /// Extended CDB / bidirectional AHS, carried through untouched
    pub ahs: Vec<u8>,
    pub lun: u64,
    pub itt: u32,
    pub expected_data_length: u32,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    pub cdb: [u8; 16],
    /// Immediate data
    pub data: Vec<u8>,
}

impl ScsiCommand {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::SCSI_COMMAND)?;
        let mut cdb = [0u8; 16];
        cdb.copy_from_slice(&raw.specific[12..28]);
        Ok(ScsiCommand {
            immediate: raw.immediate,
            final_flag: raw.flags & flags::FINAL != 0,
            read: raw.flags & flags::READ != 0,
            write: raw.flags & flags::WRITE != 0,
            attributes: raw.flags & flags::ATTRIBUTE_MASK,
            ahs: raw.ahs.clone(),
            lun: raw.lun,
            itt: raw.itt,
            expected_data_length: raw.read_u32(0),
            cmd_sn: raw.read_u32(4),
            exp_stat_sn: raw.read_u32(8),
            cdb,
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::SCSI_COMMAND);
        raw.immediate = self.immediate;
        raw.flags = final_flag(self.final_flag)
            | if self.read { flags::READ } else { 0 }
            | if self.write { flags::WRITE } else { 0 }
            | (self.attributes & flags::ATTRIBUTE_MASK);
        raw.ahs = self.ahs.clone();
        raw.lun = self.lun;
        raw.itt = self.itt;
        raw.write_u32(0, self.expected_data_length);
        raw.write_u32(4, self.cmd_sn);
        raw.write_u32(8, self.exp_stat_sn);
        raw.specific[12..28].copy_from_slice(&self.cdb);
        raw.data = self.data.clone();
        raw
    }
}

/// SCSI Response (opcode 0x21)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScsiResponse {
    pub bidi_overflow: bool,
    pub bidi_underflow: bool,
    pub overflow: bool,
    pub underflow: bool,
    /// iSCSI service response, 0x00 = command completed at target
    pub response: u8,
    pub status: u8,
    pub itt: u32,
    pub snack_tag: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub exp_data_sn: u32,
    pub bidi_residual_count: u32,
    pub residual_count: u32,
    /// SenseLength-prefixed sense data or response data
    pub data: Vec<u8>,
}

impl ScsiResponse {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::SCSI_RESPONSE)?;
        Ok(ScsiResponse {
            bidi_overflow: raw.flags & 0x10 != 0,
            bidi_underflow: raw.flags & 0x08 != 0,
            overflow: raw.flags & flags::OVERFLOW != 0,
            underflow: raw.flags & flags::UNDERFLOW != 0,
            response: raw.opcode_fields[0],
            status: raw.opcode_fields[1],
            itt: raw.itt,
            snack_tag: raw.read_u32(0),
            stat_sn: raw.read_u32(4),
            exp_cmd_sn: raw.read_u32(8),
            max_cmd_sn: raw.read_u32(12),
            exp_data_sn: raw.read_u32(16),
            bidi_residual_count: raw.read_u32(20),
            residual_count: raw.read_u32(24),
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::SCSI_RESPONSE);
        raw.flags = flags::FINAL
            | if self.bidi_overflow { 0x10 } else { 0 }
            | if self.bidi_underflow { 0x08 } else { 0 }
            | if self.overflow { flags::OVERFLOW } else { 0 }
            | if self.underflow { flags::UNDERFLOW } else { 0 };
        raw.opcode_fields = [self.response, self.status];
        raw.itt = self.itt;
        raw.write_u32(0, self.snack_tag);
        raw.write_u32(4, self.stat_sn);
        raw.write_u32(8, self.exp_cmd_sn);
        raw.write_u32(12, self.max_cmd_sn);
        raw.write_u32(16, self.exp_data_sn);
        raw.write_u32(20, self.bidi_residual_count);
        raw.write_u32(24, self.residual_count);
        raw.data = self.data.clone();
        raw
    }
}

// ============================================================================
// Data transfer
// ============================================================================

/// SCSI Data-Out (opcode 0x05)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScsiDataOut {
    pub final_flag: bool,
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub exp_stat_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub data: Vec<u8>,
}

impl ScsiDataOut {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::SCSI_DATA_OUT)?;
        Ok(ScsiDataOut {
            final_flag: raw.flags & flags::FINAL != 0,
            lun: raw.lun,
            itt: raw.itt,
            ttt: raw.read_u32(0),
            exp_stat_sn: raw.read_u32(8),
            data_sn: raw.read_u32(16),
            buffer_offset: raw.read_u32(20),
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::SCSI_DATA_OUT);
        raw.flags = final_flag(self.final_flag);
        raw.lun = self.lun;
        raw.itt = self.itt;
        raw.write_u32(0, self.ttt);
        raw.write_u32(8, self.exp_stat_sn);
        raw.write_u32(16, self.data_sn);
        raw.write_u32(20, self.buffer_offset);
        raw.data = self.data.clone();
        raw
    }
}

/// SCSI Data-In (opcode 0x25)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScsiDataIn {
    pub final_flag: bool,
    pub acknowledge: bool,
    pub overflow: bool,
    pub underflow: bool,
    /// Some(status) sets the S bit (phase collapse)
    pub status: Option<u8>,
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
    pub buffer_offset: u32,
    pub residual_count: u32,
    pub data: Vec<u8>,
}

impl ScsiDataIn {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::SCSI_DATA_IN)?;
        let status_present = raw.flags & flags::STATUS_PRESENT != 0;
        Ok(ScsiDataIn {
            final_flag: raw.flags & flags::FINAL != 0,
            acknowledge: raw.flags & flags::ACKNOWLEDGE != 0,
            overflow: raw.flags & flags::OVERFLOW != 0,
            underflow: raw.flags & flags::UNDERFLOW != 0,
            status: status_present.then_some(raw.opcode_fields[1]),
            lun: raw.lun,
            itt: raw.itt,
            ttt: raw.read_u32(0),
            stat_sn: raw.read_u32(4),
            exp_cmd_sn: raw.read_u32(8),
            max_cmd_sn: raw.read_u32(12),
            data_sn: raw.read_u32(16),
            buffer_offset: raw.read_u32(20),
            residual_count: raw.read_u32(24),
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::SCSI_DATA_IN);
        raw.flags = final_flag(self.final_flag)
            | if self.acknowledge { flags::ACKNOWLEDGE } else { 0 }
            | if self.overflow { flags::OVERFLOW } else { 0 }
            | if self.underflow { flags::UNDERFLOW } else { 0 }
            | if self.status.is_some() { flags::STATUS_PRESENT } else { 0 };
        raw.opcode_fields[1] = self.status.unwrap_or(0);
        raw.lun = self.lun;
        raw.itt = self.itt;
        raw.write_u32(0, self.ttt);
        raw.write_u32(4, self.stat_sn);
        raw.write_u32(8, self.exp_cmd_sn);
        raw.write_u32(12, self.max_cmd_sn);
        raw.write_u32(16, self.data_sn);
        raw.write_u32(20, self.buffer_offset);
        raw.write_u32(24, self.residual_count);
        raw.data = self.data.clone();
        raw
    }
}

/// Ready To Transfer (opcode 0x31)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyToTransfer {
    pub lun: u64,
    pub itt: u32,
    pub ttt: u32,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub r2t_sn: u32,
    pub buffer_offset: u32,
    pub desired_length: u32,
}

impl ReadyToTransfer {
    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::R2T)?;
        Ok(ReadyToTransfer {
            lun: raw.lun,
            itt: raw.itt,
            ttt: raw.read_u32(0),
            stat_sn: raw.read_u32(4),
            exp_cmd_sn: raw.read_u32(8),
            max_cmd_sn: raw.read_u32(12),
            r2t_sn: raw.read_u32(16),
            buffer_offset: raw.read_u32(20),
            desired_length: raw.read_u32(24),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::R2T);
        raw.flags = flags::FINAL;
        raw.lun = self.lun;
        raw.itt = self.itt;
        raw.write_u32(0, self.ttt);
        raw.write_u32(4, self.stat_sn);
        raw.write_u32(8, self.exp_cmd_sn);
        raw.write_u32(12, self.max_cmd_sn);
        raw.write_u32(16, self.r2t_sn);
        raw.write_u32(20, self.buffer_offset);
        raw.write_u32(24, self.desired_length);
        raw
    }
}

// ============================================================================
// Reject
// ============================================================================

/// Reject (opcode 0x3F)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reject {
    pub reason: u8,
    pub stat_sn: u32,
    pub exp_cmd_sn: u32,
    pub max_cmd_sn: u32,
    pub data_sn: u32,
    /// Header of the rejected PDU
    pub data: Vec<u8>,
}

impl Reject {
    /// Reject the PDU whose encoded bytes are `rejected`
    pub fn new(reason: u8, rejected: &[u8]) -> Self {
        Reject {
            reason,
            stat_sn: 0,
            exp_cmd_sn: 0,
            max_cmd_sn: 0,
            data_sn: 0,
            data: reject_payload(rejected),
        }
    }

    pub fn from_raw(raw: &IscsiPdu) -> ScsiResult<Self> {
        expect_opcode(raw, opcode::REJECT)?;
        Ok(Reject {
            reason: raw.opcode_fields[0],
            stat_sn: raw.read_u32(4),
            exp_cmd_sn: raw.read_u32(8),
            max_cmd_sn: raw.read_u32(12),
            data_sn: raw.read_u32(16),
            data: raw.data.clone(),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        let mut raw = IscsiPdu::new(opcode::REJECT);
        raw.flags = flags::FINAL;
        raw.opcode_fields[0] = self.reason;
        raw.itt = RESERVED_TAG;
        raw.write_u32(4, self.stat_sn);
        raw.write_u32(8, self.exp_cmd_sn);
        raw.write_u32(12, self.max_cmd_sn);
        raw.write_u32(16, self.data_sn);
        raw.data = self.data.clone();
        raw
    }
}

// ============================================================================
// Pdu
// ============================================================================

/// A decoded iSCSI PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    NopOut(NopOut),
    ScsiCommand(ScsiCommand),
    LoginRequest(LoginRequest),
    TextRequest(TextRequest),
    ScsiDataOut(ScsiDataOut),
    LogoutRequest(LogoutRequest),
    NopIn(NopIn),
    ScsiResponse(ScsiResponse),
    LoginResponse(LoginResponse),
    TextResponse(TextResponse),
    ScsiDataIn(ScsiDataIn),
    LogoutResponse(LogoutResponse),
    ReadyToTransfer(ReadyToTransfer),
    Reject(Reject),
    /// Framed correctly, but the opcode is not one the server implements
    Unsupported(IscsiPdu),
}

impl Pdu {
    /// Decode one complete PDU
    pub fn decode(bytes: &[u8]) -> Result<Pdu, DecodeError> {
        let fail = |source: IscsiError| DecodeError {
            name: bytes.first().map_or("Unknown", |b| opcode_name(b & 0x3F)),
            header: reject_payload(bytes),
            source,
        };
        let raw = IscsiPdu::from_bytes(bytes).map_err(fail)?;
        Pdu::from_raw(raw).map_err(fail)
    }

    pub fn from_raw(raw: IscsiPdu) -> ScsiResult<Pdu> {
        Ok(match raw.opcode {
            opcode::NOP_OUT => Pdu::NopOut(NopOut::from_raw(&raw)?),
            opcode::SCSI_COMMAND => Pdu::ScsiCommand(ScsiCommand::from_raw(&raw)?),
            opcode::LOGIN_REQUEST => Pdu::LoginRequest(LoginRequest::from_raw(&raw)?),
            opcode::TEXT_REQUEST => Pdu::TextRequest(TextRequest::from_raw(&raw)?),
            opcode::SCSI_DATA_OUT => Pdu::ScsiDataOut(ScsiDataOut::from_raw(&raw)?),
            opcode::LOGOUT_REQUEST => Pdu::LogoutRequest(LogoutRequest::from_raw(&raw)?),
            opcode::NOP_IN => Pdu::NopIn(NopIn::from_raw(&raw)?),
            opcode::SCSI_RESPONSE => Pdu::ScsiResponse(ScsiResponse::from_raw(&raw)?),
            opcode::LOGIN_RESPONSE => Pdu::LoginResponse(LoginResponse::from_raw(&raw)?),
            opcode::TEXT_RESPONSE => Pdu::TextResponse(TextResponse::from_raw(&raw)?),
            opcode::SCSI_DATA_IN => Pdu::ScsiDataIn(ScsiDataIn::from_raw(&raw)?),
            opcode::LOGOUT_RESPONSE => Pdu::LogoutResponse(LogoutResponse::from_raw(&raw)?),
            opcode::R2T => Pdu::ReadyToTransfer(ReadyToTransfer::from_raw(&raw)?),
            opcode::REJECT => Pdu::Reject(Reject::from_raw(&raw)?),
            _ => Pdu::Unsupported(raw),
        })
    }

    pub fn to_raw(&self) -> IscsiPdu {
        match self {
            Pdu::NopOut(p) => p.to_raw(),
            Pdu::ScsiCommand(p) => p.to_raw(),
            Pdu::LoginRequest(p) => p.to_raw(),
            Pdu::TextRequest(p) => p.to_raw(),
            Pdu::ScsiDataOut(p) => p.to_raw(),
            Pdu::LogoutRequest(p) => p.to_raw(),
            Pdu::NopIn(p) => p.to_raw(),
            Pdu::ScsiResponse(p) => p.to_raw(),
            Pdu::LoginResponse(p) => p.to_raw(),
            Pdu::TextResponse(p) => p.to_raw(),
            Pdu::ScsiDataIn(p) => p.to_raw(),
            Pdu::LogoutResponse(p) => p.to_raw(),
            Pdu::ReadyToTransfer(p) => p.to_raw(),
            Pdu::Reject(p) => p.to_raw(),
            Pdu::Unsupported(raw) => raw.clone(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_raw().to_bytes()
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Pdu::NopOut(_) => opcode::NOP_OUT,
            Pdu::ScsiCommand(_) => opcode::SCSI_COMMAND,
            Pdu::LoginRequest(_) => opcode::LOGIN_REQUEST,
            Pdu::TextRequest(_) => opcode::TEXT_REQUEST,
            Pdu::ScsiDataOut(_) => opcode::SCSI_DATA_OUT,
            Pdu::LogoutRequest(_) => opcode::LOGOUT_REQUEST,
            Pdu::NopIn(_) => opcode::NOP_IN,
            Pdu::ScsiResponse(_) => opcode::SCSI_RESPONSE,
            Pdu::LoginResponse(_) => opcode::LOGIN_RESPONSE,
            Pdu::TextResponse(_) => opcode::TEXT_RESPONSE,
            Pdu::ScsiDataIn(_) => opcode::SCSI_DATA_IN,
            Pdu::LogoutResponse(_) => opcode::LOGOUT_RESPONSE,
            Pdu::ReadyToTransfer(_) => opcode::R2T,
            Pdu::Reject(_) => opcode::REJECT,
            Pdu::Unsupported(raw) => raw.opcode,
        }
    }

    pub fn name(&self) -> &'static str {
        opcode_name(self.opcode())
    }

    /// Initiator task tag, or the reserved tag for PDUs that carry none
    pub fn itt(&self) -> u32 {
        match self {
            Pdu::NopOut(p) => p.itt,
            Pdu::ScsiCommand(p) => p.itt,
            Pdu::LoginRequest(p) => p.itt,
            Pdu::TextRequest(p) => p.itt,
            Pdu::ScsiDataOut(p) => p.itt,
            Pdu::LogoutRequest(p) => p.itt,
            Pdu::NopIn(p) => p.itt,
            Pdu::ScsiResponse(p) => p.itt,
            Pdu::LoginResponse(p) => p.itt,
            Pdu::TextResponse(p) => p.itt,
            Pdu::ScsiDataIn(p) => p.itt,
            Pdu::LogoutResponse(p) => p.itt,
            Pdu::ReadyToTransfer(p) => p.itt,
            Pdu::Reject(_) => RESERVED_TAG,
            Pdu::Unsupported(raw) => raw.itt,
        }
    }

    /// CmdSN for the initiator requests that are numbered
    pub fn cmd_sn(&self) -> Option<u32> {
        match self {
            Pdu::NopOut(p) => Some(p.cmd_sn),
            Pdu::ScsiCommand(p) => Some(p.cmd_sn),
            Pdu::LoginRequest(p) => Some(p.cmd_sn),
            Pdu::TextRequest(p) => Some(p.cmd_sn),
            Pdu::LogoutRequest(p) => Some(p.cmd_sn),
            _ => None,
        }
    }

    pub fn is_immediate(&self) -> bool {
        match self {
            Pdu::NopOut(p) => p.immediate,
            Pdu::ScsiCommand(p) => p.immediate,
            Pdu::LoginRequest(_) => true,
            Pdu::TextRequest(p) => p.immediate,
            Pdu::LogoutRequest(p) => p.immediate,
            Pdu::Unsupported(raw) => raw.immediate,
            _ => false,
        }
    }

    /// Whether accepting this PDU consumes a CmdSN
    pub fn advances_cmd_sn(&self) -> bool {
        matches!(
            self,
            Pdu::LogoutRequest(_) | Pdu::TextRequest(_) | Pdu::ScsiCommand(_) | Pdu::Reject(_)
        ) && !self.is_immediate()
    }

    /// Whether sending this PDU consumes a StatSN
    pub fn advances_stat_sn(&self) -> bool {
        match self {
            Pdu::ScsiResponse(_)
            | Pdu::LoginResponse(_)
            | Pdu::TextResponse(_)
            | Pdu::LogoutResponse(_)
            | Pdu::NopIn(_)
            | Pdu::Reject(_) => true,
            Pdu::ScsiDataIn(p) => p.status.is_some(),
            _ => false,
        }
    }

    /// Stamp the StatSN of an outbound PDU
    pub fn set_stat_sn(&mut self, stat_sn: u32) {
        match self {
            Pdu::NopIn(p) => p.stat_sn = stat_sn,
            Pdu::ScsiResponse(p) => p.stat_sn = stat_sn,
            Pdu::LoginResponse(p) => p.stat_sn = stat_sn,
            Pdu::TextResponse(p) => p.stat_sn = stat_sn,
            Pdu::ScsiDataIn(p) if p.status.is_some() => p.stat_sn = stat_sn,
            Pdu::LogoutResponse(p) => p.stat_sn = stat_sn,
            Pdu::ReadyToTransfer(p) => p.stat_sn = stat_sn,
            Pdu::Reject(p) => p.stat_sn = stat_sn,
            _ => {}
        }
    }

    /// Stamp the command window of an outbound PDU
    pub fn set_exp_cmd_sn(&mut self, exp_cmd_sn: u32, max_cmd_sn: u32) {
        let window = match self {
            Pdu::NopIn(p) => Some((&mut p.exp_cmd_sn, &mut p.max_cmd_sn)),
            Pdu::ScsiResponse(p) => Some((&mut p.exp_cmd_sn, &mut p.max_cmd_sn)),
            Pdu::LoginResponse(p) => Some((&mut p.exp_cmd_sn, &mut p.max_cmd_sn)),
            Pdu::TextResponse(p) => Some((&mut p.exp_cmd_sn, &mut p.max_cmd_sn)),
            Pdu::ScsiDataIn(p) => Some((&mut p.exp_cmd_sn, &mut p.max_cmd_sn)),
            Pdu::LogoutResponse(p) => Some((&mut p.exp_cmd_sn, &mut p.max_cmd_sn)),
            Pdu::ReadyToTransfer(p) => Some((&mut p.exp_cmd_sn, &mut p.max_cmd_sn)),
            Pdu::Reject(p) => Some((&mut p.exp_cmd_sn, &mut p.max_cmd_sn)),
            _ => None,
        };
        if let Some((exp, max)) = window {
            *exp = exp_cmd_sn;
            *max = max_cmd_sn;
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
