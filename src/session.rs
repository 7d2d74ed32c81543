//! iSCSI session state
//!
//! A [`Session`] is shared by every connection that logged in with the same
//! (ISID, TSIH). It owns the negotiated session parameters and the command
//! sequencing state (ExpCmdSN) based on RFC 3720 Section 3.2.2.1:
//! https://datatracker.ietf.org/doc/html/rfc3720#section-3.2.2.1

use crate::messages::Pdu;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Session type (RFC 3720 Section 5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionType {
    /// Normal session for SCSI commands
    #[default]
    Normal,
    /// Discovery session for target discovery (SendTargets)
    Discovery,
}

/// Negotiated session parameters (RFC 3720 Section 12)
///
/// Until a key is negotiated it holds the RFC default value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParameters {
    /// Initiator Session ID (6 bytes)
    pub isid: [u8; 6],
    /// Target Session Identifying Handle, 0 until assigned
    pub tsih: u16,
    pub session_type: SessionType,
    pub initiator_name: String,
    pub target_name: String,

    // Command numbering
    /// Next CmdSN the target expects
    pub exp_cmd_sn: u32,
    /// Set once the first numbered PDU fixed the ExpCmdSN baseline
    pub command_numbering_started: bool,
    /// Width of the command window (MaxCmdSN = ExpCmdSN + CommandQueueSize)
    pub command_queue_size: u32,
    /// Set when the first connection reached full feature phase
    pub full_feature_phase: bool,

    // Negotiated values
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub max_burst_length: u32,
    pub first_burst_length: u32,
    pub default_time2wait: u16,
    pub default_time2retain: u16,
    pub max_outstanding_r2t: u32,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    pub error_recovery_level: u8,
    pub max_connections: u16,
}

impl Default for SessionParameters {
    fn default() -> Self {
        SessionParameters {
            isid: [0u8; 6],
            tsih: 0,
            session_type: SessionType::Normal,
            initiator_name: String::new(),
            target_name: String::new(),
            exp_cmd_sn: 0,
            command_numbering_started: false,
            command_queue_size: 64,
            full_feature_phase: false,
            initial_r2t: true,
            immediate_data: true,
            max_burst_length: 262144,
            first_burst_length: 65536,
            default_time2wait: 2,
            default_time2retain: 20,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
            max_connections: 1,
        }
    }
}

impl SessionParameters {
    pub fn is_discovery(&self) -> bool {
        self.session_type == SessionType::Discovery
    }

    /// MaxCmdSN advertised to the initiator
    pub fn max_cmd_sn(&self) -> u32 {
        self.exp_cmd_sn.wrapping_add(self.command_queue_size)
    }

    /// Apply the CmdSN ordering rule to an inbound PDU.
    ///
    /// PDUs without a CmdSN are always accepted. The first numbered PDU fixes
    /// the baseline; after that only `CmdSN == ExpCmdSN` is accepted, and a
    /// rejected PDU leaves the state untouched.
    pub fn check_cmd_sn(&mut self, pdu: &Pdu) -> CmdSnCheck {
        let Some(cmd_sn) = pdu.cmd_sn() else {
            return CmdSnCheck::Unnumbered;
        };

        if self.command_numbering_started {
            if cmd_sn != self.exp_cmd_sn {
                return CmdSnCheck::OutOfOrder {
                    expected: self.exp_cmd_sn,
                    received: cmd_sn,
                };
            }
        } else {
            self.exp_cmd_sn = cmd_sn;
            self.command_numbering_started = true;
        }

        if pdu.advances_cmd_sn() {
            self.exp_cmd_sn = self.exp_cmd_sn.wrapping_add(1);
        }
        CmdSnCheck::Accepted
    }
}

/// Result of [`SessionParameters::check_cmd_sn`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdSnCheck {
    Unnumbered,
    Accepted,
    OutOfOrder { expected: u32, received: u32 },
}

impl CmdSnCheck {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, CmdSnCheck::OutOfOrder { .. })
    }
}

/// iSCSI session shared between its connections
#[derive(Debug, Default)]
pub struct Session {
    params: Mutex<SessionParameters>,
}

impl Session {
    pub fn new(params: SessionParameters) -> Self {
        Session {
            params: Mutex::new(params),
        }
    }

    /// Lock the session parameters
    pub fn params(&self) -> MutexGuard<'_, SessionParameters> {
        self.params.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// (ISID, TSIH) identity
    pub fn identity(&self) -> ([u8; 6], u16) {
        let params = self.params();
        (params.isid, params.tsih)
    }

    /// (ExpCmdSN, MaxCmdSN) to stamp on an outbound PDU
    pub fn command_window(&self) -> (u32, u32) {
        let params = self.params();
        (params.exp_cmd_sn, params.max_cmd_sn())
    }

    pub fn is_discovery(&self) -> bool {
        self.params().is_discovery()
    }
}

/// Format an ISID the way logs show it
pub struct IsidDisplay<'a>(pub &'a [u8; 6]);

impl fmt::Display for IsidDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Allocates TSIH values for new sessions.
///
/// Values increase monotonically, wrap past `0xFFFF` back to 1 and never
/// yield 0.
#[derive(Debug)]
pub struct TsihAllocator {
    next: Mutex<u16>,
}

impl Default for TsihAllocator {
    fn default() -> Self {
        TsihAllocator::new(1)
    }
}

impl TsihAllocator {
    pub fn new(first: u16) -> Self {
        TsihAllocator {
            next: Mutex::new(first.max(1)),
        }
    }

    /// Return the next TSIH for which `in_use` is false.
    ///
    /// Returns `None` only when every non-zero value is taken.
    pub fn allocate(&self, in_use: impl Fn(u16) -> bool) -> Option<u16> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..u16::MAX {
            let tsih = *next;
            *next = next.wrapping_add(1);
            if *next == 0 {
                *next = 1;
            }
            if !in_use(tsih) {
                return Some(tsih);
            }
        }
        None
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{LogoutRequest, NopOut, ScsiCommand, ScsiDataOut};
    use crate::pdu::RESERVED_TAG;

    fn command(cmd_sn: u32, immediate: bool) -> Pdu {
        Pdu::ScsiCommand(ScsiCommand {
            immediate,
            final_flag: true,
            read: false,
            write: false,
            attributes: 0,
            ahs: Vec::new(),
            lun: 0,
            itt: cmd_sn,
            expected_data_length: 0,
            cmd_sn,
            exp_stat_sn: 0,
            cdb: [0u8; 16],
            data: Vec::new(),
        })
    }

    #[test]
    fn test_session_params_default() {
        let params = SessionParameters::default();
        assert_eq!(params.tsih, 0);
        assert!(!params.command_numbering_started);
        assert_eq!(params.max_burst_length, 262144);
        assert_eq!(params.first_burst_length, 65536);
        assert_eq!(params.error_recovery_level, 0);
        assert!(params.initial_r2t);
        assert!(params.data_pdu_in_order);
        assert!(!params.is_discovery());
    }

    #[test]
    fn test_first_numbered_pdu_sets_baseline() {
        let mut params = SessionParameters::default();
        assert_eq!(params.check_cmd_sn(&command(100, false)), CmdSnCheck::Accepted);
        assert!(params.command_numbering_started);
        assert_eq!(params.exp_cmd_sn, 101);
        assert_eq!(params.max_cmd_sn(), 165);
    }

    #[test]
    fn test_out_of_order_is_dropped_without_mutation() {
        let mut params = SessionParameters::default();
        params.check_cmd_sn(&command(10, false));
        let before = params.clone();

        let check = params.check_cmd_sn(&command(12, false));
        assert_eq!(
            check,
            CmdSnCheck::OutOfOrder {
                expected: 11,
                received: 12
            }
        );
        assert!(!check.is_accepted());
        assert_eq!(params, before);

        assert!(params.check_cmd_sn(&command(11, false)).is_accepted());
        assert_eq!(params.exp_cmd_sn, 12);
    }

    #[test]
    fn test_immediate_and_nop_do_not_advance() {
        let mut params = SessionParameters::default();
        params.check_cmd_sn(&command(5, true));
        assert_eq!(params.exp_cmd_sn, 5);

        let nop = Pdu::NopOut(NopOut {
            immediate: false,
            lun: 0,
            itt: 1,
            ttt: RESERVED_TAG,
            cmd_sn: 5,
            exp_stat_sn: 0,
            data: Vec::new(),
        });
        assert!(params.check_cmd_sn(&nop).is_accepted());
        assert_eq!(params.exp_cmd_sn, 5);

        let logout = Pdu::LogoutRequest(LogoutRequest {
            immediate: false,
            reason: 0,
            itt: 2,
            cid: 0,
            cmd_sn: 5,
            exp_stat_sn: 0,
        });
        assert!(params.check_cmd_sn(&logout).is_accepted());
        assert_eq!(params.exp_cmd_sn, 6);
    }

    #[test]
    fn test_unnumbered_pdu_always_accepted() {
        let mut params = SessionParameters::default();
        params.check_cmd_sn(&command(7, false));
        let data_out = Pdu::ScsiDataOut(ScsiDataOut {
            final_flag: true,
            lun: 0,
            itt: 1,
            ttt: 1,
            exp_stat_sn: 0,
            data_sn: 0,
            buffer_offset: 0,
            data: Vec::new(),
        });
        assert_eq!(params.check_cmd_sn(&data_out), CmdSnCheck::Unnumbered);
        assert_eq!(params.exp_cmd_sn, 8);
    }

    #[test]
    fn test_cmd_sn_wraps() {
        let mut params = SessionParameters::default();
        params.check_cmd_sn(&command(u32::MAX, false));
        assert_eq!(params.exp_cmd_sn, 0);
        assert!(params.check_cmd_sn(&command(0, false)).is_accepted());
    }

    #[test]
    fn test_tsih_never_zero_and_wraps() {
        let allocator = TsihAllocator::new(0xFFFE);
        assert_eq!(allocator.allocate(|_| false), Some(0xFFFE));
        assert_eq!(allocator.allocate(|_| false), Some(0xFFFF));
        assert_eq!(allocator.allocate(|_| false), Some(1));
        assert_eq!(allocator.allocate(|_| false), Some(2));
    }

    #[test]
    fn test_tsih_monotonic_without_repeats() {
        let allocator = TsihAllocator::default();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let tsih = allocator.allocate(|_| false).unwrap();
            assert_ne!(tsih, 0);
            assert!(seen.insert(tsih));
        }
    }

    #[test]
    fn test_tsih_skips_live_sessions() {
        let allocator = TsihAllocator::default();
        assert_eq!(allocator.allocate(|t| t == 1 || t == 2), Some(3));
        assert_eq!(allocator.allocate(|_| true), None);
    }

    #[test]
    fn test_session_window() {
        let session = Session::new(SessionParameters {
            exp_cmd_sn: 10,
            command_queue_size: 4,
            ..Default::default()
        });
        assert_eq!(session.command_window(), (10, 14));
    }

    #[test]
    fn test_isid_display() {
        let isid = [0x80, 0x12, 0x34, 0x56, 0x78, 0x9a];
        assert_eq!(IsidDisplay(&isid).to_string(), "80123456789a");
    }
}
