//! Session-offer defaults and configuration loading
//!
//! [`OfferedParameters`] holds the values the target offers during login
//! negotiation (RFC 3720 Section 12). They are fixed when the server is built
//! and read by every login that follows.

use crate::error::{IscsiError, ScsiResult};

/// Default iSCSI port
pub const DEFAULT_PORT: u16 = 3260;

/// Default listen address
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3260";

/// Session parameters the target offers to initiators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedParameters {
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
    /// Declared by the target, not negotiated
    pub max_recv_data_segment_length: u32,
    /// Width of the command window advertised through MaxCmdSN
    pub command_queue_size: u32,
}

impl Default for OfferedParameters {
    fn default() -> Self {
        OfferedParameters {
            initial_r2t: true,
            immediate_data: true,
            max_burst_length: 262144,
            first_burst_length: 65536,
            default_time2wait: 0,
            default_time2retain: 20,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
            max_connections: 1,
            max_recv_data_segment_length: 8192,
            command_queue_size: 64,
        }
    }
}

impl OfferedParameters {
    /// Load offered parameters from the `[session]` table of a TOML document.
    ///
    /// Keys use the RFC 3720 names (`MaxBurstLength`, `InitialR2T`, ...) plus
    /// `CommandQueueSize`. Booleans may be written as TOML booleans or as
    /// `"Yes"`/`"No"`. Keys not present keep their default.
    ///
    /// ```toml
    /// [session]
    /// InitialR2T = "No"
    /// MaxBurstLength = 131072
    /// ```
    pub fn from_toml_str(source: &str) -> ScsiResult<Self> {
        let document: toml::Table = source
            .parse()
            .map_err(|e: toml::de::Error| IscsiError::Config(format!("Invalid TOML: {}", e)))?;

        let mut offered = OfferedParameters::default();
        let session = match document.get("session") {
            Some(toml::Value::Table(table)) => table,
            Some(_) => {
                return Err(IscsiError::Config(
                    "[session] must be a table".to_string(),
                ))
            }
            None => return Ok(offered),
        };

        for (key, value) in session {
            match key.as_str() {
                "InitialR2T" => offered.initial_r2t = toml_bool(key, value)?,
                "ImmediateData" => offered.immediate_data = toml_bool(key, value)?,
                "MaxBurstLength" => offered.max_burst_length = toml_int(key, value, 512, 0xFF_FFFF)?,
                "FirstBurstLength" => {
                    offered.first_burst_length = toml_int(key, value, 512, 0xFF_FFFF)?
                }
                "DefaultTime2Wait" => offered.default_time2wait = toml_int(key, value, 0, 3600)?,
                "DefaultTime2Retain" => {
                    offered.default_time2retain = toml_int(key, value, 0, 3600)?
                }
                "MaxOutstandingR2T" => offered.max_outstanding_r2t = toml_int(key, value, 1, 65535)?,
                "DataPDUInOrder" => offered.data_pdu_in_order = toml_bool(key, value)?,
                "DataSequenceInOrder" => offered.data_sequence_in_order = toml_bool(key, value)?,
                "ErrorRecoveryLevel" => offered.error_recovery_level = toml_int(key, value, 0, 2)?,
                "MaxConnections" => offered.max_connections = toml_int(key, value, 1, 65535)?,
                "MaxRecvDataSegmentLength" => {
                    offered.max_recv_data_segment_length = toml_int(key, value, 512, 0xFF_FFFF)?
                }
                "CommandQueueSize" => offered.command_queue_size = toml_int(key, value, 1, 65535)?,
                _ => {
                    return Err(IscsiError::Config(format!(
                        "Unknown session parameter: {}",
                        key
                    )))
                }
            }
        }

        if offered.first_burst_length > offered.max_burst_length {
            return Err(IscsiError::Config(format!(
                "FirstBurstLength ({}) exceeds MaxBurstLength ({})",
                offered.first_burst_length, offered.max_burst_length
            )));
        }

        Ok(offered)
    }
}

fn toml_bool(key: &str, value: &toml::Value) -> ScsiResult<bool> {
    match value {
        toml::Value::Boolean(b) => Ok(*b),
        toml::Value::String(s) => parse_yes_no(s)
            .ok_or_else(|| IscsiError::Config(format!("{} must be Yes or No, got {:?}", key, s))),
        other => Err(IscsiError::Config(format!(
            "{} must be a boolean, got {}",
            key,
            other.type_str()
        ))),
    }
}

fn toml_int<T: TryFrom<i64>>(key: &str, value: &toml::Value, min: i64, max: i64) -> ScsiResult<T> {
    let n = value
        .as_integer()
        .ok_or_else(|| IscsiError::Config(format!("{} must be an integer", key)))?;
    if n < min || n > max {
        return Err(IscsiError::Config(format!(
            "{} = {} is outside {}..={}",
            key, n, min, max
        )));
    }
    T::try_from(n).map_err(|_| IscsiError::Config(format!("{} = {} does not fit", key, n)))
}

/// Parse an iSCSI boolean value
pub fn parse_yes_no(value: &str) -> Option<bool> {
    match value {
        "Yes" => Some(true),
        "No" => Some(false),
        _ => None,
    }
}

/// Render an iSCSI boolean value
pub fn yes_no(value: bool) -> &'static str {
    if value {
        "Yes"
    } else {
        "No"
    }
}

/// Check that a target name uses one of the iSCSI name formats
pub fn validate_target_name(name: &str) -> ScsiResult<()> {
    let lower = name.to_ascii_lowercase();
    if ["iqn.", "eui.", "naa."].iter().any(|p| lower.starts_with(p)) && name.len() <= 223 {
        Ok(())
    } else {
        Err(IscsiError::Config(format!(
            "target name must be in IQN, EUI or NAA format (e.g., iqn.2025-12.local:storage.disk1), got {:?}",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let offered = OfferedParameters::default();
        assert!(offered.initial_r2t);
        assert!(offered.immediate_data);
        assert_eq!(offered.max_burst_length, 262144);
        assert_eq!(offered.first_burst_length, 65536);
        assert_eq!(offered.default_time2wait, 0);
        assert_eq!(offered.default_time2retain, 20);
        assert_eq!(offered.max_connections, 1);
        assert_eq!(offered.command_queue_size, 64);
    }

    #[test]
    fn test_from_toml() {
        let offered = OfferedParameters::from_toml_str(
            r#"
            [session]
            InitialR2T = "No"
            ImmediateData = false
            MaxBurstLength = 131072
            MaxConnections = 4
            CommandQueueSize = 16
            "#,
        )
        .unwrap();

        assert!(!offered.initial_r2t);
        assert!(!offered.immediate_data);
        assert_eq!(offered.max_burst_length, 131072);
        assert_eq!(offered.max_connections, 4);
        assert_eq!(offered.command_queue_size, 16);
        assert_eq!(offered.first_burst_length, 65536);
    }

    #[test]
    fn test_missing_table_keeps_defaults() {
        let offered = OfferedParameters::from_toml_str("[other]\nkey = 1\n").unwrap();
        assert_eq!(offered, OfferedParameters::default());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = OfferedParameters::from_toml_str("[session]\nMaxBurst = 1\n").unwrap_err();
        assert!(matches!(err, IscsiError::Config(_)));
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(OfferedParameters::from_toml_str("[session]\nErrorRecoveryLevel = 3\n").is_err());
        assert!(OfferedParameters::from_toml_str("[session]\nInitialR2T = \"maybe\"\n").is_err());
        assert!(OfferedParameters::from_toml_str(
            "[session]\nFirstBurstLength = 1048576\nMaxBurstLength = 65536\n"
        )
        .is_err());
    }

    #[test]
    fn test_validate_target_name() {
        assert!(validate_target_name("iqn.2025-12.local:storage.disk1").is_ok());
        assert!(validate_target_name("naa.60000000000000001").is_ok());
        assert!(validate_target_name("disk1").is_err());
    }

    #[test]
    fn test_yes_no() {
        assert_eq!(parse_yes_no("Yes"), Some(true));
        assert_eq!(parse_yes_no("No"), Some(false));
        assert_eq!(parse_yes_no("yes"), None);
        assert_eq!(yes_no(true), "Yes");
    }
}
