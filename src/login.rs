//! Login negotiation
//!
//! Builds the Login Response for one Login Request: resolves or creates the
//! session, checks the required keys and the authorization hook, negotiates
//! the offered keys with the RFC 3720 result functions (Section 12) and
//! decides the stage transition.
//!
//! Only control-flow matters here; a failed login answers with the status
//! code and an empty data segment.

use crate::config::{parse_yes_no, yes_no, OfferedParameters};
use crate::connection::ConnectionState;
use crate::messages::{LoginRequest, LoginResponse};
use crate::pdu::{login_status, serialize_text_parameters, stage};
use crate::server::ServerContext;
use crate::session::{IsidDisplay, SessionParameters, SessionType};
use crate::target::find_target;
use std::ops::RangeInclusive;

const NOT_UNDERSTOOD: &str = "NotUnderstood";
const IRRELEVANT: &str = "Irrelevant";
const REJECT: &str = "Reject";

/// Keys that only apply to normal sessions
const DISCOVERY_IRRELEVANT: &[&str] = &[
    "MaxConnections",
    "InitialR2T",
    "ImmediateData",
    "MaxBurstLength",
    "FirstBurstLength",
    "MaxOutstandingR2T",
    "DataPDUInOrder",
    "DataSequenceInOrder",
];

/// Keys the initiator declares that need no answer
const DECLARATIVE: &[&str] = &["InitiatorName", "TargetName", "SessionType", "InitiatorAlias"];

const SEGMENT_LENGTH_RANGE: RangeInclusive<u32> = 512..=16_777_215;

struct LoginFailure {
    status: u16,
    reason: String,
}

impl LoginFailure {
    fn new(status: u16, reason: impl Into<String>) -> Self {
        LoginFailure {
            status,
            reason: reason.into(),
        }
    }
}

struct LoginStep {
    transit: bool,
    nsg: u8,
    tsih: u16,
    answers: Vec<(String, String)>,
}

/// Negotiate one login step.
///
/// `state` is updated in place: the session the connection belongs to, the
/// resolved target and the connection parameters. When the response moves
/// the connection to full feature phase the session's `full_feature_phase`
/// flag is set and the response carries the session's TSIH.
pub fn negotiate_login(
    ctx: &ServerContext,
    request: &LoginRequest,
    state: &mut ConnectionState,
) -> LoginResponse {
    let mut response = LoginResponse {
        csg: request.csg,
        version_max: 0,
        version_active: 0,
        isid: request.isid,
        tsih: request.tsih,
        itt: request.itt,
        ..Default::default()
    };

    match login_step(ctx, request, state) {
        Ok(step) => {
            response.transit = step.transit;
            if step.transit {
                response.nsg = step.nsg;
            }
            response.tsih = step.tsih;
            response.data = serialize_text_parameters(&step.answers);
        }
        Err(failure) => {
            ctx.log.error(format_args!(
                "[{}] Login failed (ISID={}, status 0x{:04x}): {}",
                state.identifier(),
                IsidDisplay(&request.isid),
                failure.status,
                failure.reason
            ));
            response.status = failure.status;
        }
    }
    response
}

/// Whether `response` moves its connection to full feature phase
pub fn reaches_full_feature_phase(response: &LoginResponse) -> bool {
    response.status == login_status::SUCCESS
        && response.transit
        && response.nsg == stage::FULL_FEATURE_PHASE
}

fn login_step(
    ctx: &ServerContext,
    request: &LoginRequest,
    state: &mut ConnectionState,
) -> Result<LoginStep, LoginFailure> {
    if request.version_min > 0 {
        return Err(LoginFailure::new(
            login_status::UNSUPPORTED_VERSION,
            format!("version-min {} is not supported", request.version_min),
        ));
    }
    if request.csg == stage::FULL_FEATURE_PHASE {
        return Err(LoginFailure::new(
            login_status::INITIATOR_ERROR,
            "login cannot start in full feature phase",
        ));
    }
    if request.transit && request.nsg <= request.csg {
        return Err(LoginFailure::new(
            login_status::INITIATOR_ERROR,
            format!("invalid stage transition {} -> {}", request.csg, request.nsg),
        ));
    }

    let keys = request
        .parameters()
        .map_err(|e| LoginFailure::new(login_status::INITIATOR_ERROR, e.to_string()))?;

    let first_request = !state.login.started;
    if first_request {
        begin_login(ctx, request, &keys, state)?;
    } else {
        let (isid, tsih) = state.session.identity();
        if isid != request.isid || (request.tsih != 0 && request.tsih != tsih) {
            return Err(LoginFailure::new(
                login_status::INITIATOR_ERROR,
                "ISID or TSIH changed during login",
            ));
        }
    }

    let mut answers = Vec::new();
    let mut session = state.session.params();
    let discovery = session.is_discovery();
    // Session-wide keys belong to the leading connection
    let leading = !session.full_feature_phase;
    let mut scratch = session.clone();
    let negotiated: &mut SessionParameters = if leading { &mut *session } else { &mut scratch };

    for (key, value) in &keys {
        if DECLARATIVE.contains(&key.as_str()) {
            continue;
        }
        let answer = match key.as_str() {
            "AuthMethod" => {
                if value.split(',').any(|method| method == "None") {
                    "None".to_string()
                } else {
                    return Err(LoginFailure::new(
                        login_status::AUTH_FAILURE,
                        format!("no supported AuthMethod in {:?}", value),
                    ));
                }
            }
            "HeaderDigest" | "DataDigest" => "None".to_string(),
            "MaxRecvDataSegmentLength" => match parse_number(value, SEGMENT_LENGTH_RANGE) {
                Some(length) => {
                    state.params.initiator_max_recv_data_segment_length = length;
                    continue;
                }
                None => REJECT.to_string(),
            },
            "IFMarker" | "OFMarker" => yes_no(false).to_string(),
            _ if discovery && DISCOVERY_IRRELEVANT.contains(&key.as_str()) => {
                IRRELEVANT.to_string()
            }
            _ => negotiate_session_key(negotiated, &ctx.offered, key, value)
                .unwrap_or_else(|| NOT_UNDERSTOOD.to_string()),
        };
        answers.push((key.clone(), answer));
    }

    if negotiated.first_burst_length > negotiated.max_burst_length {
        negotiated.first_burst_length = negotiated.max_burst_length;
        let clamped = negotiated.first_burst_length.to_string();
        if let Some(entry) = answers.iter_mut().find(|(k, _)| k == "FirstBurstLength") {
            entry.1 = clamped;
        }
    }

    if first_request && !discovery {
        answers.push(("TargetPortalGroupTag".to_string(), "1".to_string()));
    }
    let entering_operational = request.csg == stage::LOGIN_OPERATIONAL_NEGOTIATION
        || (request.transit && request.nsg == stage::FULL_FEATURE_PHASE);
    if entering_operational && !state.login.declared_limits {
        let length = ctx.offered.max_recv_data_segment_length;
        answers.push(("MaxRecvDataSegmentLength".to_string(), length.to_string()));
        state.params.target_max_recv_data_segment_length = length;
        state.login.declared_limits = true;
    }

    let full_feature = request.transit && request.nsg == stage::FULL_FEATURE_PHASE;
    if full_feature {
        session.full_feature_phase = true;
    }

    Ok(LoginStep {
        transit: request.transit,
        nsg: request.nsg,
        tsih: if full_feature { session.tsih } else { request.tsih },
        answers,
    })
}

/// Handle the first Login Request of a connection: required keys, target,
/// authorization and the session the connection joins
fn begin_login(
    ctx: &ServerContext,
    request: &LoginRequest,
    keys: &[(String, String)],
    state: &mut ConnectionState,
) -> Result<(), LoginFailure> {
    state.params.stat_sn = request.exp_stat_sn;

    let initiator_name = find_key(keys, "InitiatorName").ok_or_else(|| {
        LoginFailure::new(login_status::MISSING_PARAMETER, "InitiatorName is missing")
    })?;
    let session_type = match find_key(keys, "SessionType") {
        None | Some("Normal") => SessionType::Normal,
        Some("Discovery") => SessionType::Discovery,
        Some(other) => {
            return Err(LoginFailure::new(
                login_status::SESSION_TYPE_NOT_SUPPORTED,
                format!("SessionType={}", other),
            ))
        }
    };

    let target = match session_type {
        SessionType::Discovery => None,
        SessionType::Normal => {
            let name = find_key(keys, "TargetName").ok_or_else(|| {
                LoginFailure::new(login_status::MISSING_PARAMETER, "TargetName is missing")
            })?;
            let target = find_target(&ctx.targets, name).ok_or_else(|| {
                LoginFailure::new(
                    login_status::TARGET_NOT_FOUND,
                    format!("unknown target {}", name),
                )
            })?;
            if !target.authorize_initiator(&state.connection.peer(), initiator_name) {
                return Err(LoginFailure::new(
                    login_status::AUTHORIZATION_FAILURE,
                    format!("{} is not authorized for {}", initiator_name, target.name()),
                ));
            }
            Some(target.clone())
        }
    };
    let target_name = target.as_ref().map(|t| t.name().to_string()).unwrap_or_default();

    if request.tsih == 0 {
        let tsih = ctx
            .tsih
            .allocate(|tsih| ctx.registry.tsih_in_use(tsih))
            .ok_or_else(|| LoginFailure::new(login_status::OUT_OF_RESOURCES, "no free TSIH"))?;
        let mut params = state.session.params();
        params.isid = request.isid;
        params.tsih = tsih;
        params.session_type = session_type;
        params.initiator_name = initiator_name.to_string();
        params.target_name = target_name;
    } else {
        // A reinstated connection already carries the session it replaces
        let session = if state.session.identity() == (request.isid, request.tsih) {
            state.session.clone()
        } else {
            ctx.registry
                .find_session(&request.isid, request.tsih)
                .ok_or_else(|| {
                    LoginFailure::new(
                        login_status::SESSION_DOES_NOT_EXIST,
                        format!("no session with TSIH {}", request.tsih),
                    )
                })?
        };
        let connections = ctx
            .registry
            .session_connections(&request.isid, request.tsih)
            .len();

        let params = session.params();
        if !params.initiator_name.is_empty() && params.initiator_name != initiator_name {
            return Err(LoginFailure::new(
                login_status::INITIATOR_ERROR,
                "InitiatorName differs from the session's",
            ));
        }
        if params.session_type != session_type
            || !params.target_name.eq_ignore_ascii_case(&target_name)
        {
            return Err(LoginFailure::new(
                login_status::CANT_INCLUDE_IN_SESSION,
                "connection does not match the session",
            ));
        }
        if connections >= params.max_connections as usize {
            return Err(LoginFailure::new(
                login_status::TOO_MANY_CONNECTIONS,
                format!("session already has {} connection(s)", connections),
            ));
        }
        drop(params);
        state.session = session;
    }

    state.params.initiator_name = initiator_name.to_string();
    state.target = target;
    state.login.started = true;
    Ok(())
}

fn find_key<'a>(keys: &'a [(String, String)], key: &str) -> Option<&'a str> {
    keys.iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Negotiate one session-wide key. `None` if the key is not one we know.
fn negotiate_session_key(
    params: &mut SessionParameters,
    offered: &OfferedParameters,
    key: &str,
    value: &str,
) -> Option<String> {
    let answer = match key {
        "InitialR2T" => answer_bool(or_result(value, offered.initial_r2t), &mut params.initial_r2t),
        "ImmediateData" => answer_bool(
            and_result(value, offered.immediate_data),
            &mut params.immediate_data,
        ),
        "DataPDUInOrder" => answer_bool(
            or_result(value, offered.data_pdu_in_order),
            &mut params.data_pdu_in_order,
        ),
        "DataSequenceInOrder" => answer_bool(
            or_result(value, offered.data_sequence_in_order),
            &mut params.data_sequence_in_order,
        ),
        "MaxBurstLength" => answer_number(
            min_result(value, offered.max_burst_length, SEGMENT_LENGTH_RANGE),
            &mut params.max_burst_length,
        ),
        "FirstBurstLength" => answer_number(
            min_result(value, offered.first_burst_length, SEGMENT_LENGTH_RANGE),
            &mut params.first_burst_length,
        ),
        "MaxOutstandingR2T" => answer_number(
            min_result(value, offered.max_outstanding_r2t, 1..=65535),
            &mut params.max_outstanding_r2t,
        ),
        "DefaultTime2Retain" => answer_number(
            min_result(value, offered.default_time2retain.into(), 0..=3600),
            &mut params.default_time2retain,
        ),
        "DefaultTime2Wait" => answer_number(
            max_result(value, offered.default_time2wait.into(), 0..=3600),
            &mut params.default_time2wait,
        ),
        "MaxConnections" => answer_number(
            min_result(value, offered.max_connections.into(), 1..=65535),
            &mut params.max_connections,
        ),
        "ErrorRecoveryLevel" => answer_number(
            min_result(value, offered.error_recovery_level.into(), 0..=2),
            &mut params.error_recovery_level,
        ),
        _ => return None,
    };
    Some(answer)
}

fn parse_number(value: &str, range: RangeInclusive<u32>) -> Option<u32> {
    value.parse::<u32>().ok().filter(|n| range.contains(n))
}

fn or_result(value: &str, offered: bool) -> Option<bool> {
    parse_yes_no(value).map(|v| v || offered)
}

fn and_result(value: &str, offered: bool) -> Option<bool> {
    parse_yes_no(value).map(|v| v && offered)
}

fn min_result(value: &str, offered: u32, range: RangeInclusive<u32>) -> Option<u32> {
    parse_number(value, range).map(|v| v.min(offered))
}

fn max_result(value: &str, offered: u32, range: RangeInclusive<u32>) -> Option<u32> {
    parse_number(value, range).map(|v| v.max(offered))
}

fn answer_bool(result: Option<bool>, field: &mut bool) -> String {
    match result {
        Some(value) => {
            *field = value;
            yes_no(value).to_string()
        }
        None => REJECT.to_string(),
    }
}

fn answer_number<T>(result: Option<u32>, field: &mut T) -> String
where
    T: TryFrom<u32> + ToString,
{
    match result.and_then(|value| T::try_from(value).ok()) {
        Some(value) => {
            let answer = value.to_string();
            *field = value;
            answer
        }
        None => REJECT.to_string(),
    }
}
