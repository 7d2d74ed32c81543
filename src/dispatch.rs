//! PDU dispatch
//!
//! Everything a connection does with received bytes: PDU framing out of the
//! receive buffer, the CmdSN ordering rule, the login phase state machine and
//! the full feature phase handlers. All of it runs on the connection's own
//! receive thread.

use crate::command;
use crate::connection::{ConnectionState, Phase};
use crate::discovery::text_response;
use crate::error::{IscsiError, ScsiResult};
use crate::login::{negotiate_login, reaches_full_feature_phase};
use crate::messages::{
    LoginRequest, LoginResponse, LogoutRequest, LogoutResponse, NopIn, Pdu, Reject,
};
use crate::pdu::{
    login_status, logout_reason, logout_response, pdu_length, reject_reason, LENGTH_PROBE_SIZE,
    RESERVED_TAG,
};
use crate::server::ServerContext;
use crate::session::{CmdSnCheck, IsidDisplay};
use crate::transfer::{TransferLimits, TransferUpdate};
use std::sync::Arc;

/// Whether the receive loop keeps reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Process every complete PDU in the receive buffer.
///
/// A trailing partial PDU stays buffered for the next read.
pub fn process_buffer(ctx: &ServerContext, state: &mut ConnectionState) -> Flow {
    while state.buffer.len() >= LENGTH_PROBE_SIZE {
        let length = pdu_length(&state.buffer, 0);
        if length > state.buffer.len() {
            break;
        }
        let bytes: Vec<u8> = state.buffer.drain(..length).collect();

        match Pdu::decode(&bytes) {
            Ok(pdu) => process_pdu(ctx, state, pdu, &bytes),
            Err(e) => {
                ctx.log.error(format_args!("[{}] {}", state.identifier(), e));
                send_reject(ctx, state, reject_reason::INVALID_PDU_FIELD, &e.header);
            }
        }

        if state.connection.is_closed() {
            return Flow::Close;
        }
    }
    Flow::Continue
}

/// Handle one decoded PDU. `raw` is its encoded form, used for Reject payloads.
pub fn process_pdu(ctx: &ServerContext, state: &mut ConnectionState, pdu: Pdu, raw: &[u8]) {
    let check = state.session.params().check_cmd_sn(&pdu);
    ctx.log.debug(format_args!(
        "[{}] Received PDU from initiator, Operation: {}, Size: {}, CmdSN: {:?}",
        state.identifier(),
        pdu.name(),
        raw.len(),
        pdu.cmd_sn()
    ));
    if let CmdSnCheck::OutOfOrder { expected, received } = check {
        ctx.log.error(format_args!(
            "[{}] CmdSN outside of expected range (expected {}, received {}), PDU dropped",
            state.identifier(),
            expected,
            received
        ));
        return;
    }

    match state.phase {
        Phase::PreLogin => process_login_phase(ctx, state, pdu),
        Phase::FullFeaturePhase => process_full_feature(ctx, state, pdu, raw),
    }
}

fn process_login_phase(ctx: &ServerContext, state: &mut ConnectionState, pdu: Pdu) {
    let request = match pdu {
        Pdu::LoginRequest(request) => request,
        other => {
            ctx.log.error(format_args!(
                "[{}] Improper command during login phase, OpCode: 0x{:02x}",
                state.identifier(),
                other.opcode()
            ));
            let (isid, tsih) = state.session.identity();
            if tsih != 0 {
                let response = LoginResponse {
                    isid,
                    tsih,
                    itt: other.itt(),
                    status: login_status::INVALID_DURING_LOGIN,
                    ..Default::default()
                };
                send_pdu(ctx, state, Pdu::LoginResponse(response));
            }
            state.connection.close();
            return;
        }
    };

    ctx.log.debug(format_args!(
        "[{}] Login Request, current stage: {}, next stage: {}, transit: {}",
        state.identifier(),
        request.csg,
        request.nsg,
        request.transit
    ));

    if request.tsih != 0 {
        implicit_logout(ctx, state, &request);
    }

    let mut response = negotiate_login(ctx, &request, state);
    if reaches_full_feature_phase(&response) {
        let max_connections = state.session.params().max_connections as usize;
        // Another login of the same session may have registered meanwhile
        if !ctx.registry.add(
            request.cid,
            state.session.clone(),
            state.connection.clone(),
            max_connections,
        ) {
            ctx.log.error(format_args!(
                "[{}] Login failed (ISID={}): session already has {} connection(s)",
                state.identifier(),
                IsidDisplay(&request.isid),
                max_connections
            ));
            response = LoginResponse {
                csg: request.csg,
                isid: request.isid,
                tsih: request.tsih,
                itt: request.itt,
                status: login_status::TOO_MANY_CONNECTIONS,
                ..Default::default()
            };
        }
    }
    let failed = response.status_class() != 0;
    if reaches_full_feature_phase(&response) {
        state.session.params().isid = request.isid;
        state.params.cid = request.cid;
        state.phase = Phase::FullFeaturePhase;
        ctx.log.info(format_args!(
            "[{}] Login completed, {} session with {}",
            state.identifier(),
            if state.session.is_discovery() {
                "discovery"
            } else {
                "normal"
            },
            state.params.initiator_name
        ));
    }

    send_pdu(ctx, state, Pdu::LoginResponse(response));
    if failed {
        state.connection.close();
    }
}

/// A login with the TSIH and CID of a live connection replaces it
fn implicit_logout(ctx: &ServerContext, state: &mut ConnectionState, request: &LoginRequest) {
    let Some((session, existing)) =
        ctx.registry
            .find_with_session(&request.isid, request.tsih, request.cid)
    else {
        return;
    };

    ctx.log.debug(format_args!(
        "[{}] Initiating implicit logout of ISID={},TSIH={},CID={}",
        state.identifier(),
        IsidDisplay(&request.isid),
        request.tsih,
        request.cid
    ));
    existing.running_commands().wait_until_zero();
    existing.close();
    ctx.registry.remove(&existing);
    if !state.login.started {
        state.session = session;
    }
    ctx.log.debug(format_args!(
        "[{}] Implicit logout completed",
        state.identifier()
    ));
}

fn process_full_feature(ctx: &ServerContext, state: &mut ConnectionState, pdu: Pdu, raw: &[u8]) {
    let discovery = state.session.is_discovery();

    match pdu {
        Pdu::TextRequest(request) => {
            let response = text_response(&request, &ctx.targets, state.connection.local());
            send_pdu(ctx, state, Pdu::TextResponse(response));
        }
        Pdu::LogoutRequest(request) => {
            if discovery && request.reason != logout_reason::CLOSE_SESSION {
                ctx.log.error(format_args!(
                    "[{}] Discovery session logout with reason {}",
                    state.identifier(),
                    request.reason
                ));
                send_reject(ctx, state, reject_reason::PROTOCOL_ERROR, raw);
            } else {
                logout(ctx, state, &request);
            }
        }
        _ if discovery => {
            ctx.log.error(format_args!(
                "[{}] {} is not allowed in a discovery session",
                state.identifier(),
                pdu.name()
            ));
            send_reject(ctx, state, reject_reason::PROTOCOL_ERROR, raw);
        }
        Pdu::NopOut(request) => {
            if request.itt != RESERVED_TAG {
                send_pdu(ctx, state, Pdu::NopIn(NopIn::echo(&request)));
            }
        }
        Pdu::ScsiCommand(command) => {
            ctx.log.debug(format_args!(
                "[{}] SCSICommandPDU: CmdSN: {}, LUN: {}, Data segment length: {}, Expected Data Transfer Length: {}, Final: {}",
                state.identifier(),
                command.cmd_sn,
                crate::scsi::decode_lun(command.lun),
                command.data.len(),
                command.expected_data_length,
                command.final_flag
            ));
            let limits = TransferLimits::from(&*state.session.params());
            let update = state.transfers.submit_command(command, &limits);
            handle_transfer_update(ctx, state, update, raw);
        }
        Pdu::ScsiDataOut(data_out) => {
            ctx.log.trace(format_args!(
                "[{}] SCSIDataOutPDU: ITT: 0x{:08x}, TTT: 0x{:08x}, Offset: {}, Length: {}, Final: {}",
                state.identifier(),
                data_out.itt,
                data_out.ttt,
                data_out.buffer_offset,
                data_out.data.len(),
                data_out.final_flag
            ));
            let limits = TransferLimits::from(&*state.session.params());
            let update = state.transfers.accept_data_out(&data_out, &limits);
            handle_transfer_update(ctx, state, update, raw);
        }
        Pdu::LoginRequest(_) => {
            ctx.log.error(format_args!(
                "[{}] Login Request received after full feature phase",
                state.identifier()
            ));
            send_reject(ctx, state, reject_reason::PROTOCOL_ERROR, raw);
        }
        other => {
            ctx.log.error(format_args!(
                "[{}] Unsupported command, OpCode: 0x{:02x}",
                state.identifier(),
                other.opcode()
            ));
            send_reject(ctx, state, reject_reason::COMMAND_NOT_SUPPORTED, raw);
        }
    }
}

fn logout(ctx: &ServerContext, state: &mut ConnectionState, request: &LogoutRequest) {
    ctx.log.debug(format_args!(
        "[{}] Logout Request, reason: {}, CID: {}",
        state.identifier(),
        request.reason,
        request.cid
    ));

    let (isid, tsih) = state.session.identity();
    let mut response_code = logout_response::SUCCESS;
    let connections = if request.reason == logout_reason::CLOSE_SESSION {
        let mut connections = ctx.registry.session_connections(&isid, tsih);
        if !connections.iter().any(|c| Arc::ptr_eq(c, &state.connection)) {
            connections.push(state.connection.clone());
        }
        connections
    } else {
        let mut connections = Vec::new();
        match ctx.registry.find(&isid, tsih, request.cid) {
            Some(other) if !Arc::ptr_eq(&other, &state.connection) => connections.push(other),
            Some(_) => {}
            None => response_code = logout_response::CID_NOT_FOUND,
        }
        connections.push(state.connection.clone());
        connections
    };

    for connection in &connections {
        connection.running_commands().wait_until_zero();
        // The responding connection closes after its Logout Response
        if !Arc::ptr_eq(connection, &state.connection) {
            connection.close();
        }
        ctx.registry.remove(connection);
    }

    let (time2wait, time2retain) = {
        let params = state.session.params();
        (params.default_time2wait, params.default_time2retain)
    };
    let response = LogoutResponse {
        response: response_code,
        itt: request.itt,
        stat_sn: 0,
        exp_cmd_sn: 0,
        max_cmd_sn: 0,
        time2wait,
        time2retain,
    };
    send_pdu(ctx, state, Pdu::LogoutResponse(response));
    ctx.log.info(format_args!(
        "[{}] Logged out, {} connection(s) closed",
        state.identifier(),
        connections.len()
    ));
    state.connection.close();
}

fn handle_transfer_update(
    ctx: &ServerContext,
    state: &mut ConnectionState,
    update: ScsiResult<TransferUpdate>,
    raw: &[u8],
) {
    let update = match update {
        Ok(update) => update,
        Err(IscsiError::InvalidTargetTransferTag(ttt)) => {
            ctx.log.error(format_args!(
                "[{}] Invalid TargetTransferTag: 0x{:08x}",
                state.identifier(),
                ttt
            ));
            send_reject(ctx, state, reject_reason::INVALID_PDU_FIELD, raw);
            return;
        }
        Err(e) => {
            ctx.log.error(format_args!("[{}] {}", state.identifier(), e));
            send_reject(ctx, state, reject_reason::PROTOCOL_ERROR, raw);
            return;
        }
    };

    let Some(target) = state.target.clone() else {
        ctx.log.error(format_args!(
            "[{}] SCSI command on a session without a target",
            state.identifier()
        ));
        send_reject(ctx, state, reject_reason::PROTOCOL_ERROR, raw);
        return;
    };

    // Counted before any R2T goes out so teardown never sees a false zero
    let running = state.connection.clone();
    running.running_commands().add(update.ready.len());

    for r2t in update.ready_to_transfer {
        send_pdu(ctx, state, Pdu::ReadyToTransfer(r2t));
    }

    let mut responses = Vec::new();
    for ready in &update.ready {
        ctx.log.debug(format_args!(
            "[{}] Executing command: CmdSN: {}",
            state.identifier(),
            ready.command.cmd_sn
        ));
        responses.extend(command::execute(ready, &target, &state.params));
        running.running_commands().decrement();
    }

    for response in responses {
        if !send_pdu(ctx, state, response) {
            break;
        }
    }
}

fn send_reject(ctx: &ServerContext, state: &mut ConnectionState, reason: u8, rejected: &[u8]) {
    send_pdu(ctx, state, Pdu::Reject(Reject::new(reason, rejected)));
}

/// Stamp StatSN and the command window on `pdu` and write it.
///
/// Returns false when the write failed. Failures are logged; the receive
/// loop decides when the connection is gone.
pub fn send_pdu(ctx: &ServerContext, state: &mut ConnectionState, mut pdu: Pdu) -> bool {
    pdu.set_stat_sn(state.params.stat_sn);
    if pdu.advances_stat_sn() {
        state.params.stat_sn = state.params.stat_sn.wrapping_add(1);
    }
    let (exp_cmd_sn, max_cmd_sn) = state.session.command_window();
    pdu.set_exp_cmd_sn(exp_cmd_sn, max_cmd_sn);

    let bytes = pdu.encode();
    match state.connection.send(&bytes) {
        Ok(()) => {
            ctx.log.debug(format_args!(
                "[{}] Sent PDU to initiator, Operation: {}, Size: {}",
                state.identifier(),
                pdu.name(),
                bytes.len()
            ));
            true
        }
        Err(e) => {
            let e = IscsiError::from(e);
            if e.is_disconnect() {
                ctx.log.debug(format_args!(
                    "[{}] Failed to send {}: {}",
                    state.identifier(),
                    pdu.name(),
                    e
                ));
            } else {
                ctx.log.error(format_args!(
                    "[{}] Failed to send {}: {}",
                    state.identifier(),
                    pdu.name(),
                    e
                ));
            }
            false
        }
    }
}
