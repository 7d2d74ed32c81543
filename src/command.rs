//! SCSI command execution and response building
//!
//! Runs a ready command on its target and turns the outcome into Data-In
//! PDUs (phase collapse on the last one) or a single SCSI Response.

use crate::connection::ConnectionParameters;
use crate::messages::{Pdu, ScsiDataIn, ScsiResponse};
use crate::pdu::RESERVED_TAG;
use crate::scsi::{decode_lun, scsi_status, ScsiOutcome};
use crate::target::IscsiTarget;
use crate::transfer::ReadyCommand;

/// Execute `ready` on `target` and build the PDUs that answer it.
///
/// Read data is segmented to the initiator's MaxRecvDataSegmentLength. The
/// StatSN and command window of the returned PDUs are stamped at send time.
pub fn execute(
    ready: &ReadyCommand,
    target: &IscsiTarget,
    connection: &ConnectionParameters,
) -> Vec<Pdu> {
    let command = &ready.command;
    let outcome = target.execute_command(&command.cdb, decode_lun(command.lun), &ready.data);
    build_responses(ready, outcome, connection)
}

fn build_responses(
    ready: &ReadyCommand,
    outcome: ScsiOutcome,
    connection: &ConnectionParameters,
) -> Vec<Pdu> {
    let command = &ready.command;
    let expected = command.expected_data_length as usize;

    if outcome.status == scsi_status::GOOD
        && command.read
        && expected > 0
        && !outcome.response.is_empty()
    {
        let sent = outcome.response.len().min(expected);
        let segment = connection.initiator_max_recv_data_segment_length.max(1) as usize;
        let (overflow, underflow, residual) = residual(outcome.response.len(), expected);

        let chunks: Vec<&[u8]> = outcome.response[..sent].chunks(segment).collect();
        let last = chunks.len() - 1;
        return chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let is_last = index == last;
                Pdu::ScsiDataIn(ScsiDataIn {
                    final_flag: is_last,
                    overflow: is_last && overflow,
                    underflow: is_last && underflow,
                    status: is_last.then_some(outcome.status),
                    lun: command.lun,
                    itt: command.itt,
                    ttt: RESERVED_TAG,
                    data_sn: index as u32,
                    buffer_offset: (index * segment) as u32,
                    residual_count: if is_last { residual } else { 0 },
                    data: chunk.to_vec(),
                    ..Default::default()
                })
            })
            .collect();
    }

    let mut response = ScsiResponse {
        status: outcome.status,
        itt: command.itt,
        ..Default::default()
    };
    if outcome.status == scsi_status::CHECK_CONDITION {
        let sense_length = outcome.response.len() as u16;
        response.data = sense_length.to_be_bytes().to_vec();
        response.data.extend_from_slice(&outcome.response);
    }
    if command.read && expected > 0 {
        response.underflow = true;
        response.residual_count = expected as u32;
    }
    vec![Pdu::ScsiResponse(response)]
}

/// (overflow, underflow, residual count) for `produced` bytes against the
/// initiator's expected length
fn residual(produced: usize, expected: usize) -> (bool, bool, u32) {
    if produced > expected {
        (true, false, (produced - expected) as u32)
    } else if produced < expected {
        (false, true, (expected - produced) as u32)
    } else {
        (false, false, 0)
    }
}
