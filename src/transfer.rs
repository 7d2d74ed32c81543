//! Write-data sequencing
//!
//! Collects the write data of SCSI commands (immediate data, unsolicited
//! Data-Out and R2T-solicited Data-Out) and releases commands for execution
//! in the order they were received, once all of their data is in.
//!
//! Reference: RFC 3720 Section 10.7 (Data-Out) and 10.8 (R2T)

use crate::error::{IscsiError, ScsiResult};
use crate::messages::{ReadyToTransfer, ScsiCommand, ScsiDataOut};
use crate::pdu::RESERVED_TAG;
use crate::session::SessionParameters;
use std::collections::VecDeque;

/// Negotiated values that govern write data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    pub initial_r2t: bool,
    pub immediate_data: bool,
    pub first_burst_length: u32,
    pub max_burst_length: u32,
    pub max_outstanding_r2t: u32,
}

impl From<&SessionParameters> for TransferLimits {
    fn from(params: &SessionParameters) -> Self {
        TransferLimits {
            initial_r2t: params.initial_r2t,
            immediate_data: params.immediate_data,
            first_burst_length: params.first_burst_length,
            max_burst_length: params.max_burst_length,
            max_outstanding_r2t: params.max_outstanding_r2t,
        }
    }
}

/// A command with all of its write data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCommand {
    pub command: ScsiCommand,
    pub data: Vec<u8>,
}

/// What one submitted PDU produced
#[derive(Debug, Default)]
pub struct TransferUpdate {
    /// R2Ts to send now
    pub ready_to_transfer: Vec<ReadyToTransfer>,
    /// Commands to execute, in CmdSN order
    pub ready: Vec<ReadyCommand>,
}

/// One solicited burst
#[derive(Debug)]
struct Burst {
    ttt: u32,
    offset: u32,
    length: u32,
    received: u32,
}

impl Burst {
    fn next_offset(&self) -> u32 {
        self.offset + self.received
    }
}

#[derive(Debug)]
struct PendingCommand {
    command: ScsiCommand,
    /// Write data received so far, grown as segments are stored
    data: Vec<u8>,
    expected: u32,
    received: u32,
    /// Offset the next unsolicited Data-Out must start at
    unsolicited_next: u32,
    /// Unsolicited data ends here
    unsolicited_end: u32,
    /// Start of the data not yet requested with an R2T
    next_r2t_offset: u32,
    r2t_sn: u32,
    bursts: Vec<Burst>,
}

impl PendingCommand {
    fn is_complete(&self) -> bool {
        self.received >= self.expected
    }

    /// Store a segment. Callers guarantee segments never overlap, so
    /// `received` counts distinct bytes.
    fn store(&mut self, offset: u32, data: &[u8]) -> ScsiResult<()> {
        let start = offset as usize;
        let end = start + data.len();
        if end > self.expected as usize {
            return Err(IscsiError::Protocol(format!(
                "Data-Out for ITT 0x{:08x} ends at {} beyond expected length {}",
                self.command.itt, end, self.expected
            )));
        }
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        self.received += data.len() as u32;
        Ok(())
    }
}

/// Per-connection table of commands waiting for write data or for an
/// earlier command to complete
#[derive(Debug)]
pub struct TransferTable {
    queue: VecDeque<PendingCommand>,
    next_ttt: u32,
}

impl Default for TransferTable {
    fn default() -> Self {
        TransferTable {
            queue: VecDeque::new(),
            next_ttt: 1,
        }
    }
}

impl TransferTable {
    /// Commands not yet released for execution
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Accept a SCSI Command PDU
    pub fn submit_command(
        &mut self,
        command: ScsiCommand,
        limits: &TransferLimits,
    ) -> ScsiResult<TransferUpdate> {
        let expected = if command.write {
            command.expected_data_length
        } else {
            0
        };

        if !command.data.is_empty() {
            if !limits.immediate_data {
                return Err(IscsiError::Protocol(format!(
                    "immediate data for ITT 0x{:08x} but ImmediateData=No",
                    command.itt
                )));
            }
            if command.data.len() > limits.first_burst_length as usize {
                return Err(IscsiError::Protocol(format!(
                    "{} bytes of immediate data for ITT 0x{:08x} exceed FirstBurstLength {}",
                    command.data.len(),
                    command.itt,
                    limits.first_burst_length
                )));
            }
        }

        let mut pending = PendingCommand {
            data: Vec::new(),
            expected,
            received: 0,
            unsolicited_next: 0,
            unsolicited_end: 0,
            next_r2t_offset: 0,
            r2t_sn: 0,
            bursts: Vec::new(),
            command,
        };

        if expected > 0 {
            let immediate = std::mem::take(&mut pending.command.data);
            let immediate = &immediate[..immediate.len().min(expected as usize)];
            pending.store(0, immediate)?;
            pending.unsolicited_next = pending.received;

            // With F set the initiator sends nothing more unsolicited
            pending.unsolicited_end = if pending.command.final_flag || limits.initial_r2t {
                pending.received
            } else {
                limits.first_burst_length.min(expected).max(pending.received)
            };
            pending.next_r2t_offset = pending.unsolicited_end;
        }

        let mut update = TransferUpdate::default();
        self.issue_r2ts(&mut pending, limits, &mut update.ready_to_transfer);
        self.queue.push_back(pending);
        self.release_ready(&mut update.ready);
        Ok(update)
    }

    /// Accept a SCSI Data-Out PDU.
    ///
    /// Solicited data is matched by target transfer tag, unsolicited data
    /// (TTT all ones) by initiator task tag.
    pub fn accept_data_out(
        &mut self,
        data_out: &ScsiDataOut,
        limits: &TransferLimits,
    ) -> ScsiResult<TransferUpdate> {
        let mut update = TransferUpdate::default();

        if data_out.ttt == RESERVED_TAG {
            let pending = self
                .queue
                .iter_mut()
                .find(|p| p.command.itt == data_out.itt && p.expected > 0)
                .ok_or(IscsiError::InvalidTargetTransferTag(data_out.ttt))?;
            let end = data_out.buffer_offset as u64 + data_out.data.len() as u64;
            if data_out.buffer_offset != pending.unsolicited_next {
                return Err(IscsiError::Protocol(format!(
                    "unsolicited data for ITT 0x{:08x} at offset {}, expected {}",
                    data_out.itt, data_out.buffer_offset, pending.unsolicited_next
                )));
            }
            if end > pending.unsolicited_end as u64 {
                return Err(IscsiError::Protocol(format!(
                    "unsolicited data for ITT 0x{:08x} exceeds FirstBurstLength",
                    data_out.itt
                )));
            }
            if data_out.final_flag && end != pending.unsolicited_end as u64 {
                return Err(IscsiError::Protocol(format!(
                    "unsolicited burst for ITT 0x{:08x} ended at {}, expected {}",
                    data_out.itt, end, pending.unsolicited_end
                )));
            }
            pending.store(data_out.buffer_offset, &data_out.data)?;
            pending.unsolicited_next = end as u32;
        } else {
            let index = self
                .queue
                .iter()
                .position(|p| p.bursts.iter().any(|b| b.ttt == data_out.ttt))
                .ok_or(IscsiError::InvalidTargetTransferTag(data_out.ttt))?;
            let mut pending = self
                .queue
                .remove(index)
                .ok_or(IscsiError::InvalidTargetTransferTag(data_out.ttt))?;
            let result = Self::accept_solicited(&mut pending, data_out);
            if result.is_ok() {
                self.issue_r2ts(&mut pending, limits, &mut update.ready_to_transfer);
            }
            self.queue.insert(index, pending);
            result?;
        }

        self.release_ready(&mut update.ready);
        Ok(update)
    }

    fn accept_solicited(pending: &mut PendingCommand, data_out: &ScsiDataOut) -> ScsiResult<()> {
        let burst_index = pending
            .bursts
            .iter()
            .position(|b| b.ttt == data_out.ttt)
            .ok_or(IscsiError::InvalidTargetTransferTag(data_out.ttt))?;

        // Data within a burst arrives in order (DataPDUInOrder=Yes)
        let burst = &pending.bursts[burst_index];
        let start = data_out.buffer_offset as u64;
        let end = start + data_out.data.len() as u64;
        let burst_end = burst.offset as u64 + burst.length as u64;
        if data_out.buffer_offset != burst.next_offset() || end > burst_end {
            return Err(IscsiError::Protocol(format!(
                "Data-Out [{}, {}) does not continue R2T burst [{}, {}) at {}",
                start,
                end,
                burst.offset,
                burst_end,
                burst.next_offset()
            )));
        }
        if data_out.final_flag && end != burst_end {
            return Err(IscsiError::Protocol(format!(
                "R2T burst [{}, {}) ended early at {}",
                burst.offset, burst_end, end
            )));
        }

        pending.store(data_out.buffer_offset, &data_out.data)?;
        let burst = &mut pending.bursts[burst_index];
        burst.received += data_out.data.len() as u32;
        if burst.received >= burst.length {
            pending.bursts.remove(burst_index);
        }
        Ok(())
    }

    /// Request the next bursts of `pending` up to MaxOutstandingR2T
    fn issue_r2ts(
        &mut self,
        pending: &mut PendingCommand,
        limits: &TransferLimits,
        out: &mut Vec<ReadyToTransfer>,
    ) {
        let max_burst = limits.max_burst_length.max(1);
        while pending.next_r2t_offset < pending.expected
            && (pending.bursts.len() as u32) < limits.max_outstanding_r2t.max(1)
        {
            let offset = pending.next_r2t_offset;
            let length = (pending.expected - offset).min(max_burst);
            let ttt = self.allocate_ttt();

            out.push(ReadyToTransfer {
                lun: pending.command.lun,
                itt: pending.command.itt,
                ttt,
                r2t_sn: pending.r2t_sn,
                buffer_offset: offset,
                desired_length: length,
                ..Default::default()
            });
            pending.bursts.push(Burst {
                ttt,
                offset,
                length,
                received: 0,
            });
            pending.r2t_sn = pending.r2t_sn.wrapping_add(1);
            pending.next_r2t_offset = offset + length;
        }
    }

    fn allocate_ttt(&mut self) -> u32 {
        let ttt = self.next_ttt;
        self.next_ttt = self.next_ttt.wrapping_add(1);
        if self.next_ttt == RESERVED_TAG {
            self.next_ttt = 0;
        }
        ttt
    }

    /// Pop the prefix of complete commands
    fn release_ready(&mut self, out: &mut Vec<ReadyCommand>) {
        while self.queue.front().is_some_and(PendingCommand::is_complete) {
            if let Some(pending) = self.queue.pop_front() {
                out.push(ReadyCommand {
                    command: pending.command,
                    data: pending.data,
                });
            }
        }
    }
}
