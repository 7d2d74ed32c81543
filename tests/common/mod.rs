//! Minimal blocking initiator and in-memory storage for the server tests

#![allow(dead_code)]

use iscsi_target::messages::{
    LoginRequest, LoginResponse, LogoutRequest, NopOut, Pdu, ScsiCommand, ScsiDataOut,
    TextRequest,
};
use iscsi_target::pdu::{pdu_length, serialize_text_parameters, stage, BHS_SIZE, RESERVED_TAG};
use iscsi_target::{IscsiError, IscsiServer, IscsiTarget, OfferedParameters, ScsiBlockDevice, ScsiResult};
use once_cell::sync::Lazy;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

pub const TARGET_NAME: &str = "iqn.2025-12.local:storage.disk1";
pub const INITIATOR_NAME: &str = "iqn.1994-05.com.example:tester";
pub const BLOCK_SIZE: u32 = 512;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn init_logging() {
    Lazy::force(&LOGGER);
}

pub struct MemoryStorage {
    data: Vec<u8>,
}

impl MemoryStorage {
    pub fn new(blocks: usize) -> Self {
        MemoryStorage {
            data: vec![0u8; blocks * BLOCK_SIZE as usize],
        }
    }
}

impl ScsiBlockDevice for MemoryStorage {
    fn read(&self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>> {
        let offset = (lba * block_size as u64) as usize;
        let len = (blocks * block_size) as usize;
        self.data
            .get(offset..offset + len)
            .map(|d| d.to_vec())
            .ok_or_else(|| IscsiError::Scsi(format!("read beyond capacity: LBA {}", lba)))
    }

    fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()> {
        let offset = (lba * block_size as u64) as usize;
        let region = self
            .data
            .get_mut(offset..offset + data.len())
            .ok_or_else(|| IscsiError::Scsi(format!("write beyond capacity: LBA {}", lba)))?;
        region.copy_from_slice(data);
        Ok(())
    }

    fn capacity(&self) -> u64 {
        (self.data.len() / BLOCK_SIZE as usize) as u64
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }
}

/// Start a server on an ephemeral loopback port with one memory-backed target
pub fn start_server(offered: OfferedParameters) -> (IscsiServer, SocketAddr) {
    init_logging();
    let server = IscsiServer::builder()
        .bind_addr("127.0.0.1:0")
        .target(IscsiTarget::with_block_device(TARGET_NAME, MemoryStorage::new(2048)))
        .offered_parameters(offered)
        .build()
        .unwrap();
    let addr = server.start().unwrap();
    (server, addr)
}

/// Poll `condition` until it holds or two seconds pass
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub struct Initiator {
    stream: TcpStream,
    pub isid: [u8; 6],
    pub tsih: u16,
    pub cid: u16,
    pub cmd_sn: u32,
    pub exp_stat_sn: u32,
    next_itt: u32,
}

impl Initiator {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Initiator {
            stream,
            isid: [0x80, 0x00, 0x00, 0x01, 0x02, 0x03],
            tsih: 0,
            cid: 0,
            cmd_sn: 1,
            exp_stat_sn: 0,
            next_itt: 1,
        }
    }

    pub fn next_itt(&mut self) -> u32 {
        let itt = self.next_itt;
        self.next_itt += 1;
        itt
    }

    pub fn send(&mut self, pdu: &Pdu) {
        self.send_bytes(&pdu.encode());
    }

    pub fn send_bytes(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub fn recv(&mut self) -> Pdu {
        let mut bytes = vec![0u8; BHS_SIZE];
        self.stream.read_exact(&mut bytes).unwrap();
        let total = pdu_length(&bytes, 0);
        let mut rest = vec![0u8; total - BHS_SIZE];
        self.stream.read_exact(&mut rest).unwrap();
        bytes.extend_from_slice(&rest);
        Pdu::decode(&bytes).unwrap()
    }

    /// Read until the target closes the connection, returning what arrived
    pub fn read_to_close(&mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.stream.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    pub fn login_request(&mut self, keys: &[(&str, &str)]) -> LoginRequest {
        let keys: Vec<(String, String)> = keys
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let itt = self.next_itt();
        LoginRequest {
            transit: true,
            cont: false,
            csg: stage::LOGIN_OPERATIONAL_NEGOTIATION,
            nsg: stage::FULL_FEATURE_PHASE,
            version_max: 0,
            version_min: 0,
            isid: self.isid,
            tsih: self.tsih,
            itt,
            cid: self.cid,
            cmd_sn: self.cmd_sn,
            exp_stat_sn: self.exp_stat_sn,
            data: serialize_text_parameters(&keys),
        }
    }

    /// Single-step login straight to full feature phase
    pub fn login(&mut self, keys: &[(&str, &str)]) -> LoginResponse {
        let request = self.login_request(keys);
        self.send(&Pdu::LoginRequest(request));
        match self.recv() {
            Pdu::LoginResponse(response) => {
                self.exp_stat_sn = response.stat_sn.wrapping_add(1);
                if response.status == 0 {
                    self.tsih = response.tsih;
                }
                response
            }
            other => panic!("expected Login Response, got {:?}", other),
        }
    }

    pub fn login_normal(&mut self) -> LoginResponse {
        self.login(&[
            ("InitiatorName", INITIATOR_NAME),
            ("TargetName", TARGET_NAME),
            ("SessionType", "Normal"),
        ])
    }

    pub fn login_discovery(&mut self) -> LoginResponse {
        self.login(&[
            ("InitiatorName", INITIATOR_NAME),
            ("SessionType", "Discovery"),
        ])
    }

    pub fn command(&mut self, cdb: &[u8], read: bool, write: bool, expected: u32) -> ScsiCommand {
        let mut padded = [0u8; 16];
        padded[..cdb.len()].copy_from_slice(cdb);
        let itt = self.next_itt();
        let command = ScsiCommand {
            immediate: false,
            final_flag: true,
            read,
            write,
            attributes: 1,
            ahs: Vec::new(),
            lun: 0,
            itt,
            expected_data_length: expected,
            cmd_sn: self.cmd_sn,
            exp_stat_sn: self.exp_stat_sn,
            cdb: padded,
            data: Vec::new(),
        };
        self.cmd_sn = self.cmd_sn.wrapping_add(1);
        command
    }

    pub fn data_out(&self, itt: u32, ttt: u32, offset: u32, data: Vec<u8>) -> ScsiDataOut {
        ScsiDataOut {
            final_flag: true,
            lun: 0,
            itt,
            ttt,
            exp_stat_sn: self.exp_stat_sn,
            data_sn: 0,
            buffer_offset: offset,
            data,
        }
    }

    pub fn nop_out(&mut self) -> NopOut {
        let itt = self.next_itt();
        NopOut {
            immediate: true,
            lun: 0,
            itt,
            ttt: RESERVED_TAG,
            cmd_sn: self.cmd_sn,
            exp_stat_sn: self.exp_stat_sn,
            data: Vec::new(),
        }
    }

    pub fn text(&mut self, keys: &[(&str, &str)]) -> TextRequest {
        let keys: Vec<(String, String)> = keys
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let itt = self.next_itt();
        TextRequest {
            immediate: true,
            final_flag: true,
            cont: false,
            lun: 0,
            itt,
            ttt: RESERVED_TAG,
            cmd_sn: self.cmd_sn,
            exp_stat_sn: self.exp_stat_sn,
            data: serialize_text_parameters(&keys),
        }
    }

    pub fn logout(&mut self, reason: u8, cid: u16) -> LogoutRequest {
        let itt = self.next_itt();
        LogoutRequest {
            immediate: true,
            reason,
            itt,
            cid,
            cmd_sn: self.cmd_sn,
            exp_stat_sn: self.exp_stat_sn,
        }
    }
}

pub fn read10_cdb(lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = vec![0x28, 0];
    cdb.extend_from_slice(&lba.to_be_bytes());
    cdb.push(0);
    cdb.extend_from_slice(&blocks.to_be_bytes());
    cdb.push(0);
    cdb
}

pub fn write10_cdb(lba: u32, blocks: u16) -> Vec<u8> {
    let mut cdb = read10_cdb(lba, blocks);
    cdb[0] = 0x2A;
    cdb
}
