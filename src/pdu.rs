//! iSCSI PDU (Protocol Data Unit) parsing and serialization
//!
//! This module handles the binary protocol format for iSCSI PDUs
//! based on RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720
//!
//! Every PDU starts with the 48-byte Basic Header Segment. Builders exist for
//! the PDUs an initiator sends; replies are read through the field accessors.

// Protocol functions require many parameters per RFC 3720
#![allow(clippy::too_many_arguments)]

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::io::{Cursor, Read};

/// BHS (Basic Header Segment) size in bytes
pub const BHS_SIZE: usize = 48;

/// Size of the CRC32C header digest appended after the BHS
pub const DIGEST_SIZE: usize = 4;

/// Reserved tag value ("no task" / "no transfer tag")
pub const RESERVED_TAG: u32 = 0xFFFF_FFFF;

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// iSCSI PDU Opcodes (RFC 3720 Section 10)
pub mod opcode {
    // Initiator opcodes (initiator → target)
    pub const NOP_OUT: u8 = 0x00;
    pub const SCSI_COMMAND: u8 = 0x01;
    pub const TASK_MANAGEMENT_REQUEST: u8 = 0x02;
    pub const LOGIN_REQUEST: u8 = 0x03;
    pub const TEXT_REQUEST: u8 = 0x04;
    pub const SCSI_DATA_OUT: u8 = 0x05;
    pub const LOGOUT_REQUEST: u8 = 0x06;
    pub const SNACK_REQUEST: u8 = 0x10;

    // Target opcodes (target → initiator)
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
    pub const ATTR_SIMPLE: u8 = 0x01;

    // SCSI response / Data-In flags
    pub const ACK: u8 = 0x40;
    pub const BIDI_OVERFLOW: u8 = 0x10;
    pub const BIDI_UNDERFLOW: u8 = 0x08;
    pub const OVERFLOW: u8 = 0x04;
    pub const UNDERFLOW: u8 = 0x02;
    pub const STATUS: u8 = 0x01;

    // Login flags
    pub const TRANSIT: u8 = 0x80;
    pub const CONTINUE_LOGIN: u8 = 0x40;

    // Login stages (CSG/NSG in bits 2-3 and 0-1)
    pub const CSG_SECURITY_NEG: u8 = 0x00;
    pub const CSG_LOGIN_OP_NEG: u8 = 0x04;
    pub const CSG_FULL_FEATURE: u8 = 0x0C;
    pub const NSG_SECURITY_NEG: u8 = 0x00;
    pub const NSG_LOGIN_OP_NEG: u8 = 0x01;
    pub const NSG_FULL_FEATURE: u8 = 0x03;
}

/// Login stage numbers as carried in CSG/NSG
pub mod stage {
    pub const SECURITY_NEG: u8 = 0;
    pub const LOGIN_OP_NEG: u8 = 1;
    pub const FULL_FEATURE: u8 = 3;
}

/// Login status classes (RFC 3720 Section 10.13.5)
pub mod login_status {
    pub const SUCCESS: u8 = 0x00;
    pub const REDIRECTION: u8 = 0x01;
    pub const INITIATOR_ERROR: u8 = 0x02;
    pub const TARGET_ERROR: u8 = 0x03;
}

/// SCSI response status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// Task management function codes (RFC 3720 Section 10.5.1)
pub mod tmf_function {
    pub const ABORT_TASK: u8 = 1;
    pub const ABORT_TASK_SET: u8 = 2;
    pub const CLEAR_ACA: u8 = 3;
    pub const CLEAR_TASK_SET: u8 = 4;
    pub const LOGICAL_UNIT_RESET: u8 = 5;
    pub const TARGET_WARM_RESET: u8 = 6;
    pub const TARGET_COLD_RESET: u8 = 7;
    pub const TASK_REASSIGN: u8 = 8;
}

/// Task management response codes (RFC 3720 Section 10.6.1)
pub mod tmf_response {
    pub const FUNCTION_COMPLETE: u8 = 0;
    pub const TASK_DOES_NOT_EXIST: u8 = 1;
    pub const LUN_DOES_NOT_EXIST: u8 = 2;
    pub const TASK_STILL_ALLEGIANT: u8 = 3;
    pub const REASSIGNMENT_NOT_SUPPORTED: u8 = 4;
    pub const FUNCTION_NOT_SUPPORTED: u8 = 5;
    pub const AUTHORIZATION_FAILED: u8 = 6;
    pub const FUNCTION_REJECTED: u8 = 255;
}

/// Reject reason codes (RFC 3720 Section 10.17.1)
pub mod reject_reason {
    pub const RESERVED: u8 = 0x01;
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

/// Human readable name of a reject reason
pub fn reject_reason_str(reason: u8) -> &'static str {
    match reason {
        reject_reason::RESERVED => "Reserved",
        reject_reason::DATA_DIGEST_ERROR => "Data Digest Error",
        reject_reason::SNACK_REJECT => "SNACK Reject",
        reject_reason::PROTOCOL_ERROR => "Protocol Error",
        reject_reason::COMMAND_NOT_SUPPORTED => "Command Not Supported",
        reject_reason::IMMEDIATE_COMMAND_REJECT => "Immediate Command Reject",
        reject_reason::TASK_IN_PROGRESS => "Task In Process",
        reject_reason::INVALID_DATA_ACK => "Invalid Data ACK",
        reject_reason::INVALID_PDU_FIELD => "Invalid PDU Field",
        reject_reason::LONG_OPERATION_REJECT => "Long Operation Reject",
        reject_reason::NEGOTIATION_RESET => "Negotiation Reset",
        reject_reason::WAITING_FOR_LOGOUT => "Waiting For Logout",
        _ => "Unknown",
    }
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
    /// Opcode-specific bytes 2-3 (response, SCSI status, reject reason, login versions)
    pub opcode_specific: [u8; 2],
    /// Total AHS (Additional Header Segment) length (4-byte units)
    pub ahs_length: u8,
    /// Data segment length (bytes)
    pub data_length: u32,
    /// Logical Unit Number (bytes 8-15)
    pub lun: u64,
    /// Initiator Task Tag (bytes 16-19)
    pub itt: u32,
    /// Opcode-specific fields (bytes 20-47, 28 bytes)
    pub specific: [u8; 28],
    /// Data segment (variable length)
    pub data: Vec<u8>,
}

impl Default for IscsiPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl IscsiPdu {
    /// Create a new empty PDU
    pub fn new() -> Self {
        IscsiPdu {
            opcode: 0,
            immediate: false,
            flags: 0,
            opcode_specific: [0u8; 2],
            ahs_length: 0,
            data_length: 0,
            lun: 0,
            itt: 0,
            specific: [0u8; 28],
            data: Vec::new(),
        }
    }

    /// Create an empty PDU with the given opcode and task tag
    pub fn with_opcode(opcode: u8, itt: u32) -> Self {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode;
        pdu.itt = itt;
        pdu
    }

    /// Parse a PDU from bytes
    ///
    /// The input buffer must contain at least the 48-byte BHS.
    /// If the PDU has data, the buffer must also contain the padded data segment.
    pub fn from_bytes(buf: &[u8]) -> ScsiResult<Self> {
        if buf.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU too short: {} bytes, need at least {}",
                buf.len(),
                BHS_SIZE
            )));
        }

        let ahs_bytes = (buf[4] as usize) * 4;
        let data_len = data_segment_length(&buf[..BHS_SIZE]);
        let total_len = BHS_SIZE + ahs_bytes + padded_len(data_len);

        if buf.len() < total_len {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU incomplete: {} bytes, need {} (BHS={}, AHS={}, data={})",
                buf.len(),
                total_len,
                BHS_SIZE,
                ahs_bytes,
                padded_len(data_len)
            )));
        }

        // AHS is skipped
        Self::from_parts(&buf[..BHS_SIZE], &buf[BHS_SIZE + ahs_bytes..])
    }

    /// Parse a PDU received on the wire, verifying the header digest if one was negotiated
    pub fn from_wire(buf: &[u8], header_digest: bool) -> ScsiResult<Self> {
        if !header_digest {
            return Self::from_bytes(buf);
        }

        if buf.len() < BHS_SIZE + DIGEST_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "PDU too short for header digest: {} bytes",
                buf.len()
            )));
        }

        let received = LittleEndian::read_u32(&buf[BHS_SIZE..BHS_SIZE + DIGEST_SIZE]);
        let computed = crc32c(&buf[..BHS_SIZE]);
        if received != computed {
            return Err(IscsiError::InvalidPdu(format!(
                "Header digest mismatch: received 0x{:08x}, computed 0x{:08x}",
                received, computed
            )));
        }

        Self::from_parts(&buf[..BHS_SIZE], &buf[BHS_SIZE + DIGEST_SIZE..])
    }

    /// Build a PDU from a separately received header and data segment
    ///
    /// `data` may be longer than the data segment length (padding, or a
    /// receive buffer); only DataSegmentLength bytes are kept.
    pub fn from_parts(bhs: &[u8], data: &[u8]) -> ScsiResult<Self> {
        if bhs.len() < BHS_SIZE {
            return Err(IscsiError::InvalidPdu(format!(
                "BHS too short: {} bytes",
                bhs.len()
            )));
        }

        let mut cursor = Cursor::new(bhs);

        // Byte 0: Immediate flag (bit 6) and Opcode (bits 0-5)
        let byte0 = cursor.read_u8()?;
        let immediate = (byte0 & 0x40) != 0;
        let opcode = byte0 & 0x3F;

        // Byte 1: Flags (opcode-specific)
        let flags = cursor.read_u8()?;

        // Bytes 2-3: opcode-specific
        let mut opcode_specific = [0u8; 2];
        cursor.read_exact(&mut opcode_specific)?;

        // Byte 4: Total AHS Length (4-byte units)
        let ahs_length = cursor.read_u8()?;

        // Bytes 5-7: Data Segment Length (3 bytes, big-endian)
        let data_length = cursor.read_u24::<BigEndian>()?;

        // Bytes 8-15: LUN
        let lun = cursor.read_u64::<BigEndian>()?;

        // Bytes 16-19: Initiator Task Tag
        let itt = cursor.read_u32::<BigEndian>()?;

        // Bytes 20-47: Opcode-specific fields
        let mut specific = [0u8; 28];
        cursor.read_exact(&mut specific)?;

        if data.len() < data_length as usize {
            return Err(IscsiError::InvalidPdu(format!(
                "Data segment truncated: have {} bytes, header says {}",
                data.len(),
                data_length
            )));
        }

        Ok(IscsiPdu {
            opcode,
            immediate,
            flags,
            opcode_specific,
            ahs_length,
            data_length,
            lun,
            itt,
            specific,
            data: data[..data_length as usize].to_vec(),
        })
    }

    /// Serialize the 48-byte BHS
    pub fn bhs(&self) -> [u8; BHS_SIZE] {
        let mut hdr = [0u8; BHS_SIZE];
        hdr[0] = (if self.immediate { 0x40 } else { 0 }) | (self.opcode & 0x3F);
        hdr[1] = self.flags;
        hdr[2..4].copy_from_slice(&self.opcode_specific);
        hdr[4] = self.ahs_length;
        BigEndian::write_u24(&mut hdr[5..8], self.data.len() as u32);
        BigEndian::write_u64(&mut hdr[8..16], self.lun);
        BigEndian::write_u32(&mut hdr[16..20], self.itt);
        hdr[20..48].copy_from_slice(&self.specific);
        hdr
    }

    /// Serialize PDU to bytes (BHS, data, padding)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_wire(false)
    }

    /// Serialize PDU to bytes as sent on a TCP connection
    ///
    /// With `header_digest` set the CRC32C of the BHS follows it, little-endian.
    pub fn to_wire(&self, header_digest: bool) -> Vec<u8> {
        let bhs = self.bhs();
        let mut buf = Vec::with_capacity(self.wire_length(header_digest));
        buf.extend_from_slice(&bhs);
        if header_digest {
            let mut digest = [0u8; DIGEST_SIZE];
            LittleEndian::write_u32(&mut digest, crc32c(&bhs));
            buf.extend_from_slice(&digest);
        }
        buf.extend_from_slice(&self.data);
        buf.resize(self.wire_length(header_digest), 0);
        buf
    }

    /// Replace the data segment
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data_length = data.len() as u32;
        self.data = data;
    }

    /// Get the opcode name for debugging
    pub fn opcode_name(&self) -> &'static str {
        opcode_name(self.opcode)
    }

    /// Length of the serialized PDU on a TCP connection
    pub fn wire_length(&self, header_digest: bool) -> usize {
        BHS_SIZE + if header_digest { DIGEST_SIZE } else { 0 } + padded_len(self.data.len())
    }

    fn read_field(&self, offset: usize) -> u32 {
        BigEndian::read_u32(&self.specific[offset - 20..offset - 16])
    }

    fn write_field(&mut self, offset: usize, value: u32) {
        BigEndian::write_u32(&mut self.specific[offset - 20..offset - 16], value);
    }

    /// Final bit
    pub fn is_final(&self) -> bool {
        self.flags & flags::FINAL != 0
    }

    /// Response code (byte 2)
    pub fn response(&self) -> u8 {
        self.opcode_specific[0]
    }

    /// SCSI status (byte 3)
    pub fn status(&self) -> u8 {
        self.opcode_specific[1]
    }

    /// Target Transfer Tag (bytes 20-23)
    pub fn ttt(&self) -> u32 {
        self.read_field(20)
    }

    pub fn set_ttt(&mut self, ttt: u32) {
        self.write_field(20, ttt);
    }

    /// Expected Data Transfer Length of a SCSI command (bytes 20-23)
    pub fn expected_data_length(&self) -> u32 {
        self.read_field(20)
    }

    /// Referenced Task Tag of a task management request (bytes 20-23)
    pub fn ref_task_tag(&self) -> u32 {
        self.read_field(20)
    }

    /// CmdSN of an initiator PDU (bytes 24-27)
    pub fn cmd_sn(&self) -> u32 {
        self.read_field(24)
    }

    pub fn set_cmd_sn(&mut self, cmd_sn: u32) {
        self.write_field(24, cmd_sn);
    }

    /// StatSN of a target PDU (bytes 24-27)
    pub fn stat_sn(&self) -> u32 {
        self.read_field(24)
    }

    /// ExpStatSN of an initiator PDU (bytes 28-31)
    pub fn exp_stat_sn(&self) -> u32 {
        self.read_field(28)
    }

    pub fn set_exp_stat_sn(&mut self, exp_stat_sn: u32) {
        self.write_field(28, exp_stat_sn);
    }

    /// ExpCmdSN of a target PDU (bytes 28-31)
    pub fn exp_cmd_sn(&self) -> u32 {
        self.read_field(28)
    }

    /// MaxCmdSN of a target PDU (bytes 32-35)
    pub fn max_cmd_sn(&self) -> u32 {
        self.read_field(32)
    }

    /// RefCmdSN of a task management request (bytes 32-35)
    pub fn ref_cmd_sn(&self) -> u32 {
        self.read_field(32)
    }

    /// DataSN / R2TSN (bytes 36-39)
    pub fn data_sn(&self) -> u32 {
        self.read_field(36)
    }

    /// Buffer Offset (bytes 40-43)
    pub fn buffer_offset(&self) -> u32 {
        self.read_field(40)
    }

    /// Residual Count of a SCSI response or Data-In (bytes 44-47)
    pub fn residual_count(&self) -> u32 {
        self.read_field(44)
    }

    pub fn set_residual_count(&mut self, residual: u32) {
        self.write_field(44, residual);
    }

    /// Desired Data Transfer Length of an R2T (bytes 44-47)
    pub fn desired_data_length(&self) -> u32 {
        self.read_field(44)
    }

    /// Target Session Identifying Handle of a login PDU (bytes 14-15)
    pub fn tsih(&self) -> u16 {
        (self.lun & 0xFFFF) as u16
    }

    /// Login Status-Class and Status-Detail (bytes 36-37)
    pub fn login_status(&self) -> (u8, u8) {
        (self.specific[16], self.specific[17])
    }

    /// CDB bytes of a SCSI command (bytes 32-47)
    pub fn cdb(&self) -> &[u8] {
        &self.specific[12..28]
    }
}

/// Get the name of an opcode for debugging
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
// Framing helpers
// ============================================================================

/// CRC32C (Castagnoli) as used for iSCSI digests
pub fn crc32c(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

/// DataSegmentLength from a raw BHS (bytes 5-7)
pub fn data_segment_length(bhs: &[u8]) -> usize {
    BigEndian::read_u24(&bhs[5..8]) as usize
}

/// Round a data segment length up to the 4-byte boundary
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

/// Total length of the frame whose header is `bhs`
pub fn frame_length(bhs: &[u8], header_digest: bool) -> usize {
    let ahs_bytes = (bhs[4] as usize) * 4;
    BHS_SIZE
        + ahs_bytes
        + if header_digest { DIGEST_SIZE } else { 0 }
        + padded_len(data_segment_length(bhs))
}

/// Encode a single-level LUN into the 8-byte LUN field (bytes 8-9)
pub fn encode_lun(lun: u32) -> u64 {
    ((lun & 0xFFFF) as u64) << 48
}

/// Decode a single-level LUN from the 8-byte LUN field
pub fn decode_lun(raw: u64) -> u32 {
    ((raw >> 48) & 0xFFFF) as u32
}

// ============================================================================
// Initiator request builders
// ============================================================================

impl IscsiPdu {
    /// Create a Login Request PDU
    pub fn login_request(
        isid: [u8; 6],
        tsih: u16,
        cid: u16,
        itt: u32,
        cmd_sn: u32,
        exp_stat_sn: u32,
        csg: u8,
        nsg: u8,
        transit: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::LOGIN_REQUEST, itt);
        pdu.immediate = true;

        // Flags: Transit | CSG | NSG
        pdu.flags = (if transit { flags::TRANSIT } else { 0 })
            | ((csg & 0x03) << 2)
            | (nsg & 0x03);

        // Version-max / version-min are both 0
        pdu.opcode_specific = [0, 0];

        // ISID + TSIH in LUN field (bytes 8-15)
        let mut lun_bytes = [0u8; 8];
        lun_bytes[0..6].copy_from_slice(&isid);
        lun_bytes[6..8].copy_from_slice(&tsih.to_be_bytes());
        pdu.lun = u64::from_be_bytes(lun_bytes);

        // Bytes 20-21: CID
        pdu.specific[0..2].copy_from_slice(&cid.to_be_bytes());
        pdu.set_cmd_sn(cmd_sn);
        pdu.set_exp_stat_sn(exp_stat_sn);

        pdu.set_data(data);
        pdu
    }

    /// Create a Text Request PDU
    pub fn text_request(itt: u32, ttt: u32, cmd_sn: u32, final_flag: bool, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::TEXT_REQUEST, itt);
        pdu.immediate = true;
        pdu.flags = if final_flag { flags::FINAL } else { flags::CONTINUE };
        pdu.set_ttt(ttt);
        pdu.set_cmd_sn(cmd_sn);
        pdu.set_data(data);
        pdu
    }

    /// Create a Logout Request PDU
    pub fn logout_request(itt: u32, reason: u8, cid: u16, cmd_sn: u32) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::LOGOUT_REQUEST, itt);
        pdu.immediate = true;
        pdu.flags = flags::FINAL | (reason & 0x7F);
        pdu.specific[0..2].copy_from_slice(&cid.to_be_bytes());
        pdu.set_cmd_sn(cmd_sn);
        pdu
    }

    /// Create a SCSI Command PDU
    ///
    /// The CDB must be 1 to 16 bytes long.
    pub fn scsi_command(
        lun: u32,
        itt: u32,
        cmd_flags: u8,
        expected_data_length: u32,
        cmd_sn: u32,
        cdb: &[u8],
    ) -> ScsiResult<Self> {
        if cdb.is_empty() || cdb.len() > 16 {
            return Err(IscsiError::InvalidPdu(format!(
                "CDB length {} out of range (1-16 bytes)",
                cdb.len()
            )));
        }

        let mut pdu = IscsiPdu::with_opcode(opcode::SCSI_COMMAND, itt);
        pdu.flags = cmd_flags;
        pdu.lun = encode_lun(lun);
        pdu.write_field(20, expected_data_length);
        pdu.set_cmd_sn(cmd_sn);
        pdu.specific[12..12 + cdb.len()].copy_from_slice(cdb);
        Ok(pdu)
    }

    /// Create a SCSI Data-Out PDU
    pub fn scsi_data_out(
        lun: u32,
        itt: u32,
        ttt: u32,
        data_sn: u32,
        buffer_offset: u32,
        final_flag: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::SCSI_DATA_OUT, itt);
        pdu.flags = if final_flag { flags::FINAL } else { 0 };
        pdu.lun = encode_lun(lun);
        pdu.set_ttt(ttt);
        pdu.write_field(36, data_sn);
        pdu.write_field(40, buffer_offset);
        pdu.set_data(data);
        pdu
    }

    /// Create a NOP-Out PDU
    ///
    /// NOP-Outs are always sent as immediate PDUs.
    pub fn nop_out(itt: u32, ttt: u32, lun: u32, cmd_sn: u32, data: Vec<u8>) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::NOP_OUT, itt);
        pdu.immediate = true;
        pdu.flags = flags::FINAL;
        pdu.lun = encode_lun(lun);
        pdu.set_ttt(ttt);
        pdu.set_cmd_sn(cmd_sn);
        pdu.set_data(data);
        pdu
    }

    /// Create a Task Management Function Request PDU
    pub fn task_management_request(
        function: u8,
        lun: u32,
        itt: u32,
        ref_itt: u32,
        cmd_sn: u32,
        ref_cmd_sn: u32,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::TASK_MANAGEMENT_REQUEST, itt);
        pdu.immediate = true;
        pdu.flags = flags::FINAL | (function & 0x7F);
        pdu.lun = encode_lun(lun);
        pdu.write_field(20, ref_itt);
        pdu.set_cmd_sn(cmd_sn);
        pdu.write_field(32, ref_cmd_sn);
        pdu
    }
}

// ============================================================================
// Target replies for unit tests
// ============================================================================

#[cfg(test)]
impl IscsiPdu {
    fn set_target_sn(&mut self, stat_sn: u32, exp_cmd_sn: u32, max_cmd_sn: u32) {
        self.write_field(24, stat_sn);
        self.write_field(28, exp_cmd_sn);
        self.write_field(32, max_cmd_sn);
    }

    pub(crate) fn text_response(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        final_flag: bool,
        data: Vec<u8>,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::TEXT_RESPONSE, itt);
        pdu.flags = if final_flag { flags::FINAL } else { flags::CONTINUE };
        pdu.set_ttt(ttt);
        pdu.set_target_sn(stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu.set_data(data);
        pdu
    }

    /// Sense data, when present, is sent with its 2-byte SenseLength prefix
    pub(crate) fn scsi_response(
        itt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        status: u8,
        response: u8,
        residual_count: u32,
        sense_data: Option<&[u8]>,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::SCSI_RESPONSE, itt);
        pdu.flags = flags::FINAL;
        pdu.opcode_specific = [response, status];
        pdu.set_target_sn(stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu.set_residual_count(residual_count);

        if let Some(sense) = sense_data {
            let mut data = Vec::with_capacity(sense.len() + 2);
            data.extend_from_slice(&(sense.len() as u16).to_be_bytes());
            data.extend_from_slice(sense);
            pdu.set_data(data);
        }
        pdu
    }

    pub(crate) fn nop_in(
        itt: u32,
        ttt: u32,
        stat_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
        lun: u64,
    ) -> Self {
        let mut pdu = IscsiPdu::with_opcode(opcode::NOP_IN, itt);
        pdu.flags = flags::FINAL;
        pdu.lun = lun;
        pdu.set_ttt(ttt);
        pdu.set_target_sn(stat_sn, exp_cmd_sn, max_cmd_sn);
        pdu
    }
}

// ============================================================================
// Utility functions
// ============================================================================

/// Parse iSCSI text parameters (null-terminated key=value pairs)
pub fn parse_text_parameters(data: &[u8]) -> ScsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    if data.is_empty() {
        return Ok(params);
    }

    // Split on null bytes
    for chunk in data.split(|&b| b == 0) {
        if chunk.is_empty() {
            continue;
        }

        let s = String::from_utf8_lossy(chunk);
        if let Some(eq_pos) = s.find('=') {
            let key = s[..eq_pos].to_string();
            let value = s[eq_pos + 1..].to_string();
            params.push((key, value));
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
        let pdu = IscsiPdu::new();
        assert_eq!(pdu.opcode, 0);
        assert!(!pdu.immediate);
        assert_eq!(pdu.flags, 0);
        assert_eq!(pdu.data_length, 0);
        assert!(pdu.data.is_empty());
    }

    #[test]
    fn test_pdu_roundtrip_simple() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::NOP_OUT;
        pdu.flags = flags::FINAL;
        pdu.itt = 0x12345678;
        pdu.lun = 0x0001020304050607;

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len(), BHS_SIZE);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.opcode, opcode::NOP_OUT);
        assert_eq!(parsed.flags, flags::FINAL);
        assert_eq!(parsed.itt, 0x12345678);
        assert_eq!(parsed.lun, 0x0001020304050607);
    }

    #[test]
    fn test_scsi_command_roundtrip() {
        let cdb = [0x28, 0, 0, 0, 0x10, 0, 0, 0, 8, 0];
        let pdu = IscsiPdu::scsi_command(
            3,
            0x42,
            flags::FINAL | flags::READ | flags::ATTR_SIMPLE,
            4096,
            7,
            &cdb,
        )
        .unwrap();

        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0], opcode::SCSI_COMMAND);
        assert_eq!(bytes[8], 0);
        assert_eq!(bytes[9], 3);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.opcode, opcode::SCSI_COMMAND);
        assert_eq!(parsed.itt, 0x42);
        assert_eq!(parsed.flags, flags::FINAL | flags::READ | flags::ATTR_SIMPLE);

        assert_eq!(decode_lun(parsed.lun), 3);
        assert_eq!(parsed.cmd_sn(), 7);
        assert_eq!(parsed.expected_data_length(), 4096);
        assert_eq!(&parsed.cdb()[..10], &cdb);
        assert_eq!(parsed.cdb()[10..], [0u8; 6]);
    }

    #[test]
    fn test_scsi_command_rejects_bad_cdb() {
        assert!(IscsiPdu::scsi_command(0, 1, flags::FINAL, 0, 1, &[]).is_err());
        assert!(IscsiPdu::scsi_command(0, 1, flags::FINAL, 0, 1, &[0u8; 17]).is_err());
    }

    #[test]
    fn test_pdu_roundtrip_with_data() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.set_data(b"InitiatorName=iqn.test\0".to_vec());

        let bytes = pdu.to_bytes();
        assert!(bytes.len() >= BHS_SIZE + pdu.data.len());
        assert_eq!(bytes.len() % 4, 0);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.opcode, opcode::LOGIN_REQUEST);
        assert_eq!(parsed.data, pdu.data);
    }

    #[test]
    fn test_pdu_too_short() {
        let bytes = vec![0u8; 20];
        assert!(IscsiPdu::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_pdu_truncated_data() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_RESPONSE;
        pdu.set_data(vec![1u8; 100]);
        let bytes = pdu.to_bytes();
        assert!(IscsiPdu::from_bytes(&bytes[..80]).is_err());
    }

    #[test]
    fn test_status_bytes_survive_serialization() {
        let pdu = IscsiPdu::scsi_response(
            9,
            1,
            2,
            3,
            scsi_status::CHECK_CONDITION,
            0,
            0,
            Some(&[0x70, 0, 5]),
        );
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[2], 0);
        assert_eq!(bytes[3], scsi_status::CHECK_CONDITION);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.status(), scsi_status::CHECK_CONDITION);
        assert_eq!(parsed.stat_sn(), 1);
        assert_eq!(parsed.exp_cmd_sn(), 2);
        assert_eq!(parsed.max_cmd_sn(), 3);
        // SenseLength prefix + sense bytes
        assert_eq!(parsed.data, vec![0, 3, 0x70, 0, 5]);
    }

    #[test]
    fn test_header_digest() {
        let pdu = IscsiPdu::nop_out(5, RESERVED_TAG, 0, 1, vec![0xAA; 6]);
        let wire = pdu.to_wire(true);
        assert_eq!(wire.len(), BHS_SIZE + DIGEST_SIZE + 8);
        assert_eq!(frame_length(&wire[..BHS_SIZE], true), wire.len());

        let digest = LittleEndian::read_u32(&wire[BHS_SIZE..BHS_SIZE + 4]);
        assert_eq!(digest, crc32c(&wire[..BHS_SIZE]));

        let parsed = IscsiPdu::from_wire(&wire, true).unwrap();
        assert_eq!(parsed.itt, 5);
        assert_eq!(parsed.data, vec![0xAA; 6]);

        let mut corrupt = wire.clone();
        corrupt[BHS_SIZE] ^= 0xFF;
        assert!(IscsiPdu::from_wire(&corrupt, true).is_err());
    }

    #[test]
    fn test_crc32c_check_value() {
        // Standard CRC-32C check value
        assert_eq!(crc32c(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_lun_encoding() {
        assert_eq!(encode_lun(0), 0);
        assert_eq!(encode_lun(1).to_be_bytes()[..2], [0, 1]);
        assert_eq!(encode_lun(0x0102).to_be_bytes()[..2], [1, 2]);
        assert_eq!(decode_lun(encode_lun(0x1234)), 0x1234);
    }

    #[test]
    fn test_data_out_fields() {
        let pdu = IscsiPdu::scsi_data_out(2, 0x10, 0x20, 3, 65536, true, vec![0u8; 512]);
        let parsed = IscsiPdu::from_bytes(&pdu.to_bytes()).unwrap();
        assert_eq!(parsed.opcode, opcode::SCSI_DATA_OUT);
        assert_eq!(decode_lun(parsed.lun), 2);
        assert_eq!(parsed.itt, 0x10);
        assert_eq!(parsed.ttt(), 0x20);
        assert_eq!(parsed.data_sn(), 3);
        assert_eq!(parsed.buffer_offset(), 65536);
        assert_eq!(parsed.data.len(), 512);
        assert!(parsed.is_final());
    }

    #[test]
    fn test_task_management_request_layout() {
        let pdu = IscsiPdu::task_management_request(tmf_function::ABORT_TASK, 1, 8, 4, 11, 9);
        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0], 0x40 | opcode::TASK_MANAGEMENT_REQUEST);
        assert_eq!(bytes[1], 0x80 | tmf_function::ABORT_TASK);
        assert_eq!(BigEndian::read_u32(&bytes[20..24]), 4);
        assert_eq!(BigEndian::read_u32(&bytes[24..28]), 11);
        assert_eq!(BigEndian::read_u32(&bytes[32..36]), 9);
    }

    #[test]
    fn test_reject_reason_names() {
        assert_eq!(reject_reason_str(reject_reason::PROTOCOL_ERROR), "Protocol Error");
        assert_eq!(reject_reason_str(reject_reason::WAITING_FOR_LOGOUT), "Waiting For Logout");
        assert_eq!(reject_reason_str(0x42), "Unknown");
    }

    #[test]
    fn test_parse_text_parameters() {
        let data = b"Key1=Value1\0Key2=Value2\0";
        let params = parse_text_parameters(data).unwrap();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0], ("Key1".to_string(), "Value1".to_string()));
        assert_eq!(params[1], ("Key2".to_string(), "Value2".to_string()));
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
    fn test_login_request_roundtrip() {
        let isid = [0x80, 0x12, 0x34, 0x56, 0x78, 0x9A];
        let pdu = IscsiPdu::login_request(
            isid,
            0,
            0,
            1,
            1,
            0,
            stage::SECURITY_NEG,
            stage::LOGIN_OP_NEG,
            true,
            b"InitiatorName=iqn.test\0".to_vec(),
        );
        assert!(pdu.immediate);

        let login = IscsiPdu::from_bytes(&pdu.to_bytes()).unwrap();
        assert_eq!(login.lun.to_be_bytes()[..6], isid);
        assert_eq!(login.tsih(), 0);
        assert_eq!(login.itt, 1);
        assert_eq!(login.flags, flags::TRANSIT | (stage::SECURITY_NEG << 2) | stage::LOGIN_OP_NEG);
        let params = parse_text_parameters(&login.data).unwrap();
        assert_eq!(params[0].1, "iqn.test");
    }

    #[test]
    fn test_opcode_names() {
        let mut pdu = IscsiPdu::new();

        pdu.opcode = opcode::LOGIN_REQUEST;
        assert_eq!(pdu.opcode_name(), "Login Request");

        pdu.opcode = opcode::SCSI_COMMAND;
        assert_eq!(pdu.opcode_name(), "SCSI Command");

        pdu.opcode = opcode::R2T;
        assert_eq!(pdu.opcode_name(), "Ready To Transfer");

        pdu.opcode = 0xFF;
        assert_eq!(pdu.opcode_name(), "Unknown");
    }

    #[test]
    fn test_immediate_flag() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::LOGIN_REQUEST;
        pdu.immediate = true;

        let bytes = pdu.to_bytes();
        assert_eq!(bytes[0] & 0x40, 0x40);

        let parsed = IscsiPdu::from_bytes(&bytes).unwrap();
        assert!(parsed.immediate);
    }

    #[test]
    fn test_data_padding() {
        let mut pdu = IscsiPdu::new();
        pdu.opcode = opcode::TEXT_REQUEST;
        pdu.data = vec![1, 2, 3];

        let bytes = pdu.to_bytes();
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(bytes.len(), BHS_SIZE + 4);
        assert_eq!(data_segment_length(&bytes), 3);
    }
}
