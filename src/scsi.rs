//! SCSI tasks, sense data and data buffers
//!
//! A `ScsiTask` describes one SCSI command as the caller sees it: the CDB,
//! the transfer direction and the buffers. The engine fills in status,
//! sense and residual when the command completes.

use crate::error::{IscsiError, ScsiResult};
use crate::pdu::scsi_status;
use byteorder::{BigEndian, ByteOrder};

/// SCSI command opcodes used by the task constructors
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    Inquiry = 0x12,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    SynchronizeCache10 = 0x35,
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const BLANK_CHECK: u8 = 0x08;
    pub const ABORTED_COMMAND: u8 = 0x0B;
    pub const VOLUME_OVERFLOW: u8 = 0x0D;
    pub const MISCOMPARE: u8 = 0x0E;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const POWER_ON_RESET: u8 = 0x29;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// Transfer direction of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XferDir {
    #[default]
    None,
    Read,
    Write,
}

/// Completion status delivered for a PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Good,
    CheckCondition,
    ConditionMet,
    Busy,
    ReservationConflict,
    TaskSetFull,
    AcaActive,
    TaskAborted,
    /// Login was redirected to another portal
    Redirect,
    /// Protocol or transport failure
    Error,
    /// Cancelled locally before completion
    Cancelled,
    /// Status byte this library has no name for
    Other(u8),
}

impl CommandStatus {
    /// Map a SCSI status byte
    pub fn from_scsi(status: u8) -> Self {
        match status {
            scsi_status::GOOD => CommandStatus::Good,
            scsi_status::CHECK_CONDITION => CommandStatus::CheckCondition,
            scsi_status::CONDITION_MET => CommandStatus::ConditionMet,
            scsi_status::BUSY => CommandStatus::Busy,
            scsi_status::RESERVATION_CONFLICT => CommandStatus::ReservationConflict,
            scsi_status::TASK_SET_FULL => CommandStatus::TaskSetFull,
            scsi_status::ACA_ACTIVE => CommandStatus::AcaActive,
            scsi_status::TASK_ABORTED => CommandStatus::TaskAborted,
            other => CommandStatus::Other(other),
        }
    }

    pub fn is_good(&self) -> bool {
        matches!(self, CommandStatus::Good | CommandStatus::ConditionMet)
    }
}

/// Residual reported with the final status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResidualStatus {
    #[default]
    None,
    Underflow,
    Overflow,
}

/// Sense-key specific information (SPC-4 4.5.2.4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SenseKeySpecific {
    /// Error is in the CDB (true) or in the parameter data (false)
    pub ill_param_in_cdb: bool,
    pub bit_pointer_valid: bool,
    pub bit_pointer: u8,
    pub field_pointer: u16,
}

/// Parsed SCSI sense data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    /// Response code (0x70-0x73)
    pub error_type: u8,
    pub key: u8,
    /// ASC in the high byte, ASCQ in the low byte
    pub ascq: u16,
    pub sense_specific: Option<SenseKeySpecific>,
}

impl SenseData {
    pub fn new(key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            error_type: 0x70,
            key,
            ascq: ((asc as u16) << 8) | ascq as u16,
            sense_specific: None,
        }
    }

    /// Additional Sense Code
    pub fn asc(&self) -> u8 {
        (self.ascq >> 8) as u8
    }

    /// Parse sense bytes (without the iSCSI SenseLength prefix)
    ///
    /// Handles fixed (0x70/0x71) and descriptor (0x72/0x73) formats.
    pub fn parse(sense: &[u8]) -> ScsiResult<Self> {
        if sense.is_empty() {
            return Err(IscsiError::Scsi("Empty sense data".to_string()));
        }

        let error_type = sense[0] & 0x7F;
        match error_type {
            0x70 | 0x71 => {
                if sense.len() < 14 {
                    return Err(IscsiError::Scsi(format!(
                        "Fixed format sense too short: {} bytes",
                        sense.len()
                    )));
                }
                let sense_specific = if sense.len() >= 18 && sense[15] & 0x80 != 0 {
                    Some(parse_sense_key_specific(&sense[15..18]))
                } else {
                    None
                };
                Ok(SenseData {
                    error_type,
                    key: sense[2] & 0x0F,
                    ascq: BigEndian::read_u16(&sense[12..14]),
                    sense_specific,
                })
            }
            0x72 | 0x73 => {
                if sense.len() < 4 {
                    return Err(IscsiError::Scsi(format!(
                        "Descriptor format sense too short: {} bytes",
                        sense.len()
                    )));
                }
                Ok(SenseData {
                    error_type,
                    key: sense[1] & 0x0F,
                    ascq: BigEndian::read_u16(&sense[2..4]),
                    sense_specific: find_sense_key_specific_descriptor(sense),
                })
            }
            other => Err(IscsiError::Scsi(format!(
                "Unknown sense response code 0x{:02x}",
                other
            ))),
        }
    }

    /// Parse the data segment of a SCSI response (2-byte SenseLength, then sense)
    pub fn from_response_data(data: &[u8]) -> ScsiResult<Self> {
        if data.len() < 2 {
            return Err(IscsiError::Scsi("Sense data missing".to_string()));
        }
        let len = BigEndian::read_u16(&data[0..2]) as usize;
        let end = (2 + len).min(data.len());
        Self::parse(&data[2..end])
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];

        // Response code: 0x70 = current error, fixed format
        data[0] = 0x70;
        data[2] = self.key & 0x0F;
        // Additional sense length
        data[7] = 10;
        BigEndian::write_u16(&mut data[12..14], self.ascq);

        if let Some(sks) = self.sense_specific {
            data[15] = 0x80
                | if sks.ill_param_in_cdb { 0x40 } else { 0 }
                | if sks.bit_pointer_valid { 0x08 } else { 0 }
                | (sks.bit_pointer & 0x07);
            BigEndian::write_u16(&mut data[16..18], sks.field_pointer);
        }

        data
    }
}

fn parse_sense_key_specific(bytes: &[u8]) -> SenseKeySpecific {
    SenseKeySpecific {
        ill_param_in_cdb: bytes[0] & 0x40 != 0,
        bit_pointer_valid: bytes[0] & 0x08 != 0,
        bit_pointer: bytes[0] & 0x07,
        field_pointer: BigEndian::read_u16(&bytes[1..3]),
    }
}

/// Walk the descriptor list looking for a sense-key specific descriptor (type 0x02)
fn find_sense_key_specific_descriptor(sense: &[u8]) -> Option<SenseKeySpecific> {
    let additional = *sense.get(7)? as usize;
    let end = (8 + additional).min(sense.len());
    let mut pos = 8;
    while pos + 2 <= end {
        let desc_type = sense[pos];
        let desc_len = sense[pos + 1] as usize;
        if desc_type == 0x02 && pos + 7 <= end && sense[pos + 4] & 0x80 != 0 {
            return Some(parse_sense_key_specific(&sense[pos + 4..pos + 7]));
        }
        pos += 2 + desc_len;
    }
    None
}

// ============================================================================
// Data buffers
// ============================================================================

/// Caller buffer made of one or more segments, addressed as one linear range
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoVector {
    segments: Vec<Vec<u8>>,
}

impl IoVector {
    /// A single flat buffer
    pub fn flat(data: Vec<u8>) -> Self {
        IoVector { segments: vec![data] }
    }

    /// A scatter/gather list
    pub fn scatter(segments: Vec<Vec<u8>>) -> Self {
        IoVector { segments }
    }

    /// A zero-filled flat buffer of `len` bytes
    pub fn zeroed(len: usize) -> Self {
        Self::flat(vec![0u8; len])
    }

    /// Total length of all segments
    pub fn len(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    /// Copy `len` bytes starting at `offset` into a new buffer
    pub fn read_at(&self, offset: usize, len: usize) -> ScsiResult<Vec<u8>> {
        if offset + len > self.len() {
            return Err(IscsiError::Scsi(format!(
                "Read of {} bytes at offset {} beyond buffer of {} bytes",
                len,
                offset,
                self.len()
            )));
        }

        let mut out = Vec::with_capacity(len);
        let mut skip = offset;
        for seg in &self.segments {
            if out.len() == len {
                break;
            }
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let take = (seg.len() - skip).min(len - out.len());
            out.extend_from_slice(&seg[skip..skip + take]);
            skip = 0;
        }
        Ok(out)
    }

    /// Copy `data` into the buffer starting at `offset`
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> ScsiResult<()> {
        if offset + data.len() > self.len() {
            return Err(IscsiError::Scsi(format!(
                "Write of {} bytes at offset {} beyond buffer of {} bytes",
                data.len(),
                offset,
                self.len()
            )));
        }

        let mut skip = offset;
        let mut written = 0;
        for seg in &mut self.segments {
            if written == data.len() {
                break;
            }
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let take = (seg.len() - skip).min(data.len() - written);
            seg[skip..skip + take].copy_from_slice(&data[written..written + take]);
            written += take;
            skip = 0;
        }
        Ok(())
    }

    /// Flatten all segments into one buffer
    pub fn to_vec(&self) -> Vec<u8> {
        self.segments.concat()
    }
}

// ============================================================================
// SCSI task
// ============================================================================

/// One SCSI command and, once completed, its results
#[derive(Debug, Clone, Default)]
pub struct ScsiTask {
    pub cdb: Vec<u8>,
    pub xfer_dir: XferDir,
    /// Expected data transfer length in bytes
    pub expected_xfer_len: u32,
    /// Payload of a WRITE
    pub data_out: Option<IoVector>,
    /// Caller buffer that Data-In is written into, at the PDU buffer offset
    pub data_in_buffer: Option<IoVector>,
    /// Data-In collected when no caller buffer was supplied
    pub data_in: Vec<u8>,

    pub status: Option<CommandStatus>,
    pub sense: Option<SenseData>,
    pub residual_status: ResidualStatus,
    pub residual: u32,

    // Stamped when the task is submitted
    pub itt: u32,
    pub cmd_sn: u32,
    pub lun: u32,
}

impl ScsiTask {
    pub fn new(cdb: Vec<u8>, xfer_dir: XferDir, expected_xfer_len: u32) -> Self {
        ScsiTask {
            cdb,
            xfer_dir,
            expected_xfer_len,
            ..Default::default()
        }
    }

    /// Attach a WRITE payload
    pub fn with_data_out(mut self, data: IoVector) -> Self {
        self.data_out = Some(data);
        self
    }

    /// Read into a caller-supplied buffer instead of `data_in`
    pub fn with_data_in_buffer(mut self, buffer: IoVector) -> Self {
        self.data_in_buffer = Some(buffer);
        self
    }

    /// TEST UNIT READY
    pub fn test_unit_ready() -> Self {
        Self::new(vec![ScsiOpcode::TestUnitReady as u8, 0, 0, 0, 0, 0], XferDir::None, 0)
    }

    /// Standard INQUIRY
    pub fn inquiry(alloc_len: u16) -> Self {
        let len = alloc_len.to_be_bytes();
        Self::new(
            vec![ScsiOpcode::Inquiry as u8, 0, 0, len[0], len[1], 0],
            XferDir::Read,
            alloc_len as u32,
        )
    }

    /// READ CAPACITY (10)
    pub fn read_capacity10() -> Self {
        let mut cdb = vec![0u8; 10];
        cdb[0] = ScsiOpcode::ReadCapacity10 as u8;
        Self::new(cdb, XferDir::Read, 8)
    }

    /// READ (10)
    pub fn read10(lba: u32, blocks: u16, block_size: u32) -> Self {
        let mut cdb = vec![0u8; 10];
        cdb[0] = ScsiOpcode::Read10 as u8;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        Self::new(cdb, XferDir::Read, blocks as u32 * block_size)
    }

    /// WRITE (10) of `data`, which must be a whole number of blocks
    pub fn write10(lba: u32, data: Vec<u8>, block_size: u32) -> Self {
        let blocks = (data.len() as u32 / block_size.max(1)) as u16;
        let mut cdb = vec![0u8; 10];
        cdb[0] = ScsiOpcode::Write10 as u8;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], blocks);
        let len = data.len() as u32;
        Self::new(cdb, XferDir::Write, len).with_data_out(IoVector::flat(data))
    }

    /// SYNCHRONIZE CACHE (10) of the whole device
    pub fn synchronize_cache10() -> Self {
        let mut cdb = vec![0u8; 10];
        cdb[0] = ScsiOpcode::SynchronizeCache10 as u8;
        Self::new(cdb, XferDir::None, 0)
    }

    /// Length of the WRITE payload
    pub fn data_out_len(&self) -> usize {
        self.data_out.as_ref().map_or(0, IoVector::len)
    }

    /// Data received for a READ, from whichever buffer collected it
    pub fn data(&self) -> Vec<u8> {
        match &self.data_in_buffer {
            Some(buffer) => buffer.to_vec(),
            None => self.data_in.clone(),
        }
    }

    /// Check the task can be turned into a SCSI command
    pub fn validate(&self) -> ScsiResult<()> {
        if self.cdb.is_empty() || self.cdb.len() > 16 {
            return Err(IscsiError::Scsi(format!(
                "CDB length {} out of range (1-16 bytes)",
                self.cdb.len()
            )));
        }

        if self.xfer_dir == XferDir::Write {
            let len = self.data_out_len();
            if len == 0 && self.expected_xfer_len > 0 {
                return Err(IscsiError::Scsi("WRITE task has no data".to_string()));
            }
            if len != self.expected_xfer_len as usize {
                return Err(IscsiError::Scsi(format!(
                    "WRITE payload is {} bytes but expected transfer length is {}",
                    len, self.expected_xfer_len
                )));
            }
        }

        Ok(())
    }

    /// Clear results so the task can be issued again
    pub fn reset_results(&mut self) {
        self.status = None;
        self.sense = None;
        self.residual_status = ResidualStatus::None;
        self.residual = 0;
        self.data_in.clear();
    }
}

/// Parse READ CAPACITY (10) data into (last LBA, block size)
pub fn parse_read_capacity10(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 8 {
        return None;
    }
    Some((BigEndian::read_u32(&data[0..4]), BigEndian::read_u32(&data[4..8])))
}

// ============================================================================
// Unit Tests
// ============================================================================
