//! Fixed-format ATAPI sense data.

use core::fmt;

use crate::consts::*;

/// Raw REQUEST SENSE payload plus decoding helpers.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub raw: [u8; SENSE_LEN],
}

impl SenseData {
    pub const fn empty() -> Self {
        SenseData { raw: [0; SENSE_LEN] }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; SENSE_LEN];
        let n = bytes.len().min(SENSE_LEN);
        raw[..n].copy_from_slice(&bytes[..n]);
        SenseData { raw }
    }

    /// Current or deferred error in fixed or descriptor format.
    pub fn is_valid(&self) -> bool {
        (0x70..=0x73).contains(&(self.raw[0] & 0x7F))
    }

    pub fn key(&self) -> u8 {
        self.raw[2] & 0x0F
    }

    pub fn asc(&self) -> u8 {
        self.raw[12]
    }

    pub fn ascq(&self) -> u8 {
        self.raw[13]
    }

    pub fn information(&self) -> u32 {
        u32::from_be_bytes([self.raw[3], self.raw[4], self.raw[5], self.raw[6]])
    }

    pub fn is_unit_attention(&self) -> bool {
        self.key() == SENSE_UNIT_ATTENTION
    }

    pub fn is_becoming_ready(&self) -> bool {
        self.key() == SENSE_NOT_READY && self.asc() == ASC_BECOMING_READY
    }

    pub fn is_medium_not_present(&self) -> bool {
        self.key() == SENSE_NOT_READY && self.asc() == ASC_MEDIUM_NOT_PRESENT
    }

    /// Conditions that clear up by themselves and are worth a retry.
    pub fn is_transient(&self) -> bool {
        self.is_unit_attention() || self.is_becoming_ready()
    }

    pub fn key_name(&self) -> &'static str {
        match self.key() {
            SENSE_NO_SENSE => "No Sense",
            SENSE_RECOVERED_ERROR => "Recovered Error",
            SENSE_NOT_READY => "Not Ready",
            SENSE_MEDIUM_ERROR => "Medium Error",
            SENSE_HARDWARE_ERROR => "Hardware Error",
            SENSE_ILLEGAL_REQUEST => "Illegal Request",
            SENSE_UNIT_ATTENTION => "Unit Attention",
            SENSE_DATA_PROTECT => "Data Protect",
            SENSE_BLANK_CHECK => "Blank Check",
            SENSE_ABORTED_COMMAND => "Aborted Command",
            _ => "Reserved",
        }
    }
}

impl Default for SenseData {
    fn default() -> Self {
        SenseData::empty()
    }
}

impl fmt::Debug for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenseData")
            .field("key", &self.key())
            .field("asc", &self.asc())
            .field("ascq", &self.ascq())
            .finish()
    }
}

impl fmt::Display for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "sense format 0x{:02x}", self.raw[0]);
        }
        write!(
            f,
            "SK={:x} ASC={:02x} ASCQ={:02x} INFO={:08x} ({})",
            self.key(),
            self.asc(),
            self.ascq(),
            self.information(),
            self.key_name()
        )?;
        if self.is_becoming_ready() {
            write!(f, " [becoming ready]")?;
        } else if self.is_medium_not_present() {
            write!(f, " [medium not present]")?;
        }
        Ok(())
    }
}
