//! Wi-Fi station credentials and the flash record that persists them across boots.
//!
//! The record occupies the first [`RECORD_LEN`] bytes of one erase sector:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 4    | magic `"SUBC"`                          |
//! | 4      | 1    | format version                           |
//! | 5      | 1    | ssid length                              |
//! | 6      | 1    | passphrase length                        |
//! | 7      | 1    | reserved (0)                             |
//! | 8      | 32   | ssid slot                                |
//! | 40     | 64   | passphrase slot                          |
//! | 104    | 4    | CRC-32 (ISO-HDLC) of bytes 0..104, LE    |

use core::fmt;

use crc::{CRC_32_ISO_HDLC, Crc};
use embedded_storage::nor_flash::NorFlash;
use heapless::String;
use log::{debug, info, warn};

pub const SSID_MAX: usize = 32;
pub const PASSPHRASE_MAX: usize = 64;
/// WPA2 personal passphrases are 8..=63 ASCII characters or a 64 hex-digit PSK.
pub const PASSPHRASE_MIN: usize = 8;

pub const RECORD_MAGIC: [u8; 4] = *b"SUBC";
pub const RECORD_VERSION: u8 = 1;
pub const RECORD_LEN: usize = 108;

const SSID_OFFSET: usize = 8;
const PASSPHRASE_OFFSET: usize = SSID_OFFSET + SSID_MAX;
const CRC_OFFSET: usize = PASSPHRASE_OFFSET + PASSPHRASE_MAX;

const RECORD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Reasons a credential set is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialError {
    EmptySsid,
    SsidTooLong,
    PassphraseLength,
    NotUtf8,
}

impl fmt::Display for CredentialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialError::EmptySsid => f.write_str("ssid is empty"),
            CredentialError::SsidTooLong => write!(f, "ssid longer than {} bytes", SSID_MAX),
            CredentialError::PassphraseLength => write!(
                f,
                "passphrase must be empty or {}..={} bytes",
                PASSPHRASE_MIN, PASSPHRASE_MAX
            ),
            CredentialError::NotUtf8 => f.write_str("credentials are not valid UTF-8"),
        }
    }
}

/// SSID and passphrase for the Wi-Fi station. An empty passphrase means an open network.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    ssid: String<SSID_MAX>,
    passphrase: String<PASSPHRASE_MAX>,
}

impl Credentials {
    pub fn new(ssid: &str, passphrase: &str) -> Result<Self, CredentialError> {
        if ssid.is_empty() {
            return Err(CredentialError::EmptySsid);
        }
        if !passphrase.is_empty()
            && !(PASSPHRASE_MIN..=PASSPHRASE_MAX).contains(&passphrase.len())
        {
            return Err(CredentialError::PassphraseLength);
        }
        let ssid = String::try_from(ssid).map_err(|_| CredentialError::SsidTooLong)?;
        let passphrase =
            String::try_from(passphrase).map_err(|_| CredentialError::PassphraseLength)?;
        Ok(Self { ssid, passphrase })
    }

    /// Builds credentials from raw bytes as written by a companion app.
    pub fn from_bytes(ssid: &[u8], passphrase: &[u8]) -> Result<Self, CredentialError> {
        let ssid = core::str::from_utf8(ssid).map_err(|_| CredentialError::NotUtf8)?;
        let passphrase = core::str::from_utf8(passphrase).map_err(|_| CredentialError::NotUtf8)?;
        Self::new(ssid, passphrase)
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[0..4].copy_from_slice(&RECORD_MAGIC);
        record[4] = RECORD_VERSION;
        record[5] = self.ssid.len() as u8;
        record[6] = self.passphrase.len() as u8;
        record[SSID_OFFSET..SSID_OFFSET + self.ssid.len()].copy_from_slice(self.ssid.as_bytes());
        record[PASSPHRASE_OFFSET..PASSPHRASE_OFFSET + self.passphrase.len()]
            .copy_from_slice(self.passphrase.as_bytes());
        let crc = RECORD_CRC.checksum(&record[..CRC_OFFSET]);
        record[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        record
    }
}

// The passphrase never reaches the log.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid.as_str())
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// What a well-formed sector decodes to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Record {
    Erased,
    Valid(Credentials),
}

/// Errors from the credential store.
///
/// `NoFreePages` and `NewVersionFound` are recoverable by erasing the sector;
/// `Flash` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError<E> {
    NoFreePages,
    NewVersionFound,
    NotInitialised,
    Flash(E),
}

impl<E> StoreError<E> {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StoreError::NoFreePages | StoreError::NewVersionFound)
    }
}

impl<E: fmt::Debug> fmt::Display for StoreError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NoFreePages => f.write_str("credential sector is corrupt"),
            StoreError::NewVersionFound => f.write_str("credential record has a newer format"),
            StoreError::NotInitialised => f.write_str("credential store used before init"),
            StoreError::Flash(e) => write!(f, "flash error: {:?}", e),
        }
    }
}

fn decode_record<E>(raw: &[u8; RECORD_LEN]) -> Result<Record, StoreError<E>> {
    if raw[0..4] == [0xFF; 4] {
        return Ok(Record::Erased);
    }
    if raw[0..4] != RECORD_MAGIC {
        return Err(StoreError::NoFreePages);
    }
    if raw[4] > RECORD_VERSION {
        return Err(StoreError::NewVersionFound);
    }
    let crc = u32::from_le_bytes([
        raw[CRC_OFFSET],
        raw[CRC_OFFSET + 1],
        raw[CRC_OFFSET + 2],
        raw[CRC_OFFSET + 3],
    ]);
    if crc != RECORD_CRC.checksum(&raw[..CRC_OFFSET]) {
        return Err(StoreError::NoFreePages);
    }
    let ssid_len = raw[5] as usize;
    let passphrase_len = raw[6] as usize;
    if ssid_len > SSID_MAX || passphrase_len > PASSPHRASE_MAX {
        return Err(StoreError::NoFreePages);
    }
    Credentials::from_bytes(
        &raw[SSID_OFFSET..SSID_OFFSET + ssid_len],
        &raw[PASSPHRASE_OFFSET..PASSPHRASE_OFFSET + passphrase_len],
    )
    .map(Record::Valid)
    .map_err(|_| StoreError::NoFreePages)
}

/// Credential store on one erase sector of a [`NorFlash`].
pub struct CredentialStore<F: NorFlash> {
    flash: F,
    offset: u32,
    state: Option<Record>,
}

impl<F: NorFlash> CredentialStore<F> {
    /// `offset` must be aligned to `F::ERASE_SIZE`.
    pub fn new(flash: F, offset: u32) -> Self {
        Self {
            flash,
            offset,
            state: None,
        }
    }

    /// Reads and validates the sector.
    pub fn init(&mut self) -> Result<(), StoreError<F::Error>> {
        let mut raw = [0u8; RECORD_LEN];
        self.flash
            .read(self.offset, &mut raw)
            .map_err(StoreError::Flash)?;
        let record = decode_record(&raw)?;
        match &record {
            Record::Erased => info!("Credential store is empty"),
            Record::Valid(credentials) => {
                info!("Credential store holds ssid {:?}", credentials.ssid())
            }
        }
        self.state = Some(record);
        Ok(())
    }

    /// Erases the sector; the store is empty afterwards.
    pub fn erase(&mut self) -> Result<(), StoreError<F::Error>> {
        warn!("Erasing credential sector at {:#x}", self.offset);
        self.flash
            .erase(self.offset, self.offset + F::ERASE_SIZE as u32)
            .map_err(StoreError::Flash)?;
        self.state = Some(Record::Erased);
        Ok(())
    }

    pub fn is_provisioned(&self) -> bool {
        matches!(self.state, Some(Record::Valid(_)))
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        match &self.state {
            Some(Record::Valid(credentials)) => Some(credentials),
            _ => None,
        }
    }

    /// Replaces any stored credentials with `credentials`.
    pub fn store(&mut self, credentials: &Credentials) -> Result<(), StoreError<F::Error>> {
        if self.state.is_none() {
            return Err(StoreError::NotInitialised);
        }
        let record = credentials.encode();
        self.flash
            .erase(self.offset, self.offset + F::ERASE_SIZE as u32)
            .map_err(StoreError::Flash)?;
        self.flash
            .write(self.offset, &record)
            .map_err(StoreError::Flash)?;
        debug!("Persisted credentials for ssid {:?}", credentials.ssid());
        self.state = Some(Record::Valid(credentials.clone()));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn release(self) -> F {
        self.flash
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use embedded_storage::nor_flash::{
        ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
    };

    pub const SECTOR: usize = 4096;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RamFlashError(pub NorFlashErrorKind);

    impl NorFlashError for RamFlashError {
        fn kind(&self) -> NorFlashErrorKind {
            self.0
        }
    }

    /// Two sectors of NOR-like RAM: writes can only clear bits.
    pub struct RamFlash {
        pub data: [u8; 2 * SECTOR],
        pub fail_reads: bool,
    }

    impl RamFlash {
        pub fn erased() -> Self {
            Self {
                data: [0xFF; 2 * SECTOR],
                fail_reads: false,
            }
        }
    }

    impl ErrorType for RamFlash {
        type Error = RamFlashError;
    }

    impl ReadNorFlash for RamFlash {
        const READ_SIZE: usize = 4;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            if self.fail_reads {
                return Err(RamFlashError(NorFlashErrorKind::Other));
            }
            let start = offset as usize;
            bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }
    }

    impl NorFlash for RamFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = SECTOR;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if from as usize % SECTOR != 0 || to as usize % SECTOR != 0 {
                return Err(RamFlashError(NorFlashErrorKind::NotAligned));
            }
            self.data[from as usize..to as usize].fill(0xFF);
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            if offset as usize % 4 != 0 || bytes.len() % 4 != 0 {
                return Err(RamFlashError(NorFlashErrorKind::NotAligned));
            }
            let start = offset as usize;
            for (cell, byte) in self.data[start..start + bytes.len()].iter_mut().zip(bytes) {
                *cell &= *byte;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{RamFlash, SECTOR};
    use super::*;

    fn initialised(flash: RamFlash) -> CredentialStore<RamFlash> {
        let mut store = CredentialStore::new(flash, SECTOR as u32);
        store.init().unwrap();
        store
    }

    #[test]
    fn test_record_len_is_word_aligned() {
        assert_eq!(RECORD_LEN % 4, 0);
        assert_eq!(CRC_OFFSET + 4, RECORD_LEN);
    }

    #[test]
    fn test_erased_sector_is_not_provisioned() {
        let store = initialised(RamFlash::erased());
        assert!(!store.is_provisioned());
        assert!(store.credentials().is_none());
    }

    #[test]
    fn test_store_then_reload() {
        let credentials = Credentials::new("lab-network", "correct horse").unwrap();
        let mut store = initialised(RamFlash::erased());
        store.store(&credentials).unwrap();
        assert!(store.is_provisioned());

        let reloaded = initialised(store.release());
        assert_eq!(reloaded.credentials(), Some(&credentials));
    }

    #[test]
    fn test_store_replaces_previous_record() {
        let mut store = initialised(RamFlash::erased());
        store
            .store(&Credentials::new("first", "password1").unwrap())
            .unwrap();
        let second = Credentials::new("second", "").unwrap();
        store.store(&second).unwrap();

        let reloaded = initialised(store.release());
        assert_eq!(reloaded.credentials(), Some(&second));
    }

    #[test]
    fn test_corrupt_crc_reports_no_free_pages() {
        let mut store = initialised(RamFlash::erased());
        store
            .store(&Credentials::new("lab", "password1").unwrap())
            .unwrap();
        let mut flash = store.release();
        flash.data[SECTOR + SSID_OFFSET] ^= 0x01;

        let mut store = CredentialStore::new(flash, SECTOR as u32);
        assert_eq!(store.init(), Err(StoreError::NoFreePages));
    }

    #[test]
    fn test_garbage_magic_reports_no_free_pages() {
        let mut flash = RamFlash::erased();
        flash.data[SECTOR..SECTOR + 4].copy_from_slice(b"JUNK");
        let mut store = CredentialStore::new(flash, SECTOR as u32);
        let err = store.init().unwrap_err();
        assert_eq!(err, StoreError::NoFreePages);
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_newer_format_reports_new_version() {
        let mut flash = RamFlash::erased();
        flash.data[SECTOR..SECTOR + 4].copy_from_slice(&RECORD_MAGIC);
        flash.data[SECTOR + 4] = RECORD_VERSION + 1;
        let mut store = CredentialStore::new(flash, SECTOR as u32);
        assert_eq!(store.init(), Err(StoreError::NewVersionFound));
    }

    #[test]
    fn test_erase_recovers_corrupt_sector() {
        let mut flash = RamFlash::erased();
        flash.data[SECTOR..SECTOR + 4].copy_from_slice(b"JUNK");
        let mut store = CredentialStore::new(flash, SECTOR as u32);
        assert!(store.init().is_err());
        store.erase().unwrap();
        store.init().unwrap();
        assert!(!store.is_provisioned());
    }

    #[test]
    fn test_flash_read_error_is_fatal() {
        let mut flash = RamFlash::erased();
        flash.fail_reads = true;
        let mut store = CredentialStore::new(flash, SECTOR as u32);
        let err = store.init().unwrap_err();
        assert!(matches!(err, StoreError::Flash(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_store_before_init_is_rejected() {
        let mut store = CredentialStore::new(RamFlash::erased(), SECTOR as u32);
        let credentials = Credentials::new("lab", "").unwrap();
        assert_eq!(store.store(&credentials), Err(StoreError::NotInitialised));
    }

    #[test]
    fn test_credential_validation() {
        assert_eq!(Credentials::new("", "password1"), Err(CredentialError::EmptySsid));
        assert_eq!(
            Credentials::new("lab", "short"),
            Err(CredentialError::PassphraseLength)
        );
        assert_eq!(
            Credentials::new(&"s".repeat(33), ""),
            Err(CredentialError::SsidTooLong)
        );
        assert_eq!(
            Credentials::new("lab", &"p".repeat(65)),
            Err(CredentialError::PassphraseLength)
        );
        assert!(Credentials::new(&"s".repeat(32), &"p".repeat(64)).is_ok());
        assert_eq!(
            Credentials::from_bytes(&[0xFF, 0xFE], b""),
            Err(CredentialError::NotUtf8)
        );
    }

    #[test]
    fn test_debug_redacts_passphrase() {
        let credentials = Credentials::new("lab", "hunter22").unwrap();
        let rendered = format!("{:?}", credentials);
        assert!(rendered.contains("lab"));
        assert!(!rendered.contains("hunter22"));
    }
}
