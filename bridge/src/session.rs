//! One BLE commissioning exchange with a companion app.
//!
//! The GATT layer feeds raw characteristic writes in here; the session decides
//! whether they are allowed and turns them into [`Credentials`] on `apply`.

use core::fmt;

use heapless::Vec;
use log::{info, warn};

use crate::config::SecurityTier;
use crate::credentials::{CredentialError, Credentials, PASSPHRASE_MAX, SSID_MAX};

/// Value exposed on the status characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Idle = 0,
    ProofAccepted = 1,
    ProofRejected = 2,
    CredentialsRejected = 3,
    Applied = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// A credential write arrived before the proof of possession.
    ProofRequired,
    /// The written value does not fit its slot.
    TooLong,
    Invalid(CredentialError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::ProofRequired => f.write_str("proof of possession required"),
            SessionError::TooLong => f.write_str("value too long"),
            SessionError::Invalid(e) => write!(f, "invalid credentials: {}", e),
        }
    }
}

pub struct CommissioningSession {
    security: SecurityTier,
    pop: &'static str,
    proven: bool,
    ssid: Vec<u8, SSID_MAX>,
    passphrase: Vec<u8, PASSPHRASE_MAX>,
    status: SessionStatus,
}

impl CommissioningSession {
    pub fn new(security: SecurityTier, pop: &'static str) -> Self {
        Self {
            security,
            pop,
            proven: security == SecurityTier::Sec0,
            ssid: Vec::new(),
            passphrase: Vec::new(),
            status: SessionStatus::Idle,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Checks a proof-of-possession write. Under `Sec0` any proof is accepted.
    pub fn submit_proof(&mut self, proof: &[u8]) -> SessionStatus {
        if self.security == SecurityTier::Sec0 || constant_time_eq(proof, self.pop.as_bytes()) {
            self.proven = true;
            self.status = SessionStatus::ProofAccepted;
            info!("Commissioning proof accepted");
        } else {
            self.proven = false;
            self.status = SessionStatus::ProofRejected;
            warn!("Commissioning proof rejected");
        }
        self.status
    }

    pub fn set_ssid(&mut self, ssid: &[u8]) -> Result<(), SessionError> {
        self.require_proof()?;
        self.ssid = Vec::from_slice(ssid).map_err(|_| SessionError::TooLong)?;
        Ok(())
    }

    pub fn set_passphrase(&mut self, passphrase: &[u8]) -> Result<(), SessionError> {
        self.require_proof()?;
        self.passphrase = Vec::from_slice(passphrase).map_err(|_| SessionError::TooLong)?;
        Ok(())
    }

    /// Validates the collected SSID and passphrase. The session stays usable
    /// after a rejection so the companion can correct and retry.
    pub fn apply(&mut self) -> Result<Credentials, SessionError> {
        self.require_proof()?;
        match Credentials::from_bytes(&self.ssid, &self.passphrase) {
            Ok(credentials) => {
                self.status = SessionStatus::Applied;
                info!("Commissioning applied for ssid {:?}", credentials.ssid());
                Ok(credentials)
            }
            Err(e) => {
                self.status = SessionStatus::CredentialsRejected;
                warn!("Commissioning credentials rejected: {}", e);
                Err(SessionError::Invalid(e))
            }
        }
    }

    /// Forgets everything, e.g. when the central disconnects.
    pub fn reset(&mut self) {
        *self = Self::new(self.security, self.pop);
    }

    fn require_proof(&self) -> Result<(), SessionError> {
        if self.proven {
            Ok(())
        } else {
            Err(SessionError::ProofRequired)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sec0_accepts_credentials_without_proof() {
        let mut session = CommissioningSession::new(SecurityTier::Sec0, "");
        session.set_ssid(b"lab").unwrap();
        session.set_passphrase(b"password1").unwrap();
        let credentials = session.apply().unwrap();
        assert_eq!(credentials.ssid(), "lab");
        assert_eq!(session.status(), SessionStatus::Applied);
    }

    #[test]
    fn test_sec1_requires_proof() {
        let mut session = CommissioningSession::new(SecurityTier::Sec1, "abcd1234");
        assert_eq!(session.set_ssid(b"lab"), Err(SessionError::ProofRequired));
        assert_eq!(session.apply(), Err(SessionError::ProofRequired));
    }

    #[test]
    fn test_sec1_wrong_proof_is_rejected() {
        let mut session = CommissioningSession::new(SecurityTier::Sec1, "abcd1234");
        assert_eq!(session.submit_proof(b"abcd1235"), SessionStatus::ProofRejected);
        assert_eq!(session.submit_proof(b"abcd"), SessionStatus::ProofRejected);
        assert_eq!(session.set_ssid(b"lab"), Err(SessionError::ProofRequired));
    }

    #[test]
    fn test_sec1_full_exchange() {
        let mut session = CommissioningSession::new(SecurityTier::Sec1, "abcd1234");
        assert_eq!(session.submit_proof(b"abcd1234"), SessionStatus::ProofAccepted);
        session.set_ssid(b"camera-net").unwrap();
        session.set_passphrase(b"supersecret").unwrap();
        let credentials = session.apply().unwrap();
        assert_eq!(credentials.ssid(), "camera-net");
        assert_eq!(credentials.passphrase(), "supersecret");
    }

    #[test]
    fn test_invalid_credentials_keep_session_open() {
        let mut session = CommissioningSession::new(SecurityTier::Sec0, "");
        session.set_ssid(b"lab").unwrap();
        session.set_passphrase(b"short").unwrap();
        assert!(matches!(session.apply(), Err(SessionError::Invalid(_))));
        assert_eq!(session.status(), SessionStatus::CredentialsRejected);

        session.set_passphrase(b"long enough").unwrap();
        assert!(session.apply().is_ok());
    }

    #[test]
    fn test_oversized_ssid_write() {
        let mut session = CommissioningSession::new(SecurityTier::Sec0, "");
        assert_eq!(session.set_ssid(&[b'a'; 33]), Err(SessionError::TooLong));
    }

    #[test]
    fn test_reset_drops_proof() {
        let mut session = CommissioningSession::new(SecurityTier::Sec1, "abcd1234");
        session.submit_proof(b"abcd1234");
        session.reset();
        assert_eq!(session.status(), SessionStatus::Idle);
        assert_eq!(session.set_ssid(b"lab"), Err(SessionError::ProofRequired));
    }
}
