// 🔢 PIN Partial Disclosure - the portal asks for K of N digits, at positions
// it picks at run time. Digits are requested fresh every run and never cached.

use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::error::SyncError;
use crate::portal::PortalDriver;
use crate::runlog::RunLog;
use crate::secrets::SecretProvider;

/// Default full PIN length
pub const DEFAULT_PIN_LENGTH: u8 = 6;

/// Default delay between digit presses
pub const DEFAULT_PACING: Duration = Duration::from_millis(200);

/// Marks a requested digit in the positional mask
const MASK_REQUESTED: char = '_';
/// Marks a digit the portal did not ask for
const MASK_FILLER: char = '*';

// ============================================================================
// PROTOCOL ERRORS
// ============================================================================

/// Never silently truncated or padded - every mismatch aborts the run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChallengeError {
    #[error("portal announced no PIN positions")]
    EmptyPositions,

    #[error("position {position} is outside 1..={length}")]
    PositionOutOfRange { position: u8, length: u8 },

    #[error("position {0} announced twice")]
    DuplicatePosition(u8),

    #[error("expected {expected} digits, received {received}")]
    DigitCountMismatch { expected: usize, received: usize },

    #[error("disclosed value contains a non-digit character")]
    NonDigit,
}

// ============================================================================
// CHALLENGE
// ============================================================================

/// Positions announced by the portal, validated against the PIN length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinChallenge {
    positions: Vec<u8>,
    pin_length: u8,
}

impl PinChallenge {
    pub fn new(positions: Vec<u8>, pin_length: u8) -> Result<Self, ChallengeError> {
        if positions.is_empty() {
            return Err(ChallengeError::EmptyPositions);
        }

        let mut seen = Vec::with_capacity(positions.len());
        for &position in &positions {
            if position == 0 || position > pin_length {
                return Err(ChallengeError::PositionOutOfRange {
                    position,
                    length: pin_length,
                });
            }
            if seen.contains(&position) {
                return Err(ChallengeError::DuplicatePosition(position));
            }
            seen.push(position);
        }

        Ok(PinChallenge {
            positions,
            pin_length,
        })
    }

    /// 1-based positions, in the order the portal announced them
    pub fn positions(&self) -> &[u8] {
        &self.positions
    }

    /// `_` where a digit is wanted, `*` elsewhere: `[1,3,6]` of 6 -> `_*_**_`
    pub fn mask(&self) -> String {
        (1..=self.pin_length)
            .map(|slot| {
                if self.positions.contains(&slot) {
                    MASK_REQUESTED
                } else {
                    MASK_FILLER
                }
            })
            .collect()
    }

    /// Check the operator's answer: exactly one digit per announced position
    pub fn validate(&self, disclosed: &str) -> Result<Vec<char>, ChallengeError> {
        let digits: Vec<char> = disclosed.trim().chars().collect();

        if digits.len() != self.positions.len() {
            return Err(ChallengeError::DigitCountMismatch {
                expected: self.positions.len(),
                received: digits.len(),
            });
        }
        if !digits.iter().all(|c| c.is_ascii_digit()) {
            return Err(ChallengeError::NonDigit);
        }

        Ok(digits)
    }
}

// ============================================================================
// HANDLER
// ============================================================================

/// Runs the challenge step of a login: read positions, ask the operator,
/// validate, then press the digits one at a time.
#[derive(Debug, Clone)]
pub struct PinHandler {
    pub pin_length: u8,
    pub pacing: Duration,
}

impl PinHandler {
    pub fn new(pin_length: u8, pacing: Duration) -> Self {
        PinHandler { pin_length, pacing }
    }

    pub fn run(
        &self,
        driver: &mut dyn PortalDriver,
        secrets: &dyn SecretProvider,
        log: &RunLog,
    ) -> Result<(), SyncError> {
        log.push("Waiting for PIN challenge...");
        let positions = driver.await_challenge()?;

        let challenge = PinChallenge::new(positions, self.pin_length)?;
        log.push(format!("PIN positions requested: {:?}", challenge.positions()));

        let disclosed = secrets.request_pin_digits(challenge.positions(), &challenge.mask())?;
        let digits = challenge.validate(disclosed.expose())?;
        drop(disclosed);

        self.submit_digits(driver, &digits, log)?;
        log.push("PIN digits entered");
        Ok(())
    }

    /// Press each digit in order with a pause in between
    pub fn submit_digits(
        &self,
        driver: &mut dyn PortalDriver,
        digits: &[char],
        log: &RunLog,
    ) -> Result<(), SyncError> {
        for (i, digit) in digits.iter().enumerate() {
            if i > 0 && !self.pacing.is_zero() {
                thread::sleep(self.pacing);
            }
            log.push(format!("Entering digit {}/{}...", i + 1, digits.len()));
            driver.submit_digit(*digit)?;
        }
        Ok(())
    }
}

impl Default for PinHandler {
    fn default() -> Self {
        Self::new(DEFAULT_PIN_LENGTH, DEFAULT_PACING)
    }
}

// ============================================================================
// TESTS
// ============================================================================
