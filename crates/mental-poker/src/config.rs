//! table configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_BIT_LENGTH};

/// smallest prime size accepted for a shared modulus
pub const MIN_BIT_LENGTH: u64 = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// bits per shared-modulus prime
    pub bit_length: u64,
    pub starting_bankroll: u64,
    pub minimum_bet: u64,
    /// keys the reference deck; every peer at the table must agree on it
    pub session_secret: String,
    /// how long an escrowed key stays locked
    pub timelock_delay_secs: u64,
    /// how long to wait for any single peer message
    pub peer_timeout_ms: u64,
    /// open a missing peer's escrow instead of aborting the reveal
    pub escrow_fallback: bool,
    /// squarings timed when calibrating the time-lock rate
    pub calibration_squarings: u64,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            bit_length: DEFAULT_BIT_LENGTH,
            starting_bankroll: 1000,
            minimum_bet: 10,
            session_secret: String::new(),
            timelock_delay_secs: 30,
            peer_timeout_ms: 30_000,
            escrow_fallback: true,
            calibration_squarings: 100_000,
        }
    }
}

impl GameConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bit_length < MIN_BIT_LENGTH {
            return Err(Error::Config(format!(
                "bit_length {} below minimum {}",
                self.bit_length, MIN_BIT_LENGTH
            )));
        }
        if self.session_secret.is_empty() {
            return Err(Error::Config("session_secret must be set".into()));
        }
        if self.minimum_bet == 0 || self.minimum_bet > self.starting_bankroll {
            return Err(Error::Config(format!(
                "minimum_bet {} must be between 1 and the starting bankroll {}",
                self.minimum_bet, self.starting_bankroll
            )));
        }
        if self.peer_timeout_ms == 0 {
            return Err(Error::Config("peer_timeout_ms must be positive".into()));
        }
        if self.calibration_squarings == 0 {
            return Err(Error::Config("calibration_squarings must be positive".into()));
        }
        Ok(())
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn timelock_delay(&self) -> Duration {
        Duration::from_secs(self.timelock_delay_secs)
    }
}
