use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lowest number a guess or target may take
pub const GUESS_MIN: u32 = 1;
/// Highest number a guess or target may take
pub const GUESS_MAX: u32 = 1000;
/// Width of the closed target range
pub const RANGE_SIZE: u32 = GUESS_MAX - GUESS_MIN + 1;

/// Winner share of a multi-player pot, in basis points
pub const WINNER_SHARE_BPS: u128 = 9_000;
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Longest round the admin may configure (one year)
pub const MAX_ROUND_DURATION: u64 = 365 * 24 * 60 * 60;

pub fn in_range(number: u32) -> bool {
    (GUESS_MIN..=GUESS_MAX).contains(&number)
}

/// 20-byte account identity (owner, players, winners)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; 20]);

impl Address {
    pub const ZERO: Address = Address([0u8; 20]);

    /// Address with every byte set to `byte`; handy for fixtures and demos
    pub fn repeat_byte(byte: u8) -> Self {
        Address([byte; 20])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|e| format!("Invalid address hex: {}", e))?;
        let array: [u8; 20] = bytes
            .try_into()
            .map_err(|_| "Address must be 20 bytes".to_string())?;
        Ok(Address(array))
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

/// Raw 256-bit randomness word, big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RandomSeed(pub [u8; 32]);

impl RandomSeed {
    /// Remainder of the full 256-bit value modulo `modulus`
    pub fn reduce(&self, modulus: u32) -> u32 {
        let modulus = u64::from(modulus);
        let rem = self
            .0
            .iter()
            .fold(0u64, |acc, byte| (acc * 256 + u64::from(*byte)) % modulus);
        rem as u32
    }
}

impl From<u64> for RandomSeed {
    fn from(value: u64) -> Self {
        Self::from(u128::from(value))
    }
}

impl From<u128> for RandomSeed {
    fn from(value: u128) -> Self {
        let mut bytes = [0u8; 32];
        bytes[16..].copy_from_slice(&value.to_be_bytes());
        RandomSeed(bytes)
    }
}

impl fmt::Display for RandomSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for RandomSeed {
    type Err = String;

    /// Accepts either a decimal integer (up to u128) or a 0x-prefixed 32-byte hex word
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(stripped) = s.strip_prefix("0x") {
            let bytes = hex::decode(stripped).map_err(|e| format!("Invalid seed hex: {}", e))?;
            let array: [u8; 32] = bytes
                .try_into()
                .map_err(|_| "Seed must be 32 bytes".to_string())?;
            return Ok(RandomSeed(array));
        }
        s.parse::<u128>()
            .map(RandomSeed::from)
            .map_err(|e| format!("Invalid seed: {}", e))
    }
}

impl TryFrom<String> for RandomSeed {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RandomSeed> for String {
    fn from(seed: RandomSeed) -> Self {
        seed.to_string()
    }
}

/// Where the round pointer sits in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Idle,
    AwaitingRandomness,
    Active,
    Closed,
    Settled,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundPhase::Idle => write!(f, "idle"),
            RoundPhase::AwaitingRandomness => write!(f, "awaiting_randomness"),
            RoundPhase::Active => write!(f, "active"),
            RoundPhase::Closed => write!(f, "closed"),
            RoundPhase::Settled => write!(f, "settled"),
        }
    }
}

/// One play cycle: its target, timing, pot and terminal result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub id: u64,
    pub start_time: u64,
    pub end_time: u64,
    pub active: bool,
    pub settled: bool,
    pub target: u32,
    pub pot: u128,
    pub guesses_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<Address>,
    /// Hex-encoded commitment of the randomness request (zeroes for manual rounds)
    pub rng_commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    pub manual: bool,
    /// Remainder withheld from the pot at settlement
    pub operator_cut: u128,
}

impl Round {
    /// Still taking entries at `now`
    pub fn is_open_at(&self, now: u64) -> bool {
        self.active && !self.settled && now < self.end_time
    }

    pub fn has_ended_at(&self, now: u64) -> bool {
        now >= self.end_time
    }

    /// Lifecycle phase with the lazy time-based close applied
    pub fn phase_at(&self, now: u64) -> RoundPhase {
        if self.settled {
            RoundPhase::Settled
        } else if self.is_open_at(now) {
            RoundPhase::Active
        } else {
            RoundPhase::Closed
        }
    }

    /// Copy of the round as a reader at `now` should see it
    pub fn effective_at(&self, now: u64) -> Round {
        Round {
            active: self.is_open_at(now),
            ..self.clone()
        }
    }

    pub fn seconds_remaining(&self, now: u64) -> u64 {
        if self.is_open_at(now) {
            self.end_time - now
        } else {
            0
        }
    }
}

/// A single paid entry; immutable once recorded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guess {
    pub player: Address,
    pub number: u32,
    pub timestamp: u64,
    pub stake: u128,
}

impl Guess {
    pub fn delta(&self, target: u32) -> u32 {
        self.number.abs_diff(target)
    }
}

/// History entry appended once per settled round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinnerRecord {
    pub round_id: u64,
    /// `None` when the round closed without entries
    pub winner: Option<Address>,
    pub target: u32,
    pub prize: u128,
    pub refund_only: bool,
}
