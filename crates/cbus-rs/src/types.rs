use core::convert::TryFrom;
use core::fmt;

// --- Protocol Constants ---

/// Default CBUS message priority. 1011 = major 2 (normal), minor 3 (low).
pub const DEFAULT_PRIORITY: u8 = 0x0B;

/// Duration of the CAN identifier self-enumeration observation window, in milliseconds.
pub const ENUMERATION_WINDOW_MS: u64 = 100;

/// Timeout for the node-number negotiation (Transitioning mode), in milliseconds.
pub const TRANSITION_TIMEOUT_MS: u64 = 30_000;

/// Default delay between successive long message fragments, in milliseconds.
pub const LONG_MESSAGE_DEFAULT_DELAY_MS: u64 = 20;

/// Default timeout waiting for the next long message fragment, in milliseconds.
pub const LONG_MESSAGE_RECEIVE_TIMEOUT_MS: u64 = 5_000;

/// Default number of queued frames drained per `process` call.
pub const DEFAULT_FRAMES_PER_PROCESS: u8 = 3;

/// Inter-frame gap applied to paced reply bursts (stored-event enumeration), in milliseconds.
pub const REPLY_GAP_MS: u64 = 10;

/// Number of possible CAN identifiers tracked during self-enumeration (7-bit space).
pub const CAN_ID_SPACE: usize = 128;

/// Highest CAN identifier a node may self-assign or be assigned.
pub const MAX_CAN_ID: u8 = 99;

/// Represents a CBUS CAN identifier, wrapping a `u8` to ensure type safety.
///
/// Valid identifiers are in the range 1-99; zero is reserved and never
/// assigned to a node. Uniqueness on the bus is maintained by the
/// self-enumeration cycle, not by construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CanId(pub u8);

/// Error type for invalid CAN identifier creation.
#[derive(Debug, PartialEq, Eq)]
pub enum CanIdError {
    /// Identifier is outside the valid range (1-99).
    InvalidRange(u8),
}

impl fmt::Display for CanIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanIdError::InvalidRange(value) => {
                write!(f, "Invalid CanId value: {}. Valid range is 1-99.", value)
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CanIdError {}

impl TryFrom<u8> for CanId {
    type Error = CanIdError;

    /// Creates a `CanId` from a `u8`, returning an error if the value is not
    /// a valid CBUS node identifier (1-99).
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1..=MAX_CAN_ID => Ok(CanId(value)),
            _ => Err(CanIdError::InvalidRange(value)),
        }
    }
}

impl From<CanId> for u8 {
    /// Converts a `CanId` back into its underlying `u8` representation.
    fn from(id: CanId) -> Self {
        id.0
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_id_range() {
        assert_eq!(CanId::try_from(1), Ok(CanId(1)));
        assert_eq!(CanId::try_from(99), Ok(CanId(99)));
        assert_eq!(CanId::try_from(0), Err(CanIdError::InvalidRange(0)));
        assert_eq!(CanId::try_from(100), Err(CanIdError::InvalidRange(100)));
    }
}
