//! Node identity: addressing mode and the CAN identifier self-enumeration
//! record.

pub mod enumeration;

pub use enumeration::Enumeration;

/// The node's addressing mode.
///
/// `Unaddressed` corresponds to SLiM operation (node number zero),
/// `Addressed` to FLiM operation with a negotiated node number, and
/// `Transitioning` to the 30-second negotiation window between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Unaddressed,
    Transitioning,
    Addressed,
}

impl Mode {
    /// Returns true if the node holds (or is defending) a node number.
    pub fn is_addressed(&self) -> bool {
        matches!(self, Mode::Addressed)
    }
}
