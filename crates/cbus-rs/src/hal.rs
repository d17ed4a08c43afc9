use crate::frame::CanFrame;
use crate::longmsg::LongMessageError;
use crate::types::CanIdError;
use core::fmt;

/// Defines a portable, descriptive Error type for the CBUS stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbusError {
    /// An underlying I/O error occurred in the CAN controller driver.
    IoError,
    /// The transport rejected a frame (e.g., controller transmit buffers full).
    TransmitFailed,
    /// A value is not a valid CAN identifier.
    InvalidCanId(u8),
    /// A non-volatile storage index is out of range for the backend.
    IndexOutOfRange(u8),
    /// An error occurred in the storage backend.
    StorageError(&'static str),
    /// The requested operation needs a long message handler, but none is registered.
    NoLongMessageHandler,
    /// A long message could not be accepted for sending.
    LongMessage(LongMessageError),
}

impl fmt::Display for CbusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError => write!(f, "An underlying I/O error occurred"),
            Self::TransmitFailed => write!(f, "The transport could not send the frame"),
            Self::InvalidCanId(v) => write!(f, "Invalid CAN identifier value: {}", v),
            Self::IndexOutOfRange(v) => write!(f, "Storage index out of range: {}", v),
            Self::StorageError(s) => write!(f, "Storage error: {}", s),
            Self::NoLongMessageHandler => write!(f, "No long message handler registered"),
            Self::LongMessage(e) => write!(f, "Long message send rejected: {}", e),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CbusError {}

impl From<CanIdError> for CbusError {
    fn from(err: CanIdError) -> Self {
        match err {
            CanIdError::InvalidRange(val) => CbusError::InvalidCanId(val),
        }
    }
}

impl From<&'static str> for CbusError {
    fn from(s: &'static str) -> Self {
        CbusError::StorageError(s)
    }
}

impl From<LongMessageError> for CbusError {
    fn from(err: LongMessageError) -> Self {
        CbusError::LongMessage(err)
    }
}

/// Hardware Abstraction Layer (HAL) for the physical CAN transport.
///
/// This trait abstracts frame transmission and reception, enabling the core
/// CBUS protocol logic to remain platform-agnostic (no_std). The engine never
/// constructs transport-layer framing beyond populating the 11-bit identifier,
/// the RTR and extended-format flags, and the data bytes of a [`CanFrame`].
pub trait CanTransport {
    /// Returns true if at least one received frame is waiting in the controller.
    fn frame_available(&self) -> bool;

    /// Retrieves the next received frame, or `None` if nothing is pending.
    fn receive_next_frame(&mut self) -> Option<CanFrame>;

    /// Sends a single frame. The identifier, RTR and extended flags are
    /// already populated by the caller.
    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), CbusError>;

    /// Resets the underlying CAN controller.
    fn reset(&mut self);
}

/// A trait abstracting the node's persistent event and configuration storage.
///
/// The engine depends on the lookup/allocate/clear/hash-maintenance surface
/// but does not own the storage format. Event table entries are four bytes
/// (node number and event number, big-endian) plus a block of event
/// variables; entries are "valid" under the backend's own validity marker.
/// Short-form (local) events are stored with node number zero.
pub trait EventStore {
    // --- Node identity ---

    /// The node number, zero while unaddressed.
    fn node_number(&self) -> u16;
    fn set_node_number(&mut self, nn: u16) -> Result<(), CbusError>;

    /// The current CAN identifier, zero while unaddressed.
    fn can_id(&self) -> u8;
    fn set_can_id(&mut self, id: u8) -> Result<(), CbusError>;

    /// Whether the node holds an assigned node number (FLiM as opposed to SLiM).
    fn addressed(&self) -> bool;
    fn set_addressed(&mut self, addressed: bool) -> Result<(), CbusError>;

    // --- Node variables ---

    /// Number of node variables the module declares. NVs are indexed from 1.
    fn nv_count(&self) -> u8;
    fn read_nv(&self, index: u8) -> Result<u8, CbusError>;
    fn write_nv(&mut self, index: u8, value: u8) -> Result<(), CbusError>;

    // --- Event table ---

    /// Capacity of the event table.
    fn max_events(&self) -> u8;

    /// Number of event variables stored per event. EVs are indexed from 1.
    fn event_vars_per_event(&self) -> u8;

    /// Finds the table index of a stored (node number, event number) pair.
    fn find_existing_event(&self, nn: u16, en: u16) -> Option<u8>;

    /// Finds a free event table slot.
    fn find_free_event_slot(&self) -> Option<u8>;

    /// Reads the four identifying bytes (nn hi/lo, en hi/lo) of an entry.
    fn read_event(&self, index: u8) -> Result<[u8; 4], CbusError>;

    /// Writes the four identifying bytes of an entry.
    fn write_event(&mut self, index: u8, data: &[u8; 4]) -> Result<(), CbusError>;

    fn read_event_variable(&self, index: u8, var_index: u8) -> Result<u8, CbusError>;
    fn write_event_variable(&mut self, index: u8, var_index: u8, value: u8)
    -> Result<(), CbusError>;

    /// Clears one event table entry.
    fn clear_event(&mut self, index: u8) -> Result<(), CbusError>;

    /// Returns true if the slot at `index` holds a valid entry.
    fn event_table_entry_valid(&self, index: u8) -> bool;

    /// Number of valid entries in the event table.
    fn count_events(&self) -> u8;

    /// Rebuilds the backend's hash index entry for one table slot.
    fn rebuild_hash_index(&mut self, index: u8);

    /// Discards and rebuilds the backend's entire hash index.
    fn clear_hash_index(&mut self);
}
