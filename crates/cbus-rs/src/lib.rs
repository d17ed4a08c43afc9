#![cfg_attr(not(feature = "std"), no_std)]

// 'alloc' is used for dynamic allocation (e.g., queue and context buffers)
extern crate alloc;

// --- Foundation Modules ---
pub mod types;
pub mod hal;

// --- Data Link Layer ---
pub mod frame;

// --- Protocol State ---
pub mod identity;
pub mod longmsg;

// --- Node Abstraction ---
pub mod node;

// --- Top-level Exports ---
pub use types::CanId;
pub use hal::{CanTransport, CbusError, EventStore};
pub use frame::{CanFrame, FrameQueue};
pub use identity::{Enumeration, Mode};
pub use longmsg::{
    LongMessage, LongMessageConfig, LongMessageEx, LongMessageProtocol, LongMessageStatus,
};
pub use node::{CbusNode, EventHandler, ModuleName, NodeConfig, Parameters};
