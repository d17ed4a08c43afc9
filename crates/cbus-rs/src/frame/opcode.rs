//! Wire opcode values fixed by the bus specification, plus classification
//! helpers used by the dispatch engine.

// --- Accessory events, long form (explicit node number) ---
pub const ACON: u8 = 0x90;
pub const ACOF: u8 = 0x91;
pub const ACON1: u8 = 0xB0;
pub const ACOF1: u8 = 0xB1;
pub const ACON2: u8 = 0xD0;
pub const ACOF2: u8 = 0xD1;
pub const ACON3: u8 = 0xF0;
pub const ACOF3: u8 = 0xF1;

// --- Accessory events, short form (implicit node number zero) ---
pub const ASON: u8 = 0x98;
pub const ASOF: u8 = 0x99;
pub const ASON1: u8 = 0xB8;
pub const ASOF1: u8 = 0xB9;
pub const ASON2: u8 = 0xD8;
pub const ASOF2: u8 = 0xD9;
pub const ASON3: u8 = 0xF8;
pub const ASOF3: u8 = 0xF9;

// --- Identity and negotiation ---
pub const RQNP: u8 = 0x10;
pub const RQMN: u8 = 0x11;
pub const RQNN: u8 = 0x50;
pub const NNREL: u8 = 0x51;
pub const NNACK: u8 = 0x52;
pub const SNN: u8 = 0x42;
pub const QNN: u8 = 0x0D;
pub const PNN: u8 = 0xB6;
pub const PARAMS: u8 = 0xEF;
pub const RQNPN: u8 = 0x73;
pub const PARAN: u8 = 0x9B;
pub const NAME: u8 = 0xE2;
pub const CANID: u8 = 0x75;
pub const ENUM: u8 = 0x5D;

// --- Node variables ---
pub const NVRD: u8 = 0x71;
pub const NVANS: u8 = 0x97;
pub const NVSET: u8 = 0x96;

// --- Event table management and queries ---
pub const NNLRN: u8 = 0x53;
pub const NNULN: u8 = 0x54;
pub const NNCLR: u8 = 0x55;
pub const NNEVN: u8 = 0x56;
pub const NERD: u8 = 0x57;
pub const RQEVN: u8 = 0x58;
pub const EVNLF: u8 = 0x70;
pub const NUMEV: u8 = 0x74;
pub const ENRSP: u8 = 0xF2;
pub const EVULN: u8 = 0x95;
pub const EVLRN: u8 = 0xD2;
pub const REVAL: u8 = 0x9C;
pub const NEVAL: u8 = 0xB5;

// --- Acknowledgements ---
pub const WRACK: u8 = 0x59;
pub const CMDERR: u8 = 0x6F;

// --- Long messages (RFC 0005) ---
pub const DTXC: u8 = 0xE9;

// --- Recognised but not acted upon by accessory modules ---
pub const AREQ: u8 = 0x92;
pub const BOOT: u8 = 0x5C;
pub const RSTAT: u8 = 0x0C;

/// Command error codes returned in CMDERR replies.
pub mod cmderr {
    /// Invalid event-variable index.
    pub const INVALID_EVENT_VARIABLE_INDEX: u8 = 6;
    /// Invalid CAN identifier value.
    pub const INVALID_CAN_ID: u8 = 7;
    /// Invalid parameter index.
    pub const INVALID_PARAMETER_INDEX: u8 = 9;
    /// Invalid NV index or invalid event-table operation.
    pub const INVALID_EVENT_OPERATION: u8 = 10;
}

/// Returns true if the opcode is one of the sixteen accessory event opcodes.
pub fn is_accessory_event(opc: u8) -> bool {
    matches!(
        opc,
        ACON | ACOF
            | ACON1
            | ACOF1
            | ACON2
            | ACOF2
            | ACON3
            | ACOF3
            | ASON
            | ASOF
            | ASON1
            | ASOF1
            | ASON2
            | ASOF2
            | ASON3
            | ASOF3
    )
}

/// Returns true for the short-form accessory opcodes, which are keyed with
/// an implicit node number of zero.
pub fn is_short_accessory_event(opc: u8) -> bool {
    matches!(
        opc,
        ASON | ASOF | ASON1 | ASOF1 | ASON2 | ASOF2 | ASON3 | ASOF3
    )
}

/// Returns the on/off polarity of an accessory event opcode.
/// On variants have even opcode values, off variants odd ones.
pub fn is_on_event(opc: u8) -> bool {
    opc % 2 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessory_classification() {
        assert!(is_accessory_event(ACON));
        assert!(is_accessory_event(ASOF3));
        assert!(!is_accessory_event(SNN));
        assert!(is_short_accessory_event(ASON1));
        assert!(!is_short_accessory_event(ACON1));
    }

    #[test]
    fn test_polarity() {
        assert!(is_on_event(ACON));
        assert!(!is_on_event(ACOF));
        assert!(is_on_event(ASON2));
        assert!(!is_on_event(ASOF2));
    }
}
