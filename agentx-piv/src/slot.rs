use crate::error::PivError;

/// Slot used when none is configured or an empty id is requested.
pub const DEFAULT_SLOT: &str = "9a";

/// A PIV key slot: the two-hex-digit id clients send, the key reference used
/// in GENERAL AUTHENTICATE, and the data object holding its certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    id: &'static str,
    key: u8,
    object: u32,
}

const fn slot(id: &'static str, key: u8, object: u32) -> Slot {
    Slot { id, key, object }
}

static SLOT_TABLE: [Slot; 24] = [
    slot("9a", 0x9a, 0x5f_c105),
    slot("9c", 0x9c, 0x5f_c10a),
    slot("9e", 0x9e, 0x5f_c101),
    slot("9d", 0x9d, 0x5f_c10b),
    slot("82", 0x82, 0x5f_c10d),
    slot("83", 0x83, 0x5f_c10e),
    slot("84", 0x84, 0x5f_c10f),
    slot("85", 0x85, 0x5f_c110),
    slot("86", 0x86, 0x5f_c111),
    slot("87", 0x87, 0x5f_c112),
    slot("88", 0x88, 0x5f_c113),
    slot("89", 0x89, 0x5f_c114),
    slot("8a", 0x8a, 0x5f_c115),
    slot("8b", 0x8b, 0x5f_c116),
    slot("8c", 0x8c, 0x5f_c117),
    slot("8d", 0x8d, 0x5f_c118),
    slot("8e", 0x8e, 0x5f_c119),
    slot("8f", 0x8f, 0x5f_c11a),
    slot("90", 0x90, 0x5f_c11b),
    slot("91", 0x91, 0x5f_c11c),
    slot("92", 0x92, 0x5f_c11d),
    slot("93", 0x93, 0x5f_c11e),
    slot("94", 0x94, 0x5f_c11f),
    slot("95", 0x95, 0x5f_c120),
];

impl Slot {
    pub fn lookup(id: &str) -> Result<Slot, PivError> {
        SLOT_TABLE
            .iter()
            .find(|s| s.id == id)
            .copied()
            .ok_or_else(|| PivError::UnknownSlot(id.to_string()))
    }

    pub fn default_slot() -> Slot {
        SLOT_TABLE[0]
    }

    pub fn all() -> &'static [Slot] {
        &SLOT_TABLE
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn object(&self) -> u32 {
        self.object
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id)
    }
}
