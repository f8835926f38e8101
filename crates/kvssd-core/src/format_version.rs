//! Record format versions for persisted simulator state.
//!
//! Every persisted record starts with a magic number and a format version so
//! a reader can reject files written by an incompatible build.

/// Physical block record format version
pub const BLOCK_FORMAT_VERSION: u16 = 1;

/// SSTable record format version
pub const TABLE_FORMAT_VERSION: u16 = 1;

/// Level index format version
pub const LEVELS_FORMAT_VERSION: u16 = 1;

/// Memtable snapshot format version
pub const MEMTABLE_FORMAT_VERSION: u16 = 1;

/// Magic numbers for record validation
pub mod magic {
    /// Block record magic: "KSBK"
    pub const BLOCK: u32 = 0x4B53424B;

    /// SSTable record magic: "KSST"
    pub const TABLE: u32 = 0x4B535354;

    /// Level index magic: "KSLV"
    pub const LEVELS: u32 = 0x4B534C56;

    /// Memtable snapshot magic: "KSMT"
    pub const MEMTABLE: u32 = 0x4B534D54;
}

/// Version compatibility information
#[derive(Debug, Clone, Copy)]
pub struct FormatVersion {
    /// Current version of this format
    pub current: u16,
    /// Minimum supported version for reading
    pub min_read: u16,
}

impl FormatVersion {
    /// Check if a version can be read
    pub fn can_read(&self, version: u16) -> bool {
        version >= self.min_read && version <= self.current
    }
}

/// Block record version info
pub fn block_version() -> FormatVersion {
    FormatVersion {
        current: BLOCK_FORMAT_VERSION,
        min_read: 1,
    }
}

/// SSTable record version info
pub fn table_version() -> FormatVersion {
    FormatVersion {
        current: TABLE_FORMAT_VERSION,
        min_read: 1,
    }
}

/// Level index version info
pub fn levels_version() -> FormatVersion {
    FormatVersion {
        current: LEVELS_FORMAT_VERSION,
        min_read: 1,
    }
}

/// Memtable snapshot version info
pub fn memtable_version() -> FormatVersion {
    FormatVersion {
        current: MEMTABLE_FORMAT_VERSION,
        min_read: 1,
    }
}
