use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnvFlags: u32 {
        const FIXEDMAP = 0x01;
        const NOSUBDIR = 0x4000;
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
        const NOMETASYNC = 0x40000;
        const WRITEMAP = 0x80000;
        const MAPASYNC = 0x100000;
        const NOTLS = 0x200000;
        const NOLOCK = 0x400000;
        const NORDAHEAD = 0x800000;
        const NOMEMINIT = 0x1000000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = 0x02;
        const DUPSORT = 0x04;
        const INTEGERKEY = 0x08;
        const DUPFIXED = 0x10;
        const INTEGERDUP = 0x20;
        const REVERSEDUP = 0x40;
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
        const CURRENT = 0x40;
        const APPEND = 0x20000;
        const APPENDDUP = 0x40000;
    }
}

// Copy operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CopyFlags: u32 {
        const COMPACT = 0x01;
    }
}

/// Growth factors are configured in megabytes
pub const SPACE_MULTIPLIER: usize = 1024 * 1024;
/// Default map growth per expansion, in megabytes
pub const DEFAULT_GROWTH_FACTOR_MB: usize = 8;
/// Default maximum number of named databases
pub const DEFAULT_MAX_DBS: u32 = 8;
/// Default permission bits of created environment files
pub const DEFAULT_MODE: u32 = 0o600;
/// Default number of expand-and-retry rounds for one-shot operations
pub const DEFAULT_MAX_GROWTH_RETRIES: usize = 8;
/// Attempts at beginning a transaction when the map was resized underneath us
pub const TXN_BEGIN_ATTEMPTS: usize = 3;
/// zstd level used for compressed databases
pub const COMPRESSION_LEVEL: i32 = 3;
