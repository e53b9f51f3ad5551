use thiserror::Error;

/// Result type local to offheap-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid allocation size: {0} bytes")]
    InvalidSize(usize),

    #[error("out of off-heap memory: requested {requested} bytes, budget {budget}, used {used}")]
    OutOfMemory {
        requested: usize,
        budget: usize,
        used: usize,
    },

    /// The reservoir cannot grant another region without evicting first.
    #[error("reservoir exhausted")]
    ReservoirExhausted,

    #[error("double free of address {addr:#x}")]
    DoubleFree { addr: usize },

    #[error("address {addr:#x} does not belong to this allocator")]
    InvalidAddress { addr: usize },

    #[error("access to a released chunk")]
    Released,

    #[error("access out of bounds: offset {offset} + len {len} > size {size}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("backing file error: {0}")]
    Backing(String),

    #[error("checksum mismatch reloading {0}")]
    ChecksumMismatch(String),

    #[error(transparent)]
    Platform(#[from] offheap_core::Error),
}
