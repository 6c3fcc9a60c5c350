use core::fmt;

/// Errors returned by the mesh stack.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A parameter passed to a public entry point was rejected synchronously.
    ///
    /// This indicates a programmer error in the caller (invalid address kind,
    /// out-of-range TTL, nonsensical length). It never propagates past the
    /// entry point that detected it.
    InvalidParam,

    /// A PDU specified an invalid length value or was too short.
    InvalidLength,

    /// The referenced bearer interface does not exist.
    InvalidInterface,

    /// The operation conflicts with the current configuration state.
    InvalidConfig,

    /// An interface with the same identifier is already registered.
    Duplicate,

    /// A fixed-size table or queue has no free slot left.
    Exhausted,

    /// No buffer could be allocated from the PDU arena.
    OutOfMemory,

    /// No key material is stored for the requested NetKey index.
    KeyNotFound,

    /// The 24-bit sequence number space is used up for the current IV index.
    SeqExhausted,

    /// A crypto request or transmission is already in flight.
    Busy,

    /// Unexpectedly reached EOF while reading or writing data.
    ///
    /// This is returned when trying to fit too much data into a fixed-size
    /// buffer, and also when reaching EOF prematurely while reading data from
    /// a buffer.
    Eof,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidParam => "invalid parameter",
            Error::InvalidLength => "invalid length value specified",
            Error::InvalidInterface => "no such bearer interface",
            Error::InvalidConfig => "operation invalid in current configuration",
            Error::Duplicate => "interface already registered",
            Error::Exhausted => "table or queue full",
            Error::OutOfMemory => "PDU arena exhausted",
            Error::KeyNotFound => "no key material for NetKey index",
            Error::SeqExhausted => "sequence number space exhausted",
            Error::Busy => "operation already in progress",
            Error::Eof => "end of buffer",
        })
    }
}
