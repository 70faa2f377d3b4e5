//! Error types
//!
//! One uniform status taxonomy shared by every component. Blocking calls
//! report `Timeout` as a normal outcome; nothing in this crate escalates an
//! error into an abort.

/// OSAL error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OsError {
    /// Unspecified failure, including task-level calls made from ISR context
    Error = 1,
    /// Required pointer argument was null
    NullPointer,
    /// Argument out of contract (zero period, non-power-of-two alignment, ...)
    InvalidParam,
    /// Control-block or heap allocation failed
    NoMemory,
    /// Blocking operation's deadline elapsed
    Timeout,
    /// Resource already held / operation cannot proceed immediately
    Busy,
    /// Queue has no free slot
    Full,
    /// Queue has no item
    Empty,
    /// Component already initialized
    AlreadyInit,
    /// Component not yet initialized
    NotInit,
}

/// Result type alias for OSAL operations
pub type OsResult<T> = Result<T, OsError>;
