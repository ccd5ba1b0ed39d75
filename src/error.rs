use thiserror::Error;

/// Failure kinds surfaced by the public API.
///
/// Invalid configuration is rejected at the call site; mid-compress failures
/// abort the whole operation and the first non-OK chunk status is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// A parameter is out of its documented range (bpp outside [0, 64],
    /// zero dimensions, nonsensical chunk dimensions, ...).
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// The supplied buffer length disagrees with the given dimensions.
    #[error("buffer length disagrees with the volume dimensions")]
    WrongDims,

    /// `set_bpp` was called before the volume dimensions were known.
    #[error("set_bpp called before copy_data")]
    SetBppBeforeDims,

    /// A chunk produced zero encoded bytes.
    #[error("a chunk produced an empty bitstream")]
    EmptyStream,

    /// The bitstream ends before the content its header declares.
    #[error("bitstream is shorter than its header declares")]
    BitstreamTruncated,

    /// The bitstream is structurally damaged or not one of ours.
    #[error("bitstream is corrupt: {0}")]
    BitstreamCorrupt(&'static str),

    /// Catch-all for violated internal invariants.
    #[error("invariant violated: {0}")]
    Invariant(&'static str),
}

impl From<std::io::Error> for CodecError {
    // Short reads while parsing headers are the only io errors we can see:
    // every reader runs over an in-memory slice.
    fn from(_: std::io::Error) -> Self {
        CodecError::BitstreamTruncated
    }
}

/// Internal sentinel raised when the bit budget is reached mid-pass.
///
/// Not an error: the coder treats it as a clean halt and the surrounding
/// call still succeeds. It never crosses the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BudgetHit;
