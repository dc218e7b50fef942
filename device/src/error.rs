//! Error taxonomy and integer status codes.
//!
//! Operations report failures synchronously through [`Result`]. Code that has
//! to cross a plain-integer boundary uses [`Error::code`] together with the
//! [`NO_ERROR`] sentinel.

use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Status code reported for a successful operation.
pub const NO_ERROR: i32 = 0;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Caller misuse: bad index, missing input, unknown type code.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// Backend rejected the kernel source.
    #[snafu(display("compilation of kernel '{name}' failed:\n{log}"))]
    Compilation { name: String, log: String },

    /// Buffer bound to a kernel compiled in another context.
    #[snafu(display("context mismatch: kernel belongs to context {expected}, buffer to context {actual}"))]
    ContextMismatch { expected: u64, actual: u64 },

    /// Backend refused or failed a launch.
    #[snafu(display("kernel launch failed: {reason}"))]
    LaunchFailure { reason: String },

    #[snafu(display("size mismatch: expected {expected}, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    /// Invalid buffer view parameters.
    #[snafu(display("invalid view: offset {offset} + size {size} exceeds buffer size {buffer_size}"))]
    InvalidView { offset: usize, size: usize, buffer_size: usize },

    /// Buffer is not allocated.
    #[snafu(display("buffer not allocated"))]
    NotAllocated,

    /// Buffer memory lives in a place the requested access cannot reach.
    #[snafu(display("buffer is not host accessible"))]
    NotHostAccessible,

    /// Unparseable device string.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    /// No backend is registered for the device type.
    #[snafu(display("unsupported device: {device}"))]
    UnsupportedDevice { device: String },

    #[cfg(feature = "cuda")]
    /// CUDA driver errors.
    #[snafu(display("CUDA error: {source}"))]
    Cuda { source: cudarc::driver::DriverError },
}

impl Error {
    /// Integer status code for this error. Never equal to [`NO_ERROR`].
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgument { .. } => 1,
            Self::Compilation { .. } => 2,
            Self::ContextMismatch { .. } => 3,
            Self::LaunchFailure { .. } => 4,
            Self::SizeMismatch { .. } => 5,
            Self::InvalidView { .. } => 6,
            Self::NotAllocated => 7,
            Self::NotHostAccessible => 8,
            Self::InvalidDevice { .. } => 9,
            Self::UnsupportedDevice { .. } => 10,
            #[cfg(feature = "cuda")]
            Self::Cuda { .. } => 11,
        }
    }
}

/// Collapse a result into its status code.
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => NO_ERROR,
        Err(e) => e.code(),
    }
}

/// Static description of a status code.
pub fn describe(code: i32) -> &'static str {
    match code {
        NO_ERROR => "no error",
        1 => "invalid argument",
        2 => "kernel compilation failed",
        3 => "context mismatch",
        4 => "kernel launch failed",
        5 => "size mismatch",
        6 => "invalid buffer view",
        7 => "buffer not allocated",
        8 => "buffer not host accessible",
        9 => "invalid device",
        10 => "unsupported device",
        11 => "CUDA driver error",
        _ => "unknown error code",
    }
}
