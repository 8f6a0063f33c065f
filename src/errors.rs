use std::io;
use std::os::raw::c_int;
use std::result;

use errno::{errno, Errno};

/// Log an unrecoverable allocator failure and abort.
///
/// Callers of the allocation paths cannot recover from a broken or drained
/// pool, so invariant violations and growth failures on the hot path
/// terminate the process with a diagnostic instead of surfacing an error.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        error!($($arg)*);
        ::std::process::abort()
    }};
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("OS error, {0}")]
    Os(Errno),
    #[error("IO error, {0}")]
    Io(#[from] io::Error),
    #[error("{0} is not set")]
    Env(&'static str),
}

impl Error {
    /// Capture the calling thread's errno.
    pub fn os_error() -> Error {
        Error::Os(errno())
    }
}

pub type Result<T> = result::Result<T, Error>;

pub trait AsResult {
    type Result;

    fn as_result(self) -> Result<Self::Result>;
}

impl AsResult for c_int {
    type Result = ();

    /// Interpret a C-style return code: zero is success, any other value is
    /// the error number.
    fn as_result(self) -> Result<Self::Result> {
        if self == 0 {
            Ok(())
        } else {
            Err(Error::Os(Errno(self)))
        }
    }
}
