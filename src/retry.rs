//! Retry wrapper for transport operations that may report would-block.

use std::io;
use std::thread;
use std::time::Duration;

/// Pause between attempts of a would-block operation.
pub const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Whether an I/O error only means "not ready yet".
///
/// A read timeout on a blocking socket surfaces as `WouldBlock` on unix and
/// `TimedOut` on Windows; both are retried.
pub fn is_would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Call `op` until it returns something other than a would-block error.
pub fn block_call<T, F>(mut op: F) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    loop {
        match op() {
            Err(ref e) if is_would_block(e) => thread::sleep(RETRY_DELAY),
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retries_until_ready() {
        let mut attempts = 0;
        let value = block_call(|| {
            attempts += 1;
            if attempts < 3 {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "not yet"))
            } else {
                Ok(42)
            }
        })
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_other_errors_are_returned() {
        let mut attempts = 0;
        let err = block_call::<(), _>(|| {
            attempts += 1;
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "gone"))
        })
        .unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(attempts, 1);
    }
}
