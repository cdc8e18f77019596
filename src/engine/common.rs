// src/engine/common.rs
//
// Common utilities shared across engine modules.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::LeanImageError;

type CommonResult<T> = std::result::Result<T, LeanImageError>;

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run a codec call, turning a panic inside it into `InternalPanic`.
///
/// Codec crates (and the C libraries under them) occasionally panic on hostile
/// input. A panic must fail the one file, not the batch.
pub fn run_with_panic_policy<T, F>(label: &'static str, f: F) -> CommonResult<T>
where
    F: FnOnce() -> CommonResult<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(stage = label, %message, "codec panicked");
            Err(LeanImageError::internal_panic(format!(
                "{label}: {message}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_passes_through() {
        let value = run_with_panic_policy("test", || Ok(7)).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_error_passes_through() {
        let err = run_with_panic_policy::<(), _>("test", || {
            Err(LeanImageError::decode_failed("nope"))
        })
        .unwrap_err();
        assert!(matches!(err, LeanImageError::DecodeFailed { .. }));
    }

    #[test]
    fn test_panic_becomes_internal_error() {
        let err = run_with_panic_policy::<(), _>("encode:test", || panic!("boom")).unwrap_err();
        match err {
            LeanImageError::InternalPanic { message } => {
                assert!(message.contains("encode:test"));
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
