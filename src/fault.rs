//! Panic containment for calls into plugin-supplied code.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Extract a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}

/// Run `f`, turning a panic into `Err(message)`.
///
/// Host bookkeeping never holds a lock while calling this, so a panicking
/// plugin cannot poison shared state.
pub(crate) fn catch_fault<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_fault_passes_value_through() {
        assert_eq!(catch_fault(|| 7), Ok(7));
    }

    #[test]
    fn test_catch_fault_reports_message() {
        let result: Result<(), String> = catch_fault(|| panic!("boom {}", 42));
        assert_eq!(result, Err("boom 42".to_string()));

        let result: Result<(), String> = catch_fault(|| std::panic::panic_any(3_u8));
        assert_eq!(result, Err("non-string panic payload".to_string()));
    }
}
