// Layer 1: Standard library imports
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// Layer 2: Third-party crate imports
// (none)

// Layer 3: Internal module imports
// (none)

/// Process-wide counter for supervisor ids.
static SUPERVISOR_SEQ: AtomicU64 = AtomicU64::new(0);

/// Process-wide counter for dynamically generated child ids.
static CHILD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a new supervisor id.
///
/// Format: `dsup_<monotonic>_<base36 timestamp>`. The monotonic counter is
/// process-wide, the timestamp is unix milliseconds encoded in base36, so
/// ids stay unique within a process and sort roughly by creation time
/// across processes.
///
/// # Example
/// ```rust
/// let id = dsup::util::supervisor_id();
/// assert!(id.starts_with("dsup_"));
/// ```
pub fn supervisor_id() -> String {
    let seq = SUPERVISOR_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("dsup_{}_{}", seq, base36(unix_millis()))
}

/// Generate a child id for a dynamically spawned template worker.
///
/// Format: `<prefix>_<monotonic>_<base36 timestamp>`. Used by the
/// `simple_one_for_one` strategy, where workers share one template and no
/// declared id.
pub fn dynamic_child_id(prefix: &str) -> String {
    let seq = CHILD_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}_{}", prefix, seq, base36(unix_millis()))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Encode a number in lowercase base36.
fn base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let mut buf = [0u8; 13];
    let mut i = buf.len();
    while n > 0 {
        i -= 1;
        buf[i] = DIGITS[(n % 36) as usize];
        n /= 36;
    }
    String::from_utf8_lossy(&buf[i..]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36_zero() {
        assert_eq!(base36(0), "0");
    }

    #[test]
    fn test_base36_known_values() {
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(36 * 36 + 1), "101");
    }

    #[test]
    fn test_supervisor_id_format() {
        let id = supervisor_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "dsup");
        assert!(parts[1].parse::<u64>().is_ok());
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_supervisor_ids_unique() {
        let a = supervisor_id();
        let b = supervisor_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_dynamic_child_id_prefix() {
        let id = dynamic_child_id("worker");
        assert!(id.starts_with("worker_"));

        let next = dynamic_child_id("worker");
        assert_ne!(id, next);
    }
}
