use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds on a monotonic clock (CLOCK_MONOTONIC). All supervisor
/// deadlines and watermarks are expressed on this time base, never on the
/// wall clock.
pub fn steady_time_ms() -> u64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => ts.tv_sec() as u64 * 1000 + ts.tv_nsec() as u64 / 1_000_000,
        Err(_) => {
            static FALLBACK_EPOCH: OnceLock<Instant> = OnceLock::new();
            FALLBACK_EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
        }
    }
}

/// Replaces non-printable bytes with spaces so hostile payloads are safe to
/// put into a log line.
pub fn printable(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| {
            if b.is_ascii_graphic() || *b == b' ' {
                *b as char
            } else {
                ' '
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_time_is_monotonic() {
        let a = steady_time_ms();
        let b = steady_time_ms();
        assert!(b >= a);
    }

    #[test]
    fn printable_replaces_control_bytes() {
        assert_eq!(printable(b"abc\x01\ndef\xff"), "abc  def ");
        assert_eq!(printable(b"plain text"), "plain text");
    }
}
