//! Unix signal name resolution.

/// Portable POSIX signal set.
const SIGNALS: &[(&str, i32)] = &[
    ("HUP", 1),
    ("INT", 2),
    ("QUIT", 3),
    ("ILL", 4),
    ("TRAP", 5),
    ("ABRT", 6),
    ("BUS", 7),
    ("FPE", 8),
    ("KILL", 9),
    ("USR1", 10),
    ("SEGV", 11),
    ("USR2", 12),
    ("PIPE", 13),
    ("ALRM", 14),
    ("TERM", 15),
    ("CHLD", 17),
    ("CONT", 18),
    ("STOP", 19),
    ("TSTP", 20),
];

/// Resolve a signal name to its number.
///
/// Accepts both `SIGTERM` and `TERM` spellings, case-insensitive.
pub fn signal_number(name: &str) -> Option<i32> {
    let upper = name.trim().to_uppercase();
    let short = upper.strip_prefix("SIG").unwrap_or(&upper);
    SIGNALS
        .iter()
        .find(|(n, _)| *n == short)
        .map(|(_, num)| *num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_and_without_prefix() {
        assert_eq!(signal_number("SIGTERM"), Some(15));
        assert_eq!(signal_number("TERM"), Some(15));
        assert_eq!(signal_number("sigint"), Some(2));
    }

    #[test]
    fn test_unknown() {
        assert_eq!(signal_number("SIGBOGUS"), None);
    }
}
