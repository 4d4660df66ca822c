/// Signal-name resolution for the `signal()` call.
///
/// Accepts both the canonical form ("SIGKILL") and the short form ("KILL").
pub fn signal_name_to_num(name: &str) -> Option<i32> {
    let short = name.strip_prefix("SIG").unwrap_or(name);
    let num = match short {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "TRAP" => 5,
        "ABRT" => 6,
        "BUS" => 7,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        "STKFLT" => 16,
        "CHLD" => 17,
        "CONT" => 18,
        "STOP" => 19,
        "TSTP" => 20,
        "TTIN" => 21,
        "TTOU" => 22,
        "URG" => 23,
        "XCPU" => 24,
        "XFSZ" => 25,
        "VTALRM" => 26,
        "PROF" => 27,
        "WINCH" => 28,
        "IO" | "POLL" => 29,
        "PWR" => 30,
        "SYS" => 31,
        _ => return None,
    };
    Some(num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names_resolve_with_and_without_prefix() {
        assert_eq!(signal_name_to_num("SIGKILL"), Some(9));
        assert_eq!(signal_name_to_num("KILL"), Some(9));
        assert_eq!(signal_name_to_num("SIGUSR1"), Some(10));
        assert_eq!(signal_name_to_num("TERM"), Some(15));
        assert_eq!(signal_name_to_num("SIGWHAT"), None);
    }
}
