//! Process resource limits that bound outbound connection counts.

/// Static ceiling used when the file-descriptor limit cannot be read or is
/// unbounded.
pub const FALLBACK_MAX_CONNECTIONS: usize = 800;

/// Default process-wide cap on in-use outbound connections: 80% of the
/// file-descriptor soft limit, leaving headroom for listeners, files, and
/// inbound traffic.
pub fn default_max_connections() -> usize {
    match rlimit_nofile() {
        Some(soft) => (((soft as f64) * 0.8) as usize).max(1),
        None => FALLBACK_MAX_CONNECTIONS,
    }
}

#[cfg(unix)]
fn rlimit_nofile() -> Option<u64> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) };
    if rc != 0 || lim.rlim_cur == libc::RLIM_INFINITY || lim.rlim_cur == 0 {
        return None;
    }
    Some(lim.rlim_cur as u64)
}

#[cfg(not(unix))]
fn rlimit_nofile() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_is_positive() {
        assert!(default_max_connections() >= 1);
    }

    #[cfg(unix)]
    #[test]
    fn ceiling_stays_below_fd_limit() {
        if let Some(soft) = rlimit_nofile() {
            assert!(default_max_connections() as u64 <= soft);
        }
    }
}
