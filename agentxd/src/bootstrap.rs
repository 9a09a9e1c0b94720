/// Process-level hardening applied before any key material is handled.
///
/// Best-effort: failures are logged and the daemon continues.
///
/// On Linux this sets `PR_SET_DUMPABLE 0`, which disables core dumps and
/// blocks `/proc/<pid>/mem` reads by other non-root processes, so private
/// keys added to the agent never end up on disk after a crash.
#[cfg(target_os = "linux")]
pub fn secure_bootstrap() {
    // SAFETY: prctl with PR_SET_DUMPABLE only takes plain integer arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::debug!("PR_SET_DUMPABLE=0: core dumps disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}

/// No-op where `prctl` is unavailable.
#[cfg(not(target_os = "linux"))]
pub fn secure_bootstrap() {}
