//! Runtime C library probe.

use crate::utils::cmd::ExternalCommand;
use tracing::warn;

/// Oldest glibc the parallel logical dumper runs on.
pub const MIN_PARALLEL_DUMPER_GLIBC: (u32, u32) = (2, 14);

/// Parse the version from the first line of `ldd --version`,
/// e.g. `ldd (GNU libc) 2.17` or `ldd (Ubuntu GLIBC 2.35-0ubuntu3) 2.35`.
pub fn parse_ldd_version(output: &str) -> Option<(u32, u32)> {
    let first = output.lines().next()?;
    let token = first.split_whitespace().last()?;
    let mut parts = token.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Probe glibc via `ldd --version`. `None` when the probe fails.
pub async fn glibc_version() -> Option<(u32, u32)> {
    match ExternalCommand::new("ldd", "ldd").arg("--version").output().await {
        Ok(out) => parse_ldd_version(&out),
        Err(e) => {
            warn!("glibc probe failed: {}", e);
            None
        }
    }
}

pub fn supports_parallel_dumper(version: Option<(u32, u32)>) -> bool {
    matches!(version, Some(v) if v >= MIN_PARALLEL_DUMPER_GLIBC)
}
