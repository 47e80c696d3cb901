//! Build identity stamped in by `build.rs`.

pub const BUILD_SHA: &str = env!("INSTALL_SESSIOND_GIT_SHA");

/// Commit timestamp (Unix epoch seconds), `0` when built outside git.
pub const BUILD_TIMESTAMP: u64 = parse_timestamp(env!("INSTALL_SESSIOND_BUILD_TIMESTAMP"));

const fn parse_timestamp(raw: &str) -> u64 {
    let bytes = raw.as_bytes();
    let mut value: u64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if !b.is_ascii_digit() {
            return 0;
        }
        value = value * 10 + (b - b'0') as u64;
        i += 1;
    }
    value
}

/// Short form of the build SHA for display.
pub fn short_sha() -> &'static str {
    BUILD_SHA.get(..7).unwrap_or(BUILD_SHA)
}
