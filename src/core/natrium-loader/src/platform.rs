//! Conventional bundled resource paths per platform.

use std::env::consts::{ARCH, OS};

use crate::error::LoaderError;

/// Bundled resource path of library `name` for the running platform.
///
/// `bundled_library_path("sodium")` is `linux64/libsodium.so` on x86-64 Linux
/// and `mac/aarch64/libsodium.dylib` on Apple silicon.
///
/// # Errors
///
/// Returns [`LoaderError::UnsupportedPlatform`] when no bundle layout exists
/// for this OS and architecture.
pub fn bundled_library_path(name: &str) -> Result<String, LoaderError> {
    bundled_path_for(OS, ARCH, name)
}

/// Bundled resource path of library `name` for an explicit OS/architecture
/// pair, using the values of [`std::env::consts`].
pub fn bundled_path_for(os: &str, arch: &str, name: &str) -> Result<String, LoaderError> {
    let dir = match (os, arch) {
        ("linux", "x86_64") => "linux64",
        ("linux", "x86") => "linux",
        ("linux", "arm") => "armv6",
        ("linux", "aarch64") => "linux-aarch64",
        ("macos", "x86_64") => "mac/intel",
        ("macos", "aarch64") => "mac/aarch64",
        ("windows", "x86_64") => "windows64",
        ("windows", "x86") => "windows",
        _ => return Err(LoaderError::UnsupportedPlatform(format!("{os}-{arch}"))),
    };

    let extension = match os {
        "macos" => "dylib",
        "windows" => "dll",
        _ => "so",
    };

    Ok(format!("{dir}/lib{name}.{extension}"))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_known_layouts() {
        let cases = [
            ("linux", "x86_64", "linux64/libsodium.so"),
            ("linux", "x86", "linux/libsodium.so"),
            ("linux", "arm", "armv6/libsodium.so"),
            ("linux", "aarch64", "linux-aarch64/libsodium.so"),
            ("macos", "x86_64", "mac/intel/libsodium.dylib"),
            ("macos", "aarch64", "mac/aarch64/libsodium.dylib"),
            ("windows", "x86_64", "windows64/libsodium.dll"),
            ("windows", "x86", "windows/libsodium.dll"),
        ];

        for (os, arch, expected) in cases {
            assert_eq!(bundled_path_for(os, arch, "sodium").unwrap(), expected);
        }
    }

    #[test]
    fn test_unsupported_platform() {
        let err = bundled_path_for("freebsd", "riscv64", "sodium").unwrap_err();
        assert!(matches!(err, LoaderError::UnsupportedPlatform(ref p) if p == "freebsd-riscv64"));
    }
}
