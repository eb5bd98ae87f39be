//! Permission assignment for materialized artifacts.
//!
//! POSIX systems get literal mode bits. Other systems only expose a coarse
//! readable/writable/executable flag model, so the requested capability set
//! is reduced to the flags the platform can toggle.
//!
//! The filesystem capability is probed once per process and every
//! [`PermissionSetter`] dispatches on the stored result.

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::artifact::TempArtifact;
use crate::error::LoaderError;

bitflags! {
    /// Owner/group/other read, write and execute capabilities.
    ///
    /// Bit values match POSIX mode bits so the set can be applied directly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PermissionSet: u32 {
        /// Owner may read.
        const OWNER_READ = 0o400;
        /// Owner may write.
        const OWNER_WRITE = 0o200;
        /// Owner may execute.
        const OWNER_EXECUTE = 0o100;
        /// Group may read.
        const GROUP_READ = 0o040;
        /// Group may write.
        const GROUP_WRITE = 0o020;
        /// Group may execute.
        const GROUP_EXECUTE = 0o010;
        /// Others may read.
        const OTHERS_READ = 0o004;
        /// Others may write.
        const OTHERS_WRITE = 0o002;
        /// Others may execute.
        const OTHERS_EXECUTE = 0o001;

        /// Everyone may read.
        const READ = Self::OWNER_READ.bits() | Self::GROUP_READ.bits() | Self::OTHERS_READ.bits();
        /// Everyone may write.
        const WRITE = Self::OWNER_WRITE.bits() | Self::GROUP_WRITE.bits() | Self::OTHERS_WRITE.bits();
        /// Everyone may execute.
        const EXECUTE = Self::OWNER_EXECUTE.bits() | Self::GROUP_EXECUTE.bits() | Self::OTHERS_EXECUTE.bits();
    }
}

impl PermissionSet {
    /// Default for extracted libraries: everyone may read, write and execute.
    ///
    /// The artifact is ephemeral, single-use and not a secret.
    pub const LOADABLE: Self = Self::all();

    /// Returns the POSIX mode bits.
    pub fn mode(self) -> u32 {
        self.bits()
    }

    /// Builds a set from POSIX mode bits (`0o000..=0o777`).
    pub fn from_mode(mode: u32) -> Result<Self, LoaderError> {
        Self::from_bits(mode).ok_or_else(|| {
            LoaderError::Configuration(format!("permission mode {mode:o} is out of range"))
        })
    }

    /// Parses an octal mode string such as `"755"` or `"0o644"`.
    pub fn parse_octal(value: &str) -> Result<Self, LoaderError> {
        let digits = value.trim().trim_start_matches("0o");
        let mode = u32::from_str_radix(digits, 8).map_err(|e| {
            LoaderError::Configuration(format!("invalid octal permission mode {value:?}: {e}"))
        })?;
        Self::from_mode(mode)
    }

    /// Returns true if any class may read.
    pub fn wants_read(self) -> bool {
        self.intersects(Self::READ)
    }

    /// Returns true if any class may write.
    pub fn wants_write(self) -> bool {
        self.intersects(Self::WRITE)
    }

    /// Returns true if any class may execute.
    pub fn wants_execute(self) -> bool {
        self.intersects(Self::EXECUTE)
    }
}

impl Default for PermissionSet {
    fn default() -> Self {
        Self::LOADABLE
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03o}", self.bits())
    }
}

/// Permission model offered by the host filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsCapability {
    /// Fine-grained mode bits, and open files may be unlinked.
    Posix,
    /// Coarse flags only, and open files cannot be removed.
    NonPosix,
}

impl FsCapability {
    /// Returns the capability of the host, probing it on first use.
    ///
    /// The probe decides by target family, not by inspecting a mounted
    /// filesystem: unix hosts report [`FsCapability::Posix`], every other
    /// host reports [`FsCapability::NonPosix`]. A FAT or SMB mount on a unix
    /// host is still reported as POSIX.
    pub fn detect() -> Self {
        static PROBED: OnceLock<FsCapability> = OnceLock::new();
        *PROBED.get_or_init(|| {
            let capability = probe();
            debug!(?capability, "Probed filesystem capability");
            capability
        })
    }

    /// Returns true for POSIX-capable filesystems.
    pub fn is_posix(self) -> bool {
        self == FsCapability::Posix
    }
}

#[cfg(unix)]
fn probe() -> FsCapability {
    FsCapability::Posix
}

#[cfg(not(unix))]
fn probe() -> FsCapability {
    FsCapability::NonPosix
}

/// How a requested set is reduced on non-POSIX filesystems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NonPosixPolicy {
    /// Apply only the most significant requested flag class (read, then
    /// write, then execute).
    #[default]
    FirstMatch,
    /// Apply every requested flag class.
    AllRequested,
}

impl FromStr for NonPosixPolicy {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-match" => Ok(NonPosixPolicy::FirstMatch),
            "all-requested" => Ok(NonPosixPolicy::AllRequested),
            other => Err(LoaderError::Configuration(format!(
                "unknown non-posix policy {other:?} (expected first-match or all-requested)"
            ))),
        }
    }
}

/// The coarse permission switches of a non-POSIX filesystem.
pub trait FlagToggles: Send + Sync {
    /// Makes the file readable.
    fn set_readable(&self, path: &Path) -> io::Result<()>;

    /// Makes the file writable.
    fn set_writable(&self, path: &Path) -> io::Result<()>;

    /// Makes the file executable.
    fn set_executable(&self, path: &Path) -> io::Result<()>;
}

/// Flag toggles backed by the host filesystem API.
///
/// Each toggle affects the owner only, mirroring what a flag-only platform
/// can express.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeToggles;

#[cfg(unix)]
fn add_mode_bits(path: &Path, bits: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | bits);
    fs::set_permissions(path, perms)
}

impl FlagToggles for NativeToggles {
    #[cfg(unix)]
    fn set_readable(&self, path: &Path) -> io::Result<()> {
        add_mode_bits(path, 0o400)
    }

    #[cfg(not(unix))]
    fn set_readable(&self, path: &Path) -> io::Result<()> {
        // Files are always readable by their owner here.
        fs::metadata(path).map(|_| ())
    }

    #[cfg(unix)]
    fn set_writable(&self, path: &Path) -> io::Result<()> {
        add_mode_bits(path, 0o200)
    }

    #[cfg(not(unix))]
    fn set_writable(&self, path: &Path) -> io::Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(false);
        fs::set_permissions(path, perms)
    }

    #[cfg(unix)]
    fn set_executable(&self, path: &Path) -> io::Result<()> {
        add_mode_bits(path, 0o100)
    }

    #[cfg(not(unix))]
    fn set_executable(&self, path: &Path) -> io::Result<()> {
        // Executability follows the file extension; nothing to toggle.
        fs::metadata(path).map(|_| ())
    }
}

/// Makes materialized artifacts loadable.
#[derive(Clone)]
pub struct PermissionSetter {
    capability: FsCapability,
    policy: NonPosixPolicy,
    toggles: Arc<dyn FlagToggles>,
}

impl PermissionSetter {
    /// Creates a setter for an explicit filesystem capability.
    pub fn new(capability: FsCapability) -> Self {
        Self {
            capability,
            policy: NonPosixPolicy::default(),
            toggles: Arc::new(NativeToggles),
        }
    }

    /// Creates a setter for the probed host capability.
    pub fn detect() -> Self {
        Self::new(FsCapability::detect())
    }

    /// Sets the non-POSIX reduction policy.
    pub fn with_policy(mut self, policy: NonPosixPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the flag toggles used on non-POSIX filesystems.
    pub fn with_toggles(mut self, toggles: Arc<dyn FlagToggles>) -> Self {
        self.toggles = toggles;
        self
    }

    /// Capability this setter dispatches on.
    pub fn capability(&self) -> FsCapability {
        self.capability
    }

    /// Applies `requested` (or [`PermissionSet::LOADABLE`]) to the artifact.
    ///
    /// # Errors
    ///
    /// Returns [`LoaderError::PermissionDenied`] if the OS refuses the change.
    pub fn apply(
        &self,
        artifact: &mut TempArtifact,
        requested: Option<PermissionSet>,
    ) -> Result<PermissionSet, LoaderError> {
        let set = requested.unwrap_or_default();

        match self.capability {
            FsCapability::Posix => apply_mode(&artifact.path, set)?,
            FsCapability::NonPosix => self.apply_flags(&artifact.path, set)?,
        }

        debug!(
            path = %artifact.path.display(),
            mode = %set,
            capability = ?self.capability,
            "Permissions applied"
        );

        artifact.permissions = Some(set);
        Ok(set)
    }

    fn apply_flags(&self, path: &Path, set: PermissionSet) -> Result<(), LoaderError> {
        let denied = |source| LoaderError::PermissionDenied {
            path: path.to_path_buf(),
            source,
        };

        match self.policy {
            NonPosixPolicy::FirstMatch => {
                if set.wants_read() {
                    self.toggles.set_readable(path).map_err(denied)
                } else if set.wants_write() {
                    self.toggles.set_writable(path).map_err(denied)
                } else {
                    self.toggles.set_executable(path).map_err(denied)
                }
            },
            NonPosixPolicy::AllRequested => {
                if set.wants_read() {
                    self.toggles.set_readable(path).map_err(denied)?;
                }
                if set.wants_write() {
                    self.toggles.set_writable(path).map_err(denied)?;
                }
                if set.wants_execute() {
                    self.toggles.set_executable(path).map_err(denied)?;
                }
                Ok(())
            },
        }
    }
}

impl fmt::Debug for PermissionSetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionSetter")
            .field("capability", &self.capability)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn apply_mode(path: &Path, set: PermissionSet) -> Result<(), LoaderError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(set.mode())).map_err(|source| {
        LoaderError::PermissionDenied {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn apply_mode(path: &Path, _set: PermissionSet) -> Result<(), LoaderError> {
    Err(LoaderError::PermissionDenied {
        path: path.to_path_buf(),
        source: io::Error::new(
            io::ErrorKind::Unsupported,
            "POSIX mode bits are not available on this platform",
        ),
    })
}
