//! Platform detection and formatting.
//!
//! Identifies the OS/architecture pair an image is resolved for, in the
//! `os/arch[/variant]` form registries use for multi-arch index entries.

use crate::error::{Error, Result};

/// Target platform for an image pull.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    /// Operating system.
    pub os: Os,
    /// CPU architecture.
    pub arch: Arch,
    /// Architecture variant (e.g. `v8` for arm64), when declared.
    pub variant: Option<String>,
}

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    Darwin,
    Windows,
    Unknown,
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Arm,
    Unknown,
}

impl Platform {
    /// Detects the host platform.
    pub fn detect() -> Self {
        Self {
            os: Self::detect_os(),
            arch: Self::detect_arch(),
            variant: None,
        }
    }

    /// Detects the operating system.
    fn detect_os() -> Os {
        #[cfg(target_os = "linux")]
        return Os::Linux;

        #[cfg(target_os = "macos")]
        return Os::Darwin;

        #[cfg(target_os = "windows")]
        return Os::Windows;

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        return Os::Unknown;
    }

    /// Detects the CPU architecture.
    fn detect_arch() -> Arch {
        #[cfg(target_arch = "x86_64")]
        return Arch::Amd64;

        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(target_arch = "arm")]
        return Arch::Arm;

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "arm")))]
        return Arch::Unknown;
    }

    /// OS name as registries spell it.
    pub fn os_str(&self) -> &'static str {
        match self.os {
            Os::Linux => "linux",
            Os::Darwin => "darwin",
            Os::Windows => "windows",
            Os::Unknown => "unknown",
        }
    }

    /// Architecture name as registries spell it.
    pub fn arch_str(&self) -> &'static str {
        match self.arch {
            Arch::Amd64 => "amd64",
            Arch::Arm64 => "arm64",
            Arch::Arm => "arm",
            Arch::Unknown => "unknown",
        }
    }

    /// Formats as `os/arch` or `os/arch/variant`.
    pub fn oci_platform(&self) -> String {
        match &self.variant {
            Some(v) => format!("{}/{}/{}", self.os_str(), self.arch_str(), v),
            None => format!("{}/{}", self.os_str(), self.arch_str()),
        }
    }

    /// Parses an `os/arch[/variant]` string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let os = match parts.next() {
            Some("linux") => Os::Linux,
            Some("darwin") => Os::Darwin,
            Some("windows") => Os::Windows,
            _ => {
                return Err(Error::InvalidIdentifier(format!(
                    "unrecognized platform '{}'",
                    s
                )));
            }
        };
        let arch = match parts.next() {
            Some("amd64") => Arch::Amd64,
            Some("arm64") => Arch::Arm64,
            Some("arm") => Arch::Arm,
            _ => {
                return Err(Error::InvalidIdentifier(format!(
                    "unrecognized platform '{}'",
                    s
                )));
            }
        };
        let variant = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return Err(Error::InvalidIdentifier(format!(
                "unrecognized platform '{}'",
                s
            )));
        }
        Ok(Self { os, arch, variant })
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.oci_platform())
    }
}
