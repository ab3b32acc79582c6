//! Typed command codes.

use std::fmt;

use super::constants::{CMD_AUTH, CMD_FILESYSTEM, CMD_FLASH, CMD_TEST};

/// Region an upload targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    /// Application firmware.
    Flash,
    /// Filesystem image.
    Filesystem,
}

impl UpdateKind {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            CMD_FLASH => Some(Self::Flash),
            CMD_FILESYSTEM => Some(Self::Filesystem),
            _ => None,
        }
    }

    pub fn code(self) -> u64 {
        match self {
            Self::Flash => CMD_FLASH,
            Self::Filesystem => CMD_FILESYSTEM,
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateKind::Flash => write!(f, "FLASH"),
            UpdateKind::Filesystem => write!(f, "FS"),
        }
    }
}

/// Command sent in answer to an `AUTH` challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCommand {
    /// Authenticate and continue with the upload.
    Auth,
    /// Authenticate only.
    Test,
}

impl AuthCommand {
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            CMD_AUTH => Some(Self::Auth),
            CMD_TEST => Some(Self::Test),
            _ => None,
        }
    }

    pub fn code(self) -> u64 {
        match self {
            Self::Auth => CMD_AUTH,
            Self::Test => CMD_TEST,
        }
    }
}
