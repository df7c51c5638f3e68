// The two structured error taxonomies that cross a module boundary
// DOS file-I/O errors surfaced to the guest via AX/CF, and
// host-side load failures surfaced to the session orchestrator.

use thiserror::Error;

use crate::fat12::FatError;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DosError {
    #[error("file not found")]
    FileNotFound,
    #[error("path not found")]
    PathNotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("insufficient memory")]
    InsufficientMemory,
    #[error("no more files")]
    NoMoreFiles,
}

impl DosError {
    /// The value the guest sees in AX when CF is set on return.
    pub fn code(self) -> u16 {
        match self {
            DosError::FileNotFound => 0x02,
            DosError::PathNotFound => 0x03,
            DosError::AccessDenied => 0x05,
            DosError::InvalidHandle => 0x06,
            DosError::InsufficientMemory => 0x08,
            DosError::NoMoreFiles => 0x12,
        }
    }
}

impl From<FatError> for DosError {
    fn from(e: FatError) -> Self {
        match e {
            FatError::DiskFull | FatError::DirectoryFull => DosError::InsufficientMemory,
            FatError::AlreadyExists => DosError::AccessDenied,
            FatError::NotFound => DosError::FileNotFound,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("image is empty")]
    EmptyImage,
    #[error("MZ header is truncated")]
    TruncatedHeader,
    #[error("relocation table entry points outside the image")]
    BadRelocation,
}
