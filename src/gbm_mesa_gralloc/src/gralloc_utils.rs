// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! gralloc_utils: Error type and shared constants needed by the rest of the crate.

use std::ffi::NulError;
use std::io::Error as IoError;
use std::num::TryFromIntError;
use std::str::Utf8Error;

use nix::Error as NixError;
use remain::sorted;
use thiserror::Error;

/// Maximum number of planes a buffer object may have.
pub const DRV_MAX_PLANES: usize = 4;

/// Linear (untiled, uncompressed) DRM format modifier.
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// An error generated while using this crate.
#[sorted]
#[derive(Error, Debug)]
pub enum GrallocError {
    /// The wrapper library returned an operation table with a missing entry.
    #[error("backend operation table is missing entry `{0}`")]
    BackendIncomplete(&'static str),
    /// The wrapper library could not be opened.
    #[error("unable to open backend library '{name}': {source}")]
    BackendLibrary {
        name: String,
        source: libloading::Error,
    },
    /// The operation-table entry point returned null.
    #[error("backend entry point returned no operation table")]
    BackendNoOps,
    /// The operation-table entry point symbol is absent.
    #[error("unable to find backend symbol '{name}': {source}")]
    BackendSymbol {
        name: String,
        source: libloading::Error,
    },
    /// Checked Arithmetic error
    #[error("arithmetic failed: {}({}) {op} {}({})", .field1.0, .field1.1, .field2.0, .field2.1)]
    CheckedArithmetic {
        field1: (&'static str, usize),
        field2: (&'static str, usize),
        op: &'static str,
    },
    /// The backend failed with its own (negative errno style) error code.
    #[error("backend component failed with error {0}")]
    ComponentError(i32),
    /// The backend could not create a device context for the selected node.
    #[error("backend could not create a device for the DRM node")]
    DeviceCreateFailed,
    /// The backend refused to import a buffer.
    #[error("backend failed to import buffer")]
    ImportFailed,
    /// The caller passed an argument the driver can not act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A buffer object lacks the backend handle an operation needs.
    #[error("buffer object has no backend handle")]
    InvalidBackendHandle,
    /// Invalid DRM format.
    #[error("invalid DRM format")]
    InvalidDrmFormat,
    /// A mapping record does not carry a backend mapping token.
    #[error("mapping record has no backend token")]
    InvalidMapping,
    /// An input/output error occured.
    #[error("an input/output error occur: {0}")]
    IoError(IoError),
    /// The backend mapping operation did not produce an address.
    #[error("backend failed to map buffer")]
    MappingFailed,
    /// Nix crate error.
    #[error("The errno is {0}")]
    NixError(NixError),
    /// A separate display controller is required but no KMS capable card node was found.
    #[error("unable to find a DRM card node with KMS capabilities")]
    NoKmsNode,
    /// No device path matched the requested node class.
    #[error("no DRM device node matches {0}")]
    NoMatchingNode(String),
    /// Neither a render node nor a card node could be selected for the backend.
    #[error("unable to find or open DRM node")]
    NoUsableNode,
    #[error("Nul Error occured {0}")]
    NulError(NulError),
    /// An attempted integer conversion failed.
    #[error("int conversion failed: {0}")]
    TryFromIntError(TryFromIntError),
    /// Utf8 error.
    #[error("an utf8 error occured: {0}")]
    Utf8Error(Utf8Error),
}

impl GrallocError {
    /// Returns the negative status code reported to the host allocation framework.
    pub fn status(&self) -> i32 {
        match self {
            GrallocError::ComponentError(code) => *code,
            GrallocError::IoError(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            GrallocError::NixError(e) => -(*e as i32),
            GrallocError::CheckedArithmetic { .. } | GrallocError::TryFromIntError(_) => {
                -libc::EOVERFLOW
            }
            GrallocError::MappingFailed => -libc::ENOMEM,
            _ => -libc::EINVAL,
        }
    }
}

impl From<NixError> for GrallocError {
    fn from(e: NixError) -> GrallocError {
        GrallocError::NixError(e)
    }
}

impl From<NulError> for GrallocError {
    fn from(e: NulError) -> GrallocError {
        GrallocError::NulError(e)
    }
}

impl From<IoError> for GrallocError {
    fn from(e: IoError) -> GrallocError {
        GrallocError::IoError(e)
    }
}

impl From<TryFromIntError> for GrallocError {
    fn from(e: TryFromIntError) -> GrallocError {
        GrallocError::TryFromIntError(e)
    }
}

impl From<Utf8Error> for GrallocError {
    fn from(e: Utf8Error) -> GrallocError {
        GrallocError::Utf8Error(e)
    }
}

/// The result of an operation in this crate.
pub type GrallocResult<T> = std::result::Result<T, GrallocError>;
