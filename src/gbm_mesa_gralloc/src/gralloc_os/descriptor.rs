// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fs::File;
use std::io::Seek;
use std::io::SeekFrom;
use std::mem::ManuallyDrop;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::FromRawFd;
use std::os::unix::fs::MetadataExt;

use crate::gralloc_utils::GrallocResult;

// Views a borrowed descriptor as a `File` without taking ownership of it.
fn borrowed_file(fd: BorrowedFd<'_>) -> ManuallyDrop<File> {
    // Safe because the descriptor is valid for the lifetime of `fd` and ManuallyDrop keeps the
    // File from closing it.
    ManuallyDrop::new(unsafe { File::from_raw_fd(fd.as_raw_fd()) })
}

/// Returns the size in bytes of the memory behind `fd`, found by seeking to its end.  The file
/// offset is reset to the start afterwards.
pub fn descriptor_size(fd: BorrowedFd<'_>) -> GrallocResult<u64> {
    let mut file = borrowed_file(fd);
    let size = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(0))?;
    Ok(size)
}

/// Returns the inode number of the file behind `fd`.  Duplicates of one descriptor share it.
pub fn descriptor_inode(fd: BorrowedFd<'_>) -> GrallocResult<u64> {
    let file = borrowed_file(fd);
    Ok(file.metadata()?.ino())
}
