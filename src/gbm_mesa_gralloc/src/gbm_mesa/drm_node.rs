// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! drm_node: Discovery of DRM render and card nodes.

use std::ffi::CString;
use std::fs::File;
use std::fs::OpenOptions;
use std::ops::ControlFlow;
use std::os::raw::c_char;
use std::os::raw::c_int;
use std::os::raw::c_uint;
#[cfg(target_pointer_width = "64")]
use std::os::raw::c_ulong;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::null_mut;

use log::debug;
use log::error;
use log::info;
use nix::ioctl_none;
use nix::ioctl_readwrite;
use zerocopy::FromBytes;

use crate::gralloc_utils::GrallocError;
use crate::gralloc_utils::GrallocResult;

// Consistent with __kernel_size_t in include/uapi/asm-generic/posix_types.h.
#[cfg(not(target_pointer_width = "64"))]
#[allow(non_camel_case_types)]
type __kernel_size_t = c_uint;
#[cfg(target_pointer_width = "64")]
#[allow(non_camel_case_types)]
type __kernel_size_t = c_ulong;

const DRM_IOCTL_BASE: c_uint = 0x64;
const DRM_IOCTL_VERSION: c_uint = 0x00;
const DRM_IOCTL_DROP_MASTER: c_uint = 0x1f;
const DRM_IOCTL_MODE_GETRESOURCES: c_uint = 0xa0;

#[repr(C)]
#[derive(Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct drm_version {
    version_major: c_int,
    version_minor: c_int,
    version_patchlevel: c_int,
    name_len: __kernel_size_t,
    name: *mut c_char,
    date_len: __kernel_size_t,
    date: *mut c_char,
    desc_len: __kernel_size_t,
    desc: *mut c_char,
}

#[repr(C)]
#[derive(Copy, Clone, FromBytes)]
#[allow(non_camel_case_types)]
pub struct drm_mode_card_res {
    fb_id_ptr: u64,
    crtc_id_ptr: u64,
    connector_id_ptr: u64,
    encoder_id_ptr: u64,
    count_fbs: u32,
    count_crtcs: u32,
    count_connectors: u32,
    count_encoders: u32,
    min_width: u32,
    max_width: u32,
    min_height: u32,
    max_height: u32,
}

ioctl_readwrite!(
    drm_get_version,
    DRM_IOCTL_BASE,
    DRM_IOCTL_VERSION,
    drm_version
);

ioctl_readwrite!(
    drm_mode_get_resources,
    DRM_IOCTL_BASE,
    DRM_IOCTL_MODE_GETRESOURCES,
    drm_mode_card_res
);

ioctl_none!(drm_drop_master, DRM_IOCTL_BASE, DRM_IOCTL_DROP_MASTER);

fn get_drm_device_name(fd: &File) -> GrallocResult<String> {
    let mut version = drm_version {
        version_major: 0,
        version_minor: 0,
        version_patchlevel: 0,
        name_len: 0,
        name: null_mut(),
        date_len: 0,
        date: null_mut(),
        desc_len: 0,
        desc: null_mut(),
    };

    // Get the length of the device name.
    unsafe {
        drm_get_version(fd.as_raw_fd(), &mut version)?;
    }

    // Enough bytes to hold the device name and terminating null character.
    let mut name_bytes: Vec<u8> = vec![0; (version.name_len + 1) as usize];
    let mut version = drm_version {
        version_major: 0,
        version_minor: 0,
        version_patchlevel: 0,
        name_len: name_bytes.len() as __kernel_size_t,
        name: name_bytes.as_mut_ptr() as *mut c_char,
        date_len: 0,
        date: null_mut(),
        desc_len: 0,
        desc: null_mut(),
    };

    // Safe as no more than name_len + 1 bytes will be written to name.
    unsafe {
        drm_get_version(fd.as_raw_fd(), &mut version)?;
    }

    Ok(CString::new(&name_bytes[..(version.name_len as usize)])?
        .to_str()?
        .to_owned())
}

/// Returns true if the device behind `fd` can drive a display, i.e. it exposes at least one
/// CRTC, connector and encoder.
pub fn is_kms_dev(fd: &File) -> bool {
    let mut res = drm_mode_card_res::new_zeroed();

    // Safe because all id array pointers are null with zero capacity, so the kernel only
    // writes the object counts into `res`.
    match unsafe { drm_mode_get_resources(fd.as_raw_fd(), &mut res) } {
        Ok(_) => res.count_crtcs > 0 && res.count_connectors > 0 && res.count_encoders > 0,
        Err(_) => false,
    }
}

/// Gives up DRM master on `fd` so a display manager can claim the card.
pub fn drop_master(fd: &File) -> GrallocResult<()> {
    // This is always safe to call with a valid fd.
    unsafe {
        drm_drop_master(fd.as_raw_fd())?;
    }
    Ok(())
}

/// Which kind of DRM node to enumerate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeClass {
    /// `renderD*` nodes: GPU access without mode setting.
    Render,
    /// `card*` nodes: full access including mode setting.
    Card,
}

impl NodeClass {
    fn prefix(self) -> &'static str {
        match self {
            NodeClass::Render => "renderD",
            NodeClass::Card => "card",
        }
    }
}

/// An opened DRM node handed to a `find_device` callback.
pub struct DrmCandidate {
    pub path: PathBuf,
    pub file: File,
    pub is_kms: bool,
    pub driver_name: String,
}

fn matching_paths(dri_dir: &Path, class: NodeClass) -> GrallocResult<Vec<PathBuf>> {
    let prefix = class.prefix();
    let no_match = || GrallocError::NoMatchingNode(format!("{}/{}*", dri_dir.display(), prefix));

    let entries = std::fs::read_dir(dri_dir).map_err(|_| no_match())?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(prefix))
        .map(|entry| entry.path())
        .collect();

    if paths.is_empty() {
        return Err(no_match());
    }

    paths.sort();
    Ok(paths)
}

/// Opens every node of `class` under `dri_dir` in path order and passes it to `found`.  The
/// callback owns the candidate: it keeps what it wants and whatever it drops is closed.
/// Enumeration ends early when the callback breaks.  Nodes that fail to open or answer the
/// version query are logged and skipped.
///
/// Fails only if no path matches `class`; finding no acceptable node is not an error here.
pub fn find_device<F>(dri_dir: &Path, class: NodeClass, mut found: F) -> GrallocResult<()>
where
    F: FnMut(DrmCandidate) -> ControlFlow<()>,
{
    for path in matching_paths(dri_dir, class)? {
        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                error!("Unable to open {} with error {}", path.display(), e);
                continue;
            }
        };

        let driver_name = match get_drm_device_name(&file) {
            Ok(name) => name,
            Err(e) => {
                error!("Unable to query DRM version of {}: {}", path.display(), e);
                continue;
            }
        };

        let is_kms = is_kms_dev(&file);
        debug!(
            "DRM node {}: driver {}, kms {}",
            path.display(),
            driver_name,
            is_kms
        );

        let candidate = DrmCandidate {
            path,
            file,
            is_kms,
            driver_name,
        };

        if found(candidate).is_break() {
            break;
        }
    }

    Ok(())
}

/// Opens the first render node and reports whether its driver is one of `separate_dc_gpus`,
/// GPUs that rely on a separate display controller driver and therefore need a KMS card node
/// for scanout buffers.  Only the first render node is looked at.
pub fn is_separate_dc_gpu(
    dri_dir: &Path,
    separate_dc_gpus: &[String],
) -> GrallocResult<(bool, Option<File>)> {
    let mut gpu: Option<DrmCandidate> = None;
    find_device(dri_dir, NodeClass::Render, |candidate| {
        gpu = Some(candidate);
        ControlFlow::Break(())
    })?;

    let gpu_name = gpu.as_ref().map_or("", |c| c.driver_name.as_str());
    info!("Found GPU {}", gpu_name);

    let separate_dc = is_separate_dc_driver(gpu_name, separate_dc_gpus);
    Ok((separate_dc, gpu.map(|c| c.file)))
}

/// Tells whether the kernel driver `driver_name` is listed in `separate_dc_gpus`.  Names are
/// compared exactly.
pub fn is_separate_dc_driver(driver_name: &str, separate_dc_gpus: &[String]) -> bool {
    separate_dc_gpus.iter().any(|name| name == driver_name)
}

/// Returns the first card node with mode setting capabilities, if any.
pub fn find_kms_node(dri_dir: &Path) -> GrallocResult<Option<DrmCandidate>> {
    let mut kms: Option<DrmCandidate> = None;
    find_device(dri_dir, NodeClass::Card, |candidate| {
        if !candidate.is_kms {
            return ControlFlow::Continue(());
        }

        info!("Found KMS dev {}", candidate.driver_name);
        kms = Some(candidate);
        ControlFlow::Break(())
    })?;

    Ok(kms)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn no_matching_node() {
        let dir = scratch_dir("gbm-mesa-empty-dri");
        fs::write(dir.join("card0"), b"").unwrap();

        let result = find_device(&dir, NodeClass::Render, |_| ControlFlow::Continue(()));
        assert!(matches!(result, Err(GrallocError::NoMatchingNode(_))));

        let missing = dir.join("missing");
        let result = find_device(&missing, NodeClass::Card, |_| ControlFlow::Continue(()));
        assert!(matches!(result, Err(GrallocError::NoMatchingNode(_))));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn non_drm_candidates_are_skipped() {
        let dir = scratch_dir("gbm-mesa-fake-dri");
        fs::write(dir.join("renderD128"), b"").unwrap();
        fs::write(dir.join("renderD129"), b"").unwrap();

        // Regular files answer the version ioctl with ENOTTY and never reach the callback.
        let mut seen = 0;
        find_device(&dir, NodeClass::Render, |_| {
            seen += 1;
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(seen, 0);

        let (separate_dc, gpu) = is_separate_dc_gpu(&dir, &["vc4".to_string()]).unwrap();
        assert!(!separate_dc);
        assert!(gpu.is_none());

        assert!(find_kms_node(&dir).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn separate_dc_driver_names() {
        let gpus: Vec<String> = ["v3d", "vc4", "panfrost"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(is_separate_dc_driver("vc4", &gpus));
        assert!(is_separate_dc_driver("panfrost", &gpus));
        assert!(!is_separate_dc_driver("amdgpu", &gpus));
        assert!(!is_separate_dc_driver("VC4", &gpus));
        assert!(!is_separate_dc_driver("vc", &gpus));
        assert!(!is_separate_dc_driver("", &gpus));
        assert!(!is_separate_dc_driver("vc4", &[]));
    }

    #[test]
    fn regular_file_is_not_kms() {
        let dir = scratch_dir("gbm-mesa-not-kms");
        let path = dir.join("card0");
        fs::write(&path, b"").unwrap();

        let file = File::open(&path).unwrap();
        assert!(!is_kms_dev(&file));
        assert!(drop_master(&file).is_err());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn node_class_prefixes() {
        assert_eq!(NodeClass::Render.prefix(), "renderD");
        assert_eq!(NodeClass::Card.prefix(), "card");
    }
}
