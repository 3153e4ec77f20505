// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! format_policy: Supported format/usage combinations and Android flexible format resolution.

use crate::drv::BoUseFlags;
use crate::drv::Driver;
use crate::drv::DrmFormat;
use crate::drv::LINEAR_METADATA;
use crate::gralloc_utils::GrallocResult;

const SCANOUT_RENDER_FORMATS: [DrmFormat; 5] = [
    DrmFormat::ARGB8888,
    DrmFormat::XRGB8888,
    DrmFormat::ABGR8888,
    DrmFormat::XBGR8888,
    DrmFormat::RGB565,
];

const TEXTURE_ONLY_FORMATS: [DrmFormat; 4] = [
    DrmFormat::NV12,
    DrmFormat::NV21,
    DrmFormat::YVU420,
    DrmFormat::YVU420_ANDROID,
];

/// Registers every combination the backend can allocate.  All of them are linear.
pub fn register_combinations(drv: &mut Driver) -> GrallocResult<()> {
    drv.add_combinations(
        &SCANOUT_RENDER_FORMATS,
        &LINEAR_METADATA,
        BoUseFlags::RENDER_MASK | BoUseFlags::SCANOUT,
    );

    drv.add_combinations(
        &TEXTURE_ONLY_FORMATS,
        &LINEAR_METADATA,
        BoUseFlags::TEXTURE_MASK | BoUseFlags::SCANOUT,
    );

    drv.add_combination(
        DrmFormat::R8,
        &LINEAR_METADATA,
        BoUseFlags::SW_MASK | BoUseFlags::LINEAR,
    );

    // Android CTS tests require this.
    drv.add_combination(DrmFormat::BGR888, &LINEAR_METADATA, BoUseFlags::SW_MASK);

    drv.modify_combination(
        DrmFormat::NV12,
        &LINEAR_METADATA,
        BoUseFlags::HW_VIDEO_ENCODER
            | BoUseFlags::HW_VIDEO_DECODER
            | BoUseFlags::CAMERA_READ
            | BoUseFlags::CAMERA_WRITE,
    );
    drv.modify_combination(
        DrmFormat::NV21,
        &LINEAR_METADATA,
        BoUseFlags::HW_VIDEO_ENCODER,
    );

    // R8 backs camera metadata and video codec bitstreams.
    drv.modify_combination(
        DrmFormat::R8,
        &LINEAR_METADATA,
        BoUseFlags::CAMERA_MASK | BoUseFlags::HW_VIDEO_DECODER | BoUseFlags::HW_VIDEO_ENCODER,
    );

    drv.modify_combination(
        DrmFormat::YVU420_ANDROID,
        &LINEAR_METADATA,
        BoUseFlags::CAMERA_MASK,
    );

    drv.modify_linear_combinations()
}

/// Maps Android flexible formats to concrete ones.  Usage flags pass through unchanged.
pub fn resolve_format_and_use_flags(
    format: DrmFormat,
    use_flags: BoUseFlags,
) -> (DrmFormat, BoUseFlags) {
    let resolved = match format {
        DrmFormat::FLEX_IMPLEMENTATION_DEFINED => {
            if use_flags.intersects(BoUseFlags::CAMERA_MASK) {
                DrmFormat::NV12
            } else {
                DrmFormat::XBGR8888
            }
        }
        DrmFormat::FLEX_YCBCR_420_888 => DrmFormat::NV12,
        DrmFormat::BGR565 => DrmFormat::RGB565,
        other => other,
    };

    (resolved, use_flags)
}
