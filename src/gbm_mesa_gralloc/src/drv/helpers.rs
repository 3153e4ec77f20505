// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! helpers: Generic layout calculation and capability table management shared by backends.

use crate::checked_arithmetic;
use crate::drv::formats::DrmFormat;
use crate::drv::formats::PlanarLayout;
use crate::drv::BoMetadata;
use crate::drv::BoUseFlags;
use crate::drv::Combination;
use crate::drv::Driver;
use crate::drv::FormatMetadata;
use crate::drv::LINEAR_METADATA;
use crate::gralloc_utils::*;

// HAL_PIXEL_FORMAT_YV12 wants 16 byte aligned chroma rows.
const YV12_CHROMA_ALIGN: u32 = 16;

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
pub fn align_u32(value: u32, align: u32) -> GrallocResult<u32> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    let bumped = checked_arithmetic!(value + mask)?;
    Ok(bumped & !mask)
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
pub fn align_u64(value: u64, align: u64) -> GrallocResult<u64> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    let bumped = checked_arithmetic!(value + mask)?;
    Ok(bumped & !mask)
}

fn plane_stride(
    layout: &PlanarLayout,
    format: DrmFormat,
    stride: u32,
    plane: usize,
) -> GrallocResult<u32> {
    if plane == 0 {
        return Ok(stride);
    }

    let bytes_per_pixel = layout.bytes_per_pixel[plane];
    let scaled = checked_arithmetic!(stride * bytes_per_pixel)?;
    let divisor = layout.bytes_per_pixel[0] * layout.horizontal_subsampling[plane];
    let plane_stride = scaled.div_ceil(divisor);

    if format == DrmFormat::YVU420_ANDROID {
        align_u32(plane_stride, YV12_CHROMA_ALIGN)
    } else {
        Ok(plane_stride)
    }
}

/// Bytes needed for one row of plane 0 of `format` at `width` pixels.
pub fn stride_from_width(format: DrmFormat, width: u32) -> GrallocResult<u32> {
    let layout = format.planar_layout()?;
    let bytes_per_pixel = layout.bytes_per_pixel[0];
    checked_arithmetic!(width * bytes_per_pixel)
}

/// Fills the plane strides, sizes and offsets of `meta` for a linear buffer whose first plane
/// has `stride` bytes per row and `aligned_height` rows.  Chroma planes are derived through the
/// format's subsampling.
pub fn drv_bo_from_format(
    meta: &mut BoMetadata,
    stride: u32,
    aligned_height: u32,
    format: DrmFormat,
) -> GrallocResult<()> {
    let layout = format.planar_layout()?;
    let mut offset: u64 = 0;

    for plane in 0..layout.num_planes {
        let plane_stride = plane_stride(&layout, format, stride, plane)?;
        let rows = aligned_height.div_ceil(layout.vertical_subsampling[plane]) as u64;
        let row_bytes = plane_stride as u64;
        let plane_size = checked_arithmetic!(row_bytes * rows)?;

        meta.strides[plane] = plane_stride;
        meta.sizes[plane] = plane_size;
        meta.offsets[plane] = offset.try_into()?;
        offset = checked_arithmetic!(offset + plane_size)?;
    }

    for plane in layout.num_planes..DRV_MAX_PLANES {
        meta.strides[plane] = 0;
        meta.sizes[plane] = 0;
        meta.offsets[plane] = 0;
    }

    meta.num_planes = layout.num_planes;
    meta.total_size = offset;
    Ok(())
}

impl Driver {
    pub fn add_combination(
        &mut self,
        format: DrmFormat,
        metadata: &FormatMetadata,
        use_flags: BoUseFlags,
    ) {
        self.combos.push(Combination {
            format,
            metadata: *metadata,
            use_flags,
        });
    }

    pub fn add_combinations(
        &mut self,
        formats: &[DrmFormat],
        metadata: &FormatMetadata,
        use_flags: BoUseFlags,
    ) {
        for format in formats {
            self.add_combination(*format, metadata, use_flags);
        }
    }

    /// Adds `use_flags` to every combination of `format` registered with the same modifier.
    pub fn modify_combination(
        &mut self,
        format: DrmFormat,
        metadata: &FormatMetadata,
        use_flags: BoUseFlags,
    ) {
        for combo in self
            .combos
            .iter_mut()
            .filter(|c| c.format == format && c.metadata.modifier == metadata.modifier)
        {
            combo.use_flags |= use_flags;
        }
    }

    /// Every supported display controller can scan out and use as a cursor linear XRGB8888 and
    /// ARGB8888 buffers.
    pub fn modify_linear_combinations(&mut self) -> GrallocResult<()> {
        let flags = BoUseFlags::CURSOR | BoUseFlags::SCANOUT;
        self.modify_combination(DrmFormat::XRGB8888, &LINEAR_METADATA, flags);
        self.modify_combination(DrmFormat::ARGB8888, &LINEAR_METADATA, flags);
        Ok(())
    }

    pub fn combinations(&self) -> &[Combination] {
        &self.combos
    }

    /// Returns the highest priority combination of `format` that covers all of `use_flags`.
    pub fn get_combination(
        &self,
        format: DrmFormat,
        use_flags: BoUseFlags,
    ) -> Option<&Combination> {
        self.combos
            .iter()
            .filter(|c| c.format == format && c.use_flags.contains(use_flags))
            .max_by_key(|c| c.metadata.priority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(stride: u32, height: u32, format: DrmFormat) -> BoMetadata {
        let mut meta = BoMetadata::default();
        drv_bo_from_format(&mut meta, stride, height, format).unwrap();
        meta
    }

    #[test]
    fn packed_formats() {
        let r8 = layout(10, 10, DrmFormat::R8);
        assert_eq!(r8.num_planes, 1);
        assert_eq!(r8.strides, [10, 0, 0, 0]);
        assert_eq!(r8.offsets, [0, 0, 0, 0]);
        assert_eq!(r8.total_size, 100);

        let stride = stride_from_width(DrmFormat::XRGB8888, 10).unwrap();
        assert_eq!(stride, 40);
        let xr24 = layout(stride, 10, DrmFormat::XRGB8888);
        assert_eq!(xr24.strides[0], 40);
        assert_eq!(xr24.total_size, 400);
    }

    #[test]
    fn planar_formats() {
        let nv12 = layout(10, 10, DrmFormat::NV12);
        assert_eq!(nv12.num_planes, 2);
        assert_eq!(nv12.strides, [10, 10, 0, 0]);
        assert_eq!(nv12.offsets, [0, 100, 0, 0]);
        assert_eq!(nv12.sizes[..2], [100, 50]);
        assert_eq!(nv12.total_size, 150);

        let yv12 = layout(10, 10, DrmFormat::YVU420);
        assert_eq!(yv12.strides, [10, 5, 5, 0]);
        assert_eq!(yv12.offsets, [0, 100, 125, 0]);
        assert_eq!(yv12.total_size, 150);

        // Odd heights round the chroma rows up.
        let nv12 = layout(10, 5, DrmFormat::NV12);
        assert_eq!(nv12.sizes[..2], [50, 30]);
    }

    #[test]
    fn android_yv12_chroma_alignment() {
        let yv12 = layout(64, 4, DrmFormat::YVU420_ANDROID);
        assert_eq!(yv12.strides[..3], [64, 32, 32]);

        let yv12 = layout(40, 4, DrmFormat::YVU420_ANDROID);
        assert_eq!(yv12.strides[..3], [40, 32, 32]);
        assert_eq!(yv12.total_size, 40 * 4 + 32 * 2 * 2);
    }

    #[test]
    fn unknown_format_has_no_layout() {
        let mut meta = BoMetadata::default();
        assert!(drv_bo_from_format(&mut meta, 16, 16, DrmFormat(0)).is_err());
        assert!(stride_from_width(DrmFormat::FLEX_YCBCR_420_888, 16).is_err());
    }

    #[test]
    fn alignment() {
        assert_eq!(align_u32(100, 32).unwrap(), 128);
        assert_eq!(align_u32(128, 32).unwrap(), 128);
        assert_eq!(align_u64(300, 4096).unwrap(), 4096);
        assert_eq!(align_u64(0, 4096).unwrap(), 0);
        assert!(matches!(
            align_u32(u32::MAX - 3, 32),
            Err(GrallocError::CheckedArithmetic { .. })
        ));
        assert!(matches!(
            align_u64(u64::MAX, 4096),
            Err(GrallocError::CheckedArithmetic { .. })
        ));
    }

    #[test]
    fn overflow_is_reported() {
        assert!(matches!(
            stride_from_width(DrmFormat::ABGR16161616F, u32::MAX),
            Err(GrallocError::CheckedArithmetic { .. })
        ));
    }
}
