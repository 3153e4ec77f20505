// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! formats: DRM fourcc handling and the planar properties of every format the driver deals with.

use std::fmt;

use crate::gralloc_utils::*;

/// A [fourcc](https://en.wikipedia.org/wiki/FourCC) format identifier.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct DrmFormat(pub u32);

/// Planar properties associated with each `DrmFormat`.  Copied from helpers.c in minigbm.
#[derive(Copy, Clone, Debug)]
pub struct PlanarLayout {
    pub num_planes: usize,
    pub horizontal_subsampling: [u32; 3],
    pub vertical_subsampling: [u32; 3],
    pub bytes_per_pixel: [u32; 3],
}

static PACKED_1BPP: PlanarLayout = PlanarLayout {
    num_planes: 1,
    horizontal_subsampling: [1, 0, 0],
    vertical_subsampling: [1, 0, 0],
    bytes_per_pixel: [1, 0, 0],
};

static PACKED_2BPP: PlanarLayout = PlanarLayout {
    num_planes: 1,
    horizontal_subsampling: [1, 0, 0],
    vertical_subsampling: [1, 0, 0],
    bytes_per_pixel: [2, 0, 0],
};

static PACKED_3BPP: PlanarLayout = PlanarLayout {
    num_planes: 1,
    horizontal_subsampling: [1, 0, 0],
    vertical_subsampling: [1, 0, 0],
    bytes_per_pixel: [3, 0, 0],
};

static PACKED_4BPP: PlanarLayout = PlanarLayout {
    num_planes: 1,
    horizontal_subsampling: [1, 0, 0],
    vertical_subsampling: [1, 0, 0],
    bytes_per_pixel: [4, 0, 0],
};

static PACKED_8BPP: PlanarLayout = PlanarLayout {
    num_planes: 1,
    horizontal_subsampling: [1, 0, 0],
    vertical_subsampling: [1, 0, 0],
    bytes_per_pixel: [8, 0, 0],
};

static BIPLANAR_YUV420: PlanarLayout = PlanarLayout {
    num_planes: 2,
    horizontal_subsampling: [1, 2, 0],
    vertical_subsampling: [1, 2, 0],
    bytes_per_pixel: [1, 2, 0],
};

static TRIPLANAR_YUV420: PlanarLayout = PlanarLayout {
    num_planes: 3,
    horizontal_subsampling: [1, 2, 2],
    vertical_subsampling: [1, 2, 2],
    bytes_per_pixel: [1, 1, 1],
};

impl DrmFormat {
    pub const R8: DrmFormat = DrmFormat::new(b'R', b'8', b' ', b' ');

    pub const RGB565: DrmFormat = DrmFormat::new(b'R', b'G', b'1', b'6');
    pub const BGR565: DrmFormat = DrmFormat::new(b'B', b'G', b'1', b'6');
    pub const BGR888: DrmFormat = DrmFormat::new(b'B', b'G', b'2', b'4');

    pub const XRGB8888: DrmFormat = DrmFormat::new(b'X', b'R', b'2', b'4');
    pub const XBGR8888: DrmFormat = DrmFormat::new(b'X', b'B', b'2', b'4');
    pub const ARGB8888: DrmFormat = DrmFormat::new(b'A', b'R', b'2', b'4');
    pub const ABGR8888: DrmFormat = DrmFormat::new(b'A', b'B', b'2', b'4');

    pub const ABGR16161616F: DrmFormat = DrmFormat::new(b'A', b'B', b'4', b'H');

    pub const NV12: DrmFormat = DrmFormat::new(b'N', b'V', b'1', b'2');
    pub const NV21: DrmFormat = DrmFormat::new(b'N', b'V', b'2', b'1');
    pub const YVU420: DrmFormat = DrmFormat::new(b'Y', b'V', b'1', b'2');

    /*
     * Android pseudo-formats.  They never reach a backend: the driver resolves them to a real
     * format first, except YVU420_ANDROID which is YV12 with stricter chroma stride alignment.
     */
    pub const YVU420_ANDROID: DrmFormat = DrmFormat::new(b'9', b'9', b'9', b'7');
    pub const FLEX_IMPLEMENTATION_DEFINED: DrmFormat = DrmFormat::new(b'9', b'9', b'9', b'8');
    pub const FLEX_YCBCR_420_888: DrmFormat = DrmFormat::new(b'9', b'9', b'9', b'9');

    /// Constructs a format identifer using a fourcc byte sequence.
    #[inline(always)]
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> DrmFormat {
        DrmFormat(a as u32 | (b as u32) << 8 | (c as u32) << 16 | (d as u32) << 24)
    }

    /// Returns the fourcc code as a sequence of bytes.
    #[inline(always)]
    pub fn to_bytes(&self) -> [u8; 4] {
        let f = self.0;
        [f as u8, (f >> 8) as u8, (f >> 16) as u8, (f >> 24) as u8]
    }

    /// Returns the planar layout of the format.
    pub fn planar_layout(&self) -> GrallocResult<PlanarLayout> {
        match *self {
            DrmFormat::R8 => Ok(PACKED_1BPP),
            DrmFormat::RGB565 | DrmFormat::BGR565 => Ok(PACKED_2BPP),
            DrmFormat::BGR888 => Ok(PACKED_3BPP),
            DrmFormat::ABGR8888
            | DrmFormat::XBGR8888
            | DrmFormat::ARGB8888
            | DrmFormat::XRGB8888 => Ok(PACKED_4BPP),
            DrmFormat::ABGR16161616F => Ok(PACKED_8BPP),
            DrmFormat::NV12 | DrmFormat::NV21 => Ok(BIPLANAR_YUV420),
            DrmFormat::YVU420 | DrmFormat::YVU420_ANDROID => Ok(TRIPLANAR_YUV420),
            _ => Err(GrallocError::InvalidDrmFormat),
        }
    }

    /// Number of planes of the format.
    pub fn num_planes(&self) -> GrallocResult<usize> {
        Ok(self.planar_layout()?.num_planes)
    }
}

impl From<u32> for DrmFormat {
    fn from(u: u32) -> DrmFormat {
        DrmFormat(u)
    }
}

impl From<DrmFormat> for u32 {
    fn from(f: DrmFormat) -> u32 {
        f.0
    }
}

impl fmt::Debug for DrmFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.to_bytes();
        if b.iter().all(u8::is_ascii_graphic) {
            write!(
                f,
                "fourcc({}{}{}{})",
                b[0] as char, b[1] as char, b[2] as char, b[3] as char
            )
        } else {
            write!(
                f,
                "fourcc(0x{:02x}{:02x}{:02x}{:02x})",
                b[0], b[1], b[2], b[3]
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use super::*;

    #[test]
    fn format_debug() {
        let f = DrmFormat::new(b'X', b'R', b'2', b'4');
        let mut buf = String::new();
        write!(&mut buf, "{:?}", f).unwrap();
        assert_eq!(buf, "fourcc(XR24)");

        let f = DrmFormat::new(0, 1, 2, 16);
        let mut buf = String::new();
        write!(&mut buf, "{:?}", f).unwrap();
        assert_eq!(buf, "fourcc(0x00010210)");

        // The padding spaces of R8 are not graphic characters.
        let mut buf = String::new();
        write!(&mut buf, "{:?}", DrmFormat::R8).unwrap();
        assert_eq!(buf, "fourcc(0x52382020)");
    }

    #[test]
    fn android_pseudo_formats() {
        assert_eq!(DrmFormat::FLEX_IMPLEMENTATION_DEFINED.to_bytes(), *b"9998");
        assert_eq!(DrmFormat::FLEX_YCBCR_420_888.to_bytes(), *b"9999");
        assert!(DrmFormat::FLEX_IMPLEMENTATION_DEFINED
            .planar_layout()
            .is_err());
        assert_eq!(DrmFormat::YVU420_ANDROID.num_planes().unwrap(), 3);
    }

    #[test]
    fn plane_counts() {
        assert_eq!(DrmFormat::R8.num_planes().unwrap(), 1);
        assert_eq!(DrmFormat::BGR888.num_planes().unwrap(), 1);
        assert_eq!(DrmFormat::NV21.num_planes().unwrap(), 2);
        assert_eq!(DrmFormat::YVU420.num_planes().unwrap(), 3);
        assert!(DrmFormat(0).num_planes().is_err());
    }
}
