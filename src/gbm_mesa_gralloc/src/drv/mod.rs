// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! drv: The host allocation framework a gralloc backend plugs into.  This mirrors minigbm's
//! `struct driver` / `struct bo` / `struct backend` contract: the framework owns driver and
//! buffer object lifetimes and calls into a backend through a fixed operation table.

mod formats;
mod helpers;

use std::any::Any;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::os::raw::c_void;
use std::ptr::null_mut;
use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;
use log::info;

pub use formats::DrmFormat;
pub use formats::PlanarLayout;
pub use helpers::align_u32;
pub use helpers::align_u64;
pub use helpers::drv_bo_from_format;
pub use helpers::stride_from_width;

use crate::gralloc_os::descriptor_size;
use crate::gralloc_utils::*;

bitflags! {
    /// Usage flags for constructing a buffer object.  Values are minigbm's `BO_USE_*`.
    #[derive(Default)]
    pub struct BoUseFlags: u64 {
        const SCANOUT = 1 << 0;
        const CURSOR = 1 << 1;
        const RENDERING = 1 << 2;
        const LINEAR = 1 << 4;
        const TEXTURE = 1 << 5;
        const CAMERA_WRITE = 1 << 6;
        const CAMERA_READ = 1 << 7;
        const PROTECTED = 1 << 8;
        const SW_READ_OFTEN = 1 << 9;
        const SW_READ_RARELY = 1 << 10;
        const SW_WRITE_OFTEN = 1 << 11;
        const SW_WRITE_RARELY = 1 << 12;
        const HW_VIDEO_DECODER = 1 << 13;
        const HW_VIDEO_ENCODER = 1 << 14;
        const TEST_ALLOC = 1 << 15;
        const FRONT_RENDERING = 1 << 16;
        const RENDERSCRIPT = 1 << 17;
        const GPU_DATA_BUFFER = 1 << 18;
        const SENSOR_DIRECT_DATA = 1 << 19;

        const CAMERA_MASK = Self::CAMERA_READ.bits | Self::CAMERA_WRITE.bits;
        const SW_MASK = Self::SW_READ_OFTEN.bits
            | Self::SW_WRITE_OFTEN.bits
            | Self::SW_READ_RARELY.bits
            | Self::SW_WRITE_RARELY.bits
            | Self::FRONT_RENDERING.bits;
        const TEXTURE_MASK = Self::LINEAR.bits
            | Self::PROTECTED.bits
            | Self::RENDERSCRIPT.bits
            | Self::SW_MASK.bits
            | Self::TEXTURE.bits;
        const RENDER_MASK = Self::TEXTURE_MASK.bits | Self::RENDERING.bits;
    }
}

bitflags! {
    /// Access requested when mapping a buffer object.
    #[derive(Default)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits | Self::WRITE.bits;
    }
}

/// Layout properties a format/usage combination is registered with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FormatMetadata {
    pub priority: u32,
    pub tiling: u32,
    pub modifier: u64,
}

/// Linear layout: pitch alignment 1, no tiling, linear modifier.
pub const LINEAR_METADATA: FormatMetadata = FormatMetadata {
    priority: 1,
    tiling: 0,
    modifier: DRM_FORMAT_MOD_LINEAR,
};

/// One supported (format, layout, usage) entry of the capability table.
#[derive(Copy, Clone, Debug)]
pub struct Combination {
    pub format: DrmFormat,
    pub metadata: FormatMetadata,
    pub use_flags: BoUseFlags,
}

/// Layout of a buffer object as seen by the framework.
#[derive(Copy, Clone, Debug, Default)]
pub struct BoMetadata {
    pub width: u32,
    pub height: u32,
    pub format: DrmFormat,
    pub use_flags: BoUseFlags,
    pub num_planes: usize,
    pub strides: [u32; DRV_MAX_PLANES],
    pub offsets: [u32; DRV_MAX_PLANES],
    pub sizes: [u64; DRV_MAX_PLANES],
    pub total_size: u64,
    pub format_modifier: u64,
}

/// Opaque per-instance data a backend attaches to a driver or buffer object.
pub type PrivData = Box<dyn Any + Send + Sync>;

/// A logical graphics buffer.  The backend keeps its state in the private slot; the slot is
/// released by `Backend::bo_destroy`, or when the `Bo` itself is dropped.
#[derive(Default)]
pub struct Bo {
    pub meta: BoMetadata,
    /// Unique per-plane buffer keys.
    pub handles: [u64; DRV_MAX_PLANES],
    priv_data: Option<PrivData>,
}

impl Bo {
    fn new(width: u32, height: u32, format: DrmFormat, use_flags: BoUseFlags) -> GrallocResult<Bo> {
        let num_planes = format.num_planes()?;
        Ok(Bo {
            meta: BoMetadata {
                width,
                height,
                format,
                use_flags,
                num_planes,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    /// Returns true if a backend has attached private state.
    pub fn has_priv(&self) -> bool {
        self.priv_data.is_some()
    }

    pub fn priv_data<T: Any>(&self) -> Option<&T> {
        self.priv_data.as_deref().and_then(|p| p.downcast_ref())
    }

    pub fn set_priv(&mut self, data: PrivData) {
        self.priv_data = Some(data);
    }

    pub fn take_priv(&mut self) -> Option<PrivData> {
        self.priv_data.take()
    }
}

/// A CPU mapping of a buffer object.
pub struct Vma {
    pub addr: *mut c_void,
    pub length: u64,
    pub map_flags: MapFlags,
    token: Option<NonNull<c_void>>,
}

impl Vma {
    fn new(map_flags: MapFlags) -> Vma {
        Vma {
            addr: null_mut(),
            length: 0,
            map_flags,
            token: None,
        }
    }

    /// Backend specific token identifying this mapping.
    pub fn token(&self) -> Option<NonNull<c_void>> {
        self.token
    }

    pub fn set_token(&mut self, token: Option<NonNull<c_void>>) {
        self.token = token;
    }
}

/// Descriptors and layout of an externally allocated buffer.
pub struct ImportFdData<'a> {
    pub fds: Vec<BorrowedFd<'a>>,
    pub strides: [u32; DRV_MAX_PLANES],
    pub offsets: [u32; DRV_MAX_PLANES],
    pub format_modifier: u64,
    pub width: u32,
    pub height: u32,
    pub format: DrmFormat,
    pub use_flags: BoUseFlags,
}

/// The operation table every allocation backend implements.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Registers the supported combinations.  May defer all device work to first use.
    fn init(&self, drv: &mut Driver) -> GrallocResult<()>;

    /// Releases whatever `init` or later calls attached to the driver.  Must be idempotent.
    fn close(&self, drv: &mut Driver);

    fn bo_create(
        &self,
        drv: &mut Driver,
        bo: &mut Bo,
        width: u32,
        height: u32,
        format: DrmFormat,
        use_flags: BoUseFlags,
    ) -> GrallocResult<()>;

    fn bo_import(&self, drv: &mut Driver, bo: &mut Bo, data: &ImportFdData) -> GrallocResult<()>;

    fn bo_destroy(&self, bo: &mut Bo) -> GrallocResult<()>;

    /// Returns a new descriptor for `plane`, owned by the caller.
    fn bo_get_plane_fd(&self, bo: &Bo, plane: usize) -> GrallocResult<OwnedFd>;

    fn bo_map(
        &self,
        drv: &mut Driver,
        bo: &mut Bo,
        vma: &mut Vma,
        map_flags: MapFlags,
    ) -> GrallocResult<*mut c_void>;

    fn bo_unmap(&self, drv: &mut Driver, bo: &mut Bo, vma: &mut Vma) -> GrallocResult<()>;

    fn bo_get_map_stride(&self, bo: &Bo) -> u32;

    fn resolve_format_and_use_flags(
        &self,
        format: DrmFormat,
        use_flags: BoUseFlags,
    ) -> (DrmFormat, BoUseFlags) {
        (format, use_flags)
    }
}

/// An initialized backend together with its capability table.
pub struct Driver {
    backend: Arc<dyn Backend>,
    combos: Vec<Combination>,
    priv_data: Option<PrivData>,
}

impl Driver {
    /// Creates a driver instance and lets `backend` register its combinations.
    pub fn new(backend: Arc<dyn Backend>) -> GrallocResult<Driver> {
        let mut drv = Driver {
            backend: backend.clone(),
            combos: Vec::new(),
            priv_data: None,
        };

        backend.init(&mut drv)?;
        info!(
            "initialized {} backend with {} combinations",
            backend.name(),
            drv.combos.len()
        );
        Ok(drv)
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn priv_data<T: Any>(&self) -> Option<&T> {
        self.priv_data.as_deref().and_then(|p| p.downcast_ref())
    }

    pub fn set_priv(&mut self, data: PrivData) {
        self.priv_data = Some(data);
    }

    pub fn take_priv(&mut self) -> Option<PrivData> {
        self.priv_data.take()
    }

    pub fn resolve_format_and_use_flags(
        &self,
        format: DrmFormat,
        use_flags: BoUseFlags,
    ) -> (DrmFormat, BoUseFlags) {
        self.backend.resolve_format_and_use_flags(format, use_flags)
    }

    /// Allocates a new buffer object.  `format` must already be resolved.
    pub fn bo_create(
        &mut self,
        width: u32,
        height: u32,
        format: DrmFormat,
        use_flags: BoUseFlags,
    ) -> GrallocResult<Bo> {
        let mut bo = Bo::new(width, height, format, use_flags)?;
        let backend = self.backend.clone();
        backend.bo_create(self, &mut bo, width, height, format, use_flags)?;
        Ok(bo)
    }

    /// Wraps externally allocated memory into a new buffer object.
    pub fn bo_import(&mut self, data: &ImportFdData) -> GrallocResult<Bo> {
        let mut bo = Bo::new(data.width, data.height, data.format, data.use_flags)?;
        let num_planes = bo.meta.num_planes;
        if data.fds.len() < num_planes {
            return Err(GrallocError::InvalidArgument("missing plane descriptors"));
        }

        bo.meta.format_modifier = data.format_modifier;
        for plane in 0..num_planes {
            let seek_end = descriptor_size(data.fds[plane])?;
            let offset = data.offsets[plane] as u64;
            let end = if plane == num_planes - 1 || data.offsets[plane + 1] == 0 {
                seek_end
            } else {
                data.offsets[plane + 1] as u64
            };

            if end < offset || end > seek_end {
                return Err(GrallocError::InvalidArgument("plane exceeds buffer size"));
            }

            bo.meta.strides[plane] = data.strides[plane];
            bo.meta.offsets[plane] = data.offsets[plane];
            bo.meta.sizes[plane] = end - offset;
            bo.meta.total_size += end - offset;
        }

        let backend = self.backend.clone();
        backend.bo_import(self, &mut bo, data)?;
        Ok(bo)
    }

    pub fn bo_destroy(&mut self, bo: &mut Bo) -> GrallocResult<()> {
        self.backend.bo_destroy(bo)
    }

    pub fn bo_get_plane_fd(&self, bo: &Bo, plane: usize) -> GrallocResult<OwnedFd> {
        if plane >= bo.meta.num_planes {
            return Err(GrallocError::InvalidArgument("plane out of range"));
        }

        self.backend.bo_get_plane_fd(bo, plane)
    }

    pub fn bo_map(&mut self, bo: &mut Bo, map_flags: MapFlags) -> GrallocResult<Vma> {
        let mut vma = Vma::new(map_flags);
        let backend = self.backend.clone();
        vma.addr = backend.bo_map(self, bo, &mut vma, map_flags)?;
        debug!("mapped {} bytes at {:p}", vma.length, vma.addr);
        Ok(vma)
    }

    pub fn bo_unmap(&mut self, bo: &mut Bo, vma: &mut Vma) -> GrallocResult<()> {
        let backend = self.backend.clone();
        backend.bo_unmap(self, bo, vma)?;
        vma.addr = null_mut();
        Ok(())
    }

    pub fn bo_get_map_stride(&self, bo: &Bo) -> u32 {
        self.backend.bo_get_map_stride(bo)
    }

    /// Lets the backend release its per-driver state.  Safe to call more than once.
    pub fn close(&mut self) {
        let backend = self.backend.clone();
        backend.close(self);
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close();
    }
}
