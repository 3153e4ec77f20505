// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! bo: Buffer allocation, import and CPU mapping through the GBM wrapper.

use std::os::raw::c_void;
use std::os::unix::io::AsFd;
use std::os::unix::io::OwnedFd;
use std::sync::Arc;

use log::debug;
use log::error;
use crate::drv::align_u32;
use crate::drv::align_u64;
use crate::drv::drv_bo_from_format;
use crate::drv::stride_from_width;
use crate::drv::Bo;
use crate::drv::BoMetadata;
use crate::drv::BoUseFlags;
use crate::drv::Driver;
use crate::drv::DrmFormat;
use crate::drv::ImportFdData;
use crate::drv::MapFlags;
use crate::drv::Vma;
use crate::gbm_mesa::driver::GbmMesaDriver;
use crate::gbm_mesa::wrapper::AllocOutput;
use crate::gbm_mesa::wrapper::AllocRequest;
use crate::gbm_mesa::wrapper::GbmBo;
use crate::gbm_mesa::wrapper::GbmOps;
use crate::gbm_mesa::wrapper::ImportRequest;
use crate::gbm_mesa::GbmMesaBackend;
use crate::gralloc_os::descriptor_inode;
use crate::gralloc_utils::GrallocError;
use crate::gralloc_utils::GrallocResult;

// Camera (RPI4 CSI) buffers want 32 pixel aligned rows and page aligned sizes.
const CAMERA_WIDTH_ALIGN: u32 = 32;
const CAMERA_SIZE_ALIGN: u32 = 4096;

// Some Mesa drivers can't allocate 1D textures; blobs become 2D R8 textures this wide.
const BLOB_ROW_WIDTH: u32 = 4096;

/// Backend state of one buffer object.
pub struct GbmMesaBoPriv {
    /// Set when `gbm_bo` exists; keeps the device it belongs to alive.
    drv: Option<Arc<GbmMesaDriver>>,
    /// One descriptor per plane.
    fds: Vec<OwnedFd>,
    gbm_bo: Option<GbmBo>,
    map_stride: u32,
}

// Safe because `gbm_bo` is only handed back to the wrapper that created it.
unsafe impl Send for GbmMesaBoPriv {}
unsafe impl Sync for GbmMesaBoPriv {}

impl Drop for GbmMesaBoPriv {
    fn drop(&mut self) {
        if let (Some(gbm_bo), Some(drv)) = (self.gbm_bo.take(), self.drv.as_ref()) {
            drv.ops().free(gbm_bo);
        }
    }
}

/// The request sent to the wrapper, and what must be remembered about how it was derived.
#[derive(Copy, Clone, Debug)]
pub struct AllocPlan {
    pub request: AllocRequest,
    /// Camera buffers must be scanout capable; no retry without scanout.
    pub scanout_strong: bool,
    pub size_align: u32,
    /// Layout of a format GBM can't represent, carried by an opaque R8 allocation.
    pub blob_layout: Option<BoMetadata>,
}

/// Derives the wrapper request for allocating `meta`.  `format_supported` tells whether GBM has
/// a native equivalent of `meta.format`.
pub fn plan_allocation(
    meta: &BoMetadata,
    use_flags: BoUseFlags,
    format_supported: bool,
) -> GrallocResult<AllocPlan> {
    let cpu_access = use_flags.intersects(BoUseFlags::SW_MASK);
    let mut plan = AllocPlan {
        request: AllocRequest {
            width: meta.width,
            height: meta.height,
            drm_format: meta.format,
            force_linear: cpu_access,
            needs_map_stride: cpu_access,
            use_scanout: use_flags.contains(BoUseFlags::SCANOUT),
        },
        scanout_strong: false,
        size_align: 1,
        blob_layout: None,
    };

    if use_flags.intersects(BoUseFlags::CAMERA_MASK) {
        plan.scanout_strong = true;
        plan.request.use_scanout = true;
        plan.request.width = align_u32(plan.request.width, CAMERA_WIDTH_ALIGN)?;
        plan.size_align = CAMERA_SIZE_ALIGN;
    }

    if !format_supported {
        // Formats GBM doesn't know are carried linearly in an R8 buffer of the same byte size.
        let mut layout = *meta;
        let stride = stride_from_width(meta.format, plan.request.width)?;
        drv_bo_from_format(&mut layout, stride, plan.request.height, meta.format)?;
        layout.total_size = align_u64(layout.total_size, plan.size_align.into())?;

        plan.request.drm_format = DrmFormat::R8;
        plan.request.width = layout.total_size.try_into()?;
        plan.request.height = 1;
        plan.request.force_linear = true;
        plan.blob_layout = Some(layout);
        debug!(
            "Unable to allocate {:?} format, allocate as 1D buffer",
            meta.format
        );
    }

    if plan.request.drm_format == DrmFormat::R8 && plan.request.height == 1 {
        plan.request.needs_map_stride = false;
        plan.request.height = plan.request.width.div_ceil(BLOB_ROW_WIDTH);
        plan.request.width = BLOB_ROW_WIDTH;
        debug!(
            "Allocate 1D buffer as {}x{} R8 2D texture",
            plan.request.width, plan.request.height
        );
    }

    Ok(plan)
}

// Some SoCs run out of scanout capable memory; such buffers are composited by the GPU instead.
fn alloc_with_fallback(
    ops: &dyn GbmOps,
    gbm_drv: &GbmMesaDriver,
    plan: &mut AllocPlan,
) -> GrallocResult<AllocOutput> {
    let result = match ops.alloc(gbm_drv.device(), &plan.request) {
        Err(e) if !plan.scanout_strong => {
            error!("Failed to allocate for scanout, trying non-scanout: {}", e);
            plan.request.use_scanout = false;
            ops.alloc(gbm_drv.device(), &plan.request)
        }
        result => result,
    };

    result.map_err(|e| {
        error!("Failed to allocate buffer: {}", e);
        e
    })
}

// GBM sees buffers it has no format for as one row of R8 bytes.
fn gbm_dimensions(ops: &dyn GbmOps, meta: &BoMetadata) -> GrallocResult<(u32, u32, DrmFormat)> {
    if ops.supports_format(meta.format) {
        Ok((meta.width, meta.height, meta.format))
    } else {
        Ok((meta.total_size.try_into()?, 1, DrmFormat::R8))
    }
}

// Records the inode of each plane descriptor as the plane handle.  Dups of one descriptor
// share an inode, so handles identify the underlying memory.
fn inode_to_handle(bo: &mut Bo, fds: &[OwnedFd]) -> GrallocResult<()> {
    for (plane, fd) in fds.iter().enumerate() {
        bo.handles[plane] = descriptor_inode(fd.as_fd())?;
    }
    Ok(())
}

fn dup_fds(fd: &OwnedFd, count: usize) -> GrallocResult<Vec<OwnedFd>> {
    let mut fds = Vec::with_capacity(count);
    for _ in 0..count {
        fds.push(fd.try_clone()?);
    }
    Ok(fds)
}

impl GbmMesaBackend {
    fn context_or_einval(
        &self,
        drv: &mut Driver,
        mapper_sphal: bool,
    ) -> GrallocResult<Arc<GbmMesaDriver>> {
        self.driver_context(drv, mapper_sphal).map_err(|e| {
            error!("Failed to init gbm driver: {}", e);
            GrallocError::InvalidArgument("failed to init gbm driver")
        })
    }

    pub(crate) fn allocate(
        &self,
        drv: &mut Driver,
        bo: &mut Bo,
        use_flags: BoUseFlags,
    ) -> GrallocResult<()> {
        let gbm_drv = self.context_or_einval(drv, false)?;
        let ops = gbm_drv.ops();

        let mut plan = plan_allocation(&bo.meta, use_flags, ops.supports_format(bo.meta.format))?;
        let out = alloc_with_fallback(ops, &gbm_drv, &mut plan)?;

        let format = bo.meta.format;
        match plan.blob_layout {
            Some(layout) => bo.meta = layout,
            None => drv_bo_from_format(&mut bo.meta, out.stride, plan.request.height, format)?,
        }
        bo.meta.format_modifier = out.modifier;

        debug!(
            "Allocated: {}x{}, stride: {}, map_stride: {}",
            bo.meta.width, bo.meta.height, out.stride, out.map_stride
        );

        let fds = dup_fds(&out.fd, bo.meta.num_planes)?;
        let mut bo_priv = GbmMesaBoPriv {
            drv: None,
            fds,
            gbm_bo: None,
            map_stride: out.map_stride,
        };

        // CPU access goes through a GBM buffer object, which the allocation itself doesn't
        // produce.
        if use_flags.intersects(BoUseFlags::SW_MASK) {
            let (width, height, drm_format) = gbm_dimensions(ops, &bo.meta)?;
            let req = ImportRequest {
                fd: out.fd.as_fd(),
                width,
                height,
                stride: bo.meta.strides[0],
                modifier: out.modifier,
                drm_format,
            };
            let gbm_bo = ops.import(gbm_drv.device(), &req).ok_or_else(|| {
                error!("Failed to import allocated buffer for mapping");
                GrallocError::ImportFailed
            })?;

            bo_priv.gbm_bo = Some(gbm_bo);
            bo_priv.drv = Some(gbm_drv.clone());
        }

        inode_to_handle(bo, &bo_priv.fds)?;
        bo.set_priv(Box::new(bo_priv));
        Ok(())
    }

    pub(crate) fn import(
        &self,
        drv: &mut Driver,
        bo: &mut Bo,
        data: &ImportFdData,
    ) -> GrallocResult<()> {
        if bo.has_priv() {
            error!("bo_import: bo isn't empty");
            return Err(GrallocError::InvalidArgument("bo isn't empty"));
        }

        let num_planes = bo.meta.num_planes;
        if data.fds.len() < num_planes {
            return Err(GrallocError::InvalidArgument("missing plane descriptors"));
        }

        let fds = data.fds[..num_planes]
            .iter()
            .map(|fd| fd.try_clone_to_owned())
            .collect::<Result<Vec<OwnedFd>, _>>()?;

        let mut bo_priv = GbmMesaBoPriv {
            drv: None,
            fds,
            gbm_bo: None,
            map_stride: 0,
        };

        // Mapping requires the buffer to be imported into GBM.
        if data.use_flags.intersects(BoUseFlags::SW_MASK) {
            let gbm_drv = self.context_or_einval(drv, true)?;
            let ops = gbm_drv.ops();
            let (width, height, drm_format) = gbm_dimensions(ops, &bo.meta)?;

            let req = ImportRequest {
                fd: data.fds[0],
                width,
                height,
                stride: data.strides[0],
                modifier: data.format_modifier,
                drm_format,
            };
            let gbm_bo = ops.import(gbm_drv.device(), &req).ok_or_else(|| {
                error!("Failed to import buffer into gbm");
                GrallocError::ImportFailed
            })?;

            bo_priv.gbm_bo = Some(gbm_bo);
            bo_priv.drv = Some(gbm_drv);
        }

        inode_to_handle(bo, &bo_priv.fds)?;
        bo.set_priv(Box::new(bo_priv));
        Ok(())
    }

    pub(crate) fn destroy(&self, bo: &mut Bo) -> GrallocResult<()> {
        // Dropping the state closes the descriptors and frees the GBM buffer.
        drop(bo.take_priv());
        Ok(())
    }

    pub(crate) fn plane_fd(&self, bo: &Bo, plane: usize) -> GrallocResult<OwnedFd> {
        let bo_priv = bo
            .priv_data::<GbmMesaBoPriv>()
            .ok_or(GrallocError::InvalidArgument("bo has no backend state"))?;
        let fd = bo_priv
            .fds
            .get(plane)
            .ok_or(GrallocError::InvalidArgument("plane out of range"))?;
        Ok(fd.try_clone()?)
    }

    pub(crate) fn map(
        &self,
        drv: &mut Driver,
        bo: &mut Bo,
        vma: &mut Vma,
        _map_flags: MapFlags,
    ) -> GrallocResult<*mut c_void> {
        let gbm_drv = self.context_or_einval(drv, true)?;
        vma.length = bo.meta.total_size;

        let bo_priv = bo
            .priv_data::<GbmMesaBoPriv>()
            .ok_or(GrallocError::InvalidBackendHandle)?;
        let gbm_bo = bo_priv.gbm_bo.ok_or_else(|| {
            error!("bo_map: buffer was not imported for CPU access");
            GrallocError::InvalidBackendHandle
        })?;
        let owner = bo_priv.drv.as_ref().unwrap_or(&gbm_drv);

        let (width, height, _) = gbm_dimensions(owner.ops(), &bo.meta)?;
        let mapping = owner.ops().map(gbm_bo, width, height)?;
        vma.set_token(Some(mapping.map_data));
        Ok(mapping.addr)
    }

    pub(crate) fn unmap(&self, drv: &mut Driver, bo: &mut Bo, vma: &mut Vma) -> GrallocResult<()> {
        let gbm_drv = self.context_or_einval(drv, true)?;

        let bo_priv = bo
            .priv_data::<GbmMesaBoPriv>()
            .ok_or(GrallocError::InvalidBackendHandle)?;
        let gbm_bo = bo_priv.gbm_bo.ok_or_else(|| {
            error!("bo_unmap: buffer has no gbm handle");
            GrallocError::InvalidBackendHandle
        })?;
        let map_data = vma.token().ok_or_else(|| {
            error!("bo_unmap: mapping has no token");
            GrallocError::InvalidMapping
        })?;
        let owner = bo_priv.drv.as_ref().unwrap_or(&gbm_drv);

        owner.ops().unmap(gbm_bo, map_data);
        vma.set_token(None);
        Ok(())
    }

    pub(crate) fn map_stride(&self, bo: &Bo) -> u32 {
        bo.priv_data::<GbmMesaBoPriv>()
            .map_or(0, |bo_priv| bo_priv.map_stride)
    }
}
