// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! driver: The lazily created GBM device context shared by a driver and its buffers.

use std::os::unix::io::AsFd;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use log::error;
use log::info;

use crate::drv::Driver;
use crate::gbm_mesa::drm_node::drop_master;
use crate::gbm_mesa::drm_node::find_kms_node;
use crate::gbm_mesa::drm_node::is_separate_dc_gpu;
use crate::gbm_mesa::wrapper::BackendLoader;
use crate::gbm_mesa::wrapper::GbmDevice;
use crate::gbm_mesa::wrapper::GbmOps;
use crate::gralloc_utils::GrallocError;
use crate::gralloc_utils::GrallocResult;

/// Default directory holding DRM device nodes.
pub const DRI_DIR: &str = "/dev/dri";

/// GPU drivers without display hardware of their own.  Scanout buffers for these must be
/// allocated through the separate display controller's card node.
pub const SEPARATE_DC_GPUS: [&str; 6] = ["v3d", "vc4", "etnaviv", "panfrost", "lima", "freedreno"];

/// Nodes a device context is built on.
pub struct DeviceNodes {
    /// The node GBM allocates through.
    pub gbm_node: OwnedFd,
    /// The first render node, if one could be opened.
    pub gpu_node: Option<OwnedFd>,
}

/// Selects the DRM nodes for a new device context.
pub trait NodeFinder: Send + Sync {
    /// `mapper_sphal` is set when the caller only maps buffers and never needs a KMS node.
    fn find_nodes(&self, mapper_sphal: bool) -> GrallocResult<DeviceNodes>;
}

/// Finds nodes by probing a DRI directory.
pub struct DrmNodeFinder {
    dri_dir: PathBuf,
    separate_dc_gpus: Vec<String>,
}

impl DrmNodeFinder {
    pub fn new(dri_dir: &Path, separate_dc_gpus: Vec<String>) -> DrmNodeFinder {
        DrmNodeFinder {
            dri_dir: dri_dir.to_path_buf(),
            separate_dc_gpus,
        }
    }
}

impl Default for DrmNodeFinder {
    fn default() -> DrmNodeFinder {
        DrmNodeFinder::new(
            Path::new(DRI_DIR),
            SEPARATE_DC_GPUS.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl DrmNodeFinder {
    fn open_kms_node(&self) -> Option<OwnedFd> {
        let card = find_kms_node(&self.dri_dir).unwrap_or_else(|e| {
            error!("Unable to enumerate card nodes: {}", e);
            None
        })?;

        // Leave mode setting to the display manager.
        if let Err(e) = drop_master(&card.file) {
            debug!("drop master on {}: {}", card.path.display(), e);
        }

        Some(OwnedFd::from(card.file))
    }
}

impl NodeFinder for DrmNodeFinder {
    fn find_nodes(&self, mapper_sphal: bool) -> GrallocResult<DeviceNodes> {
        let (separate_dc, gpu_node) =
            match is_separate_dc_gpu(&self.dri_dir, &self.separate_dc_gpus) {
                Ok((separate_dc, gpu)) => (separate_dc, gpu.map(OwnedFd::from)),
                Err(e) => {
                    error!("Unable to find render node: {}", e);
                    (false, None)
                }
            };

        let gbm_node = select_gbm_node(
            separate_dc,
            mapper_sphal,
            gpu_node.as_ref(),
            || self.open_kms_node(),
            |fd| Ok(fd.try_clone()?),
        )?;

        Ok(DeviceNodes { gbm_node, gpu_node })
    }
}

/// Picks the node GBM allocates through.  A GPU with a separate display controller needs the
/// KMS card node found by `find_kms`, unless the caller only maps buffers.  Everything else
/// allocates through a duplicate of the render node.
pub fn select_gbm_node<N>(
    separate_dc: bool,
    mapper_sphal: bool,
    gpu_node: Option<&N>,
    find_kms: impl FnOnce() -> Option<N>,
    dup: impl FnOnce(&N) -> GrallocResult<N>,
) -> GrallocResult<N> {
    let gbm_node = if separate_dc && !mapper_sphal {
        info!("GPU require KMSRO entry, searching for separate KMS driver...");
        match find_kms() {
            Some(card) => Some(card),
            None => {
                error!("Unable to find/open /dev/card node with KMS capabilities.");
                return Err(GrallocError::NoKmsNode);
            }
        }
    } else {
        gpu_node.map(dup).transpose()?
    };

    gbm_node.ok_or_else(|| {
        error!("Unable to find or open DRM node");
        GrallocError::NoUsableNode
    })
}

/// A GBM device together with the wrapper that created it and the nodes it was created on.
pub struct GbmMesaDriver {
    gbm: GbmDevice,
    ops: Box<dyn GbmOps>,
    // The device is destroyed before the nodes close.
    _gbm_node: OwnedFd,
    _gpu_node: Option<OwnedFd>,
}

// Safe because the GBM device is only used through the wrapper, which serializes access to it.
unsafe impl Send for GbmMesaDriver {}
unsafe impl Sync for GbmMesaDriver {}

impl GbmMesaDriver {
    /// Selects nodes, loads the wrapper and creates the GBM device.  Anything acquired before a
    /// failing step is released on return.
    pub fn init(
        finder: &dyn NodeFinder,
        loader: &dyn BackendLoader,
        mapper_sphal: bool,
    ) -> GrallocResult<GbmMesaDriver> {
        let nodes = finder.find_nodes(mapper_sphal)?;
        let ops = loader.load()?;
        let gbm = ops.dev_create(nodes.gbm_node.as_fd()).ok_or_else(|| {
            error!("Unable to create gbm_mesa driver");
            GrallocError::DeviceCreateFailed
        })?;

        Ok(GbmMesaDriver {
            gbm,
            ops,
            _gbm_node: nodes.gbm_node,
            _gpu_node: nodes.gpu_node,
        })
    }

    pub fn device(&self) -> GbmDevice {
        self.gbm
    }

    pub fn ops(&self) -> &dyn GbmOps {
        self.ops.as_ref()
    }
}

impl Drop for GbmMesaDriver {
    fn drop(&mut self) {
        self.ops.dev_destroy(self.gbm);
    }
}

// Driver private slot contents.
struct GbmMesaDriverPriv {
    gbm_mesa_drv: Arc<GbmMesaDriver>,
}

/// Returns the device context of `drv`, creating it on first use.  A failed creation leaves
/// nothing behind, so the next call tries again.
pub fn get_or_init_driver(
    drv: &mut Driver,
    finder: &dyn NodeFinder,
    loader: &dyn BackendLoader,
    mapper_sphal: bool,
) -> GrallocResult<Arc<GbmMesaDriver>> {
    if let Some(drv_priv) = drv.priv_data::<GbmMesaDriverPriv>() {
        return Ok(drv_priv.gbm_mesa_drv.clone());
    }

    let gbm_mesa_drv = Arc::new(GbmMesaDriver::init(finder, loader, mapper_sphal)?);
    drv.set_priv(Box::new(GbmMesaDriverPriv {
        gbm_mesa_drv: gbm_mesa_drv.clone(),
    }));
    info!("gbm_mesa device context created");
    Ok(gbm_mesa_drv)
}

/// Drops the driver's reference to its device context.  Buffers still holding one keep the
/// context alive.
pub fn close_driver(drv: &mut Driver) {
    if drv.take_priv().is_some() {
        debug!("gbm_mesa device context released by driver");
    }
}
