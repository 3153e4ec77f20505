// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! gbm_mesa: A gralloc backend that allocates through Mesa's GBM.
//!
//! GBM is reached through a wrapper library loaded at runtime, so the allocator carries no
//! build time dependency on Mesa.  The GBM device is created lazily on first use and shared
//! between the driver instance and every buffer object that holds a GBM handle.

mod bo;
mod driver;
mod drm_node;
mod format_policy;
#[cfg(test)]
mod testing;
mod wrapper;

use std::os::raw::c_void;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

pub use bo::plan_allocation;
pub use bo::AllocPlan;
pub use bo::GbmMesaBoPriv;
pub use driver::DeviceNodes;
pub use driver::DrmNodeFinder;
pub use driver::GbmMesaDriver;
pub use driver::NodeFinder;
pub use driver::DRI_DIR;
pub use driver::SEPARATE_DC_GPUS;
pub use drm_node::find_device;
pub use drm_node::is_kms_dev;
pub use drm_node::is_separate_dc_gpu;
pub use drm_node::DrmCandidate;
pub use drm_node::NodeClass;
pub use format_policy::resolve_format_and_use_flags;
pub use wrapper::gbm_ops;
pub use wrapper::AllocOutput;
pub use wrapper::AllocRequest;
pub use wrapper::BackendLoader;
pub use wrapper::DlBackendLoader;
pub use wrapper::GbmBo;
pub use wrapper::GbmDevice;
pub use wrapper::GbmOps;
pub use wrapper::ImportRequest;
pub use wrapper::Mapping;
pub use wrapper::WrapperGbmOps;
pub use wrapper::GBM_WRAPPER_LIBRARY;
pub use wrapper::GBM_WRAPPER_SYMBOL;

use crate::drv::Backend;
use crate::drv::Bo;
use crate::drv::BoUseFlags;
use crate::drv::Driver;
use crate::drv::DrmFormat;
use crate::drv::ImportFdData;
use crate::drv::MapFlags;
use crate::drv::Vma;
use crate::gralloc_utils::GrallocError;
use crate::gralloc_utils::GrallocResult;

/// The GBM backend.  Holds no device state itself; that lives in the driver's private slot.
pub struct GbmMesaBackend {
    node_finder: Box<dyn NodeFinder>,
    loader: Box<dyn BackendLoader>,
}

impl GbmMesaBackend {
    /// Returns the device context of `drv`, creating it on first use.
    pub fn driver_context(
        &self,
        drv: &mut Driver,
        mapper_sphal: bool,
    ) -> GrallocResult<Arc<GbmMesaDriver>> {
        driver::get_or_init_driver(
            drv,
            self.node_finder.as_ref(),
            self.loader.as_ref(),
            mapper_sphal,
        )
    }
}

impl Backend for GbmMesaBackend {
    fn name(&self) -> &'static str {
        "gbm_mesa"
    }

    fn init(&self, drv: &mut Driver) -> GrallocResult<()> {
        format_policy::register_combinations(drv)
    }

    fn close(&self, drv: &mut Driver) {
        driver::close_driver(drv)
    }

    fn bo_create(
        &self,
        drv: &mut Driver,
        bo: &mut Bo,
        _width: u32,
        _height: u32,
        _format: DrmFormat,
        use_flags: BoUseFlags,
    ) -> GrallocResult<()> {
        self.allocate(drv, bo, use_flags)
    }

    fn bo_import(&self, drv: &mut Driver, bo: &mut Bo, data: &ImportFdData) -> GrallocResult<()> {
        self.import(drv, bo, data)
    }

    fn bo_destroy(&self, bo: &mut Bo) -> GrallocResult<()> {
        self.destroy(bo)
    }

    fn bo_get_plane_fd(&self, bo: &Bo, plane: usize) -> GrallocResult<OwnedFd> {
        self.plane_fd(bo, plane)
    }

    fn bo_map(
        &self,
        drv: &mut Driver,
        bo: &mut Bo,
        vma: &mut Vma,
        map_flags: MapFlags,
    ) -> GrallocResult<*mut c_void> {
        self.map(drv, bo, vma, map_flags)
    }

    fn bo_unmap(&self, drv: &mut Driver, bo: &mut Bo, vma: &mut Vma) -> GrallocResult<()> {
        self.unmap(drv, bo, vma)
    }

    fn bo_get_map_stride(&self, bo: &Bo) -> u32 {
        self.map_stride(bo)
    }

    fn resolve_format_and_use_flags(
        &self,
        format: DrmFormat,
        use_flags: BoUseFlags,
    ) -> (DrmFormat, BoUseFlags) {
        resolve_format_and_use_flags(format, use_flags)
    }
}

/// Configures a `GbmMesaBackend`.
///
/// By default the backend probes `/dev/dri` and loads `libgbm_mesa_wrapper.so`.  A custom
/// `NodeFinder` or `BackendLoader` replaces the corresponding default entirely.
pub struct GbmMesaBuilder {
    dri_dir: PathBuf,
    separate_dc_gpus: Vec<String>,
    library: String,
    symbol: String,
    node_finder: Option<Box<dyn NodeFinder>>,
    loader: Option<Box<dyn BackendLoader>>,
}

impl GbmMesaBuilder {
    pub fn new() -> GbmMesaBuilder {
        GbmMesaBuilder {
            dri_dir: PathBuf::from(DRI_DIR),
            separate_dc_gpus: SEPARATE_DC_GPUS.iter().map(|s| s.to_string()).collect(),
            library: GBM_WRAPPER_LIBRARY.to_string(),
            symbol: GBM_WRAPPER_SYMBOL.to_string(),
            node_finder: None,
            loader: None,
        }
    }

    /// Directory searched for `renderD*` and `card*` nodes.
    pub fn set_dri_dir(mut self, dri_dir: &Path) -> GbmMesaBuilder {
        self.dri_dir = dri_dir.to_path_buf();
        self
    }

    /// GPU driver names that need a separate KMS node for scanout allocations.
    pub fn set_separate_dc_gpus(mut self, gpus: &[&str]) -> GbmMesaBuilder {
        self.separate_dc_gpus = gpus.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn set_wrapper_library(mut self, library: &str) -> GbmMesaBuilder {
        self.library = library.to_string();
        self
    }

    pub fn set_wrapper_symbol(mut self, symbol: &str) -> GbmMesaBuilder {
        self.symbol = symbol.to_string();
        self
    }

    pub fn set_node_finder(mut self, node_finder: Box<dyn NodeFinder>) -> GbmMesaBuilder {
        self.node_finder = Some(node_finder);
        self
    }

    pub fn set_backend_loader(mut self, loader: Box<dyn BackendLoader>) -> GbmMesaBuilder {
        self.loader = Some(loader);
        self
    }

    pub fn build(self) -> GrallocResult<GbmMesaBackend> {
        if self.library.is_empty() {
            return Err(GrallocError::InvalidArgument("empty wrapper library name"));
        }

        if self.symbol.is_empty() {
            return Err(GrallocError::InvalidArgument("empty wrapper symbol name"));
        }

        let node_finder = match self.node_finder {
            Some(node_finder) => node_finder,
            None => Box::new(DrmNodeFinder::new(&self.dri_dir, self.separate_dc_gpus)),
        };

        let loader = match self.loader {
            Some(loader) => loader,
            None => Box::new(DlBackendLoader::new(&self.library, &self.symbol)),
        };

        Ok(GbmMesaBackend {
            node_finder,
            loader,
        })
    }
}

impl Default for GbmMesaBuilder {
    fn default() -> GbmMesaBuilder {
        GbmMesaBuilder::new()
    }
}
