// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-process stand-ins for the GBM wrapper and DRM nodes.  Buffers are memfds.

use std::ffi::CStr;
use std::os::raw::c_void;
use std::os::unix::io::AsFd;
use std::os::unix::io::BorrowedFd;
use std::os::unix::io::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MFdFlags;
use nix::unistd::ftruncate;

use crate::drv::align_u32;
use crate::drv::drv_bo_from_format;
use crate::drv::stride_from_width;
use crate::drv::BoMetadata;
use crate::drv::BoUseFlags;
use crate::drv::Driver;
use crate::drv::DrmFormat;
use crate::drv::ImportFdData;
use crate::gbm_mesa::AllocOutput;
use crate::gbm_mesa::AllocRequest;
use crate::gbm_mesa::BackendLoader;
use crate::gbm_mesa::DeviceNodes;
use crate::gbm_mesa::GbmBo;
use crate::gbm_mesa::GbmDevice;
use crate::gbm_mesa::GbmMesaBackend;
use crate::gbm_mesa::GbmMesaBuilder;
use crate::gbm_mesa::GbmOps;
use crate::gbm_mesa::ImportRequest;
use crate::gbm_mesa::Mapping;
use crate::gbm_mesa::NodeFinder;
use crate::gralloc_utils::GrallocError;
use crate::gralloc_utils::GrallocResult;
use crate::gralloc_utils::DRM_FORMAT_MOD_LINEAR;

/// Modifier the fake reports for allocations that may be tiled.
pub const FAKE_TILED_MODIFIER: u64 = 0x0100_0000_0000_0001;

const FAKE_PITCH_ALIGN: u32 = 64;

#[derive(Copy, Clone, Debug)]
pub struct FakeImport {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub modifier: u64,
    pub drm_format: DrmFormat,
}

#[derive(Default)]
pub struct FakeState {
    pub supported: Vec<DrmFormat>,
    pub fail_allocs: usize,
    pub fail_imports: bool,
    pub fail_dev_create: bool,
    pub alloc_requests: Vec<AllocRequest>,
    pub imports: Vec<FakeImport>,
    pub maps: Vec<(u32, u32)>,
    pub unmaps: usize,
    pub live_bos: usize,
    pub freed: usize,
    pub loads: usize,
    pub ops_dropped: usize,
    pub devices_created: usize,
    pub devices_destroyed: usize,
    next_bo: usize,
    _mappings: Vec<Box<[u8]>>,
}

pub fn fake_buffer(size: u64) -> OwnedFd {
    let name = CStr::from_bytes_with_nul(b"fake-gbm\0").unwrap();
    let fd = memfd_create(name, MFdFlags::MFD_CLOEXEC).unwrap();
    ftruncate(&fd, size as i64).unwrap();
    fd
}

pub fn import_data(
    fd: &OwnedFd,
    width: u32,
    height: u32,
    format: DrmFormat,
    use_flags: BoUseFlags,
) -> ImportFdData<'_> {
    let mut strides = [0; 4];
    strides[0] = stride_from_width(format, width).unwrap();
    ImportFdData {
        fds: vec![fd.as_fd()],
        strides,
        offsets: [0; 4],
        format_modifier: DRM_FORMAT_MOD_LINEAR,
        width,
        height,
        format,
        use_flags,
    }
}

struct FakeOps {
    state: Arc<Mutex<FakeState>>,
}

impl FakeOps {
    fn state(&self) -> MutexGuard<FakeState> {
        self.state.lock().unwrap()
    }
}

impl Drop for FakeOps {
    fn drop(&mut self) {
        self.state().ops_dropped += 1;
    }
}

impl GbmOps for FakeOps {
    fn dev_create(&self, _fd: BorrowedFd<'_>) -> Option<GbmDevice> {
        let mut state = self.state();
        if state.fail_dev_create {
            return None;
        }
        state.devices_created += 1;
        GbmDevice::from_raw(0x100 as *mut c_void)
    }

    fn dev_destroy(&self, _gbm: GbmDevice) {
        self.state().devices_destroyed += 1;
    }

    fn get_gbm_format(&self, format: DrmFormat) -> u32 {
        let state = self.state();
        if format == DrmFormat::R8 || state.supported.contains(&format) {
            format.0
        } else {
            0
        }
    }

    fn alloc(&self, _gbm: GbmDevice, req: &AllocRequest) -> GrallocResult<AllocOutput> {
        let mut state = self.state();
        state.alloc_requests.push(*req);
        if state.fail_allocs > 0 {
            state.fail_allocs -= 1;
            return Err(GrallocError::ComponentError(-libc::ENOMEM));
        }

        if req.drm_format != DrmFormat::R8 && !state.supported.contains(&req.drm_format) {
            return Err(GrallocError::ComponentError(-libc::EINVAL));
        }

        let min_stride = stride_from_width(req.drm_format, req.width)?;
        let stride = align_u32(min_stride, FAKE_PITCH_ALIGN)?;
        let mut meta = BoMetadata::default();
        drv_bo_from_format(&mut meta, stride, req.height, req.drm_format)?;

        Ok(AllocOutput {
            fd: fake_buffer(meta.total_size),
            stride,
            map_stride: if req.needs_map_stride { stride } else { 0 },
            modifier: if req.force_linear {
                DRM_FORMAT_MOD_LINEAR
            } else {
                FAKE_TILED_MODIFIER
            },
        })
    }

    fn import(&self, _gbm: GbmDevice, req: &ImportRequest) -> Option<GbmBo> {
        let mut state = self.state();
        if state.fail_imports {
            return None;
        }

        state.imports.push(FakeImport {
            width: req.width,
            height: req.height,
            stride: req.stride,
            modifier: req.modifier,
            drm_format: req.drm_format,
        });
        state.live_bos += 1;
        state.next_bo += 1;
        GbmBo::from_raw((0x1000 + state.next_bo * 0x10) as *mut c_void)
    }

    fn free(&self, _bo: GbmBo) {
        let mut state = self.state();
        state.live_bos -= 1;
        state.freed += 1;
    }

    fn map(&self, _bo: GbmBo, width: u32, height: u32) -> GrallocResult<Mapping> {
        let mut state = self.state();
        state.maps.push((width, height));

        let mut backing = vec![0u8; (width * height) as usize].into_boxed_slice();
        let addr = backing.as_mut_ptr() as *mut c_void;
        state._mappings.push(backing);
        Ok(Mapping {
            addr,
            map_data: NonNull::new(addr).ok_or(GrallocError::MappingFailed)?,
        })
    }

    fn unmap(&self, _bo: GbmBo, _map_data: NonNull<c_void>) {
        self.state().unmaps += 1;
    }
}

struct FakeLoader {
    state: Arc<Mutex<FakeState>>,
}

impl BackendLoader for FakeLoader {
    fn load(&self) -> GrallocResult<Box<dyn GbmOps>> {
        self.state.lock().unwrap().loads += 1;
        Ok(Box::new(FakeOps {
            state: self.state.clone(),
        }))
    }
}

struct FakeNodeFinder {
    fail_finds: Arc<AtomicUsize>,
    calls: Arc<Mutex<Vec<bool>>>,
}

impl NodeFinder for FakeNodeFinder {
    fn find_nodes(&self, mapper_sphal: bool) -> GrallocResult<DeviceNodes> {
        self.calls.lock().unwrap().push(mapper_sphal);
        let failing = self
            .fail_finds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(GrallocError::NoUsableNode);
        }

        Ok(DeviceNodes {
            gbm_node: fake_buffer(0),
            gpu_node: Some(fake_buffer(0)),
        })
    }
}

/// Shared handle on a fake wrapper and node finder.
pub struct FakeGbm {
    state: Arc<Mutex<FakeState>>,
    /// Number of upcoming `find_nodes` calls that fail.
    pub fail_finds: Arc<AtomicUsize>,
    finder_calls: Arc<Mutex<Vec<bool>>>,
}

impl FakeGbm {
    /// R8 is always supported in addition to `supported`.
    pub fn new(supported: &[DrmFormat]) -> FakeGbm {
        let _ = env_logger::builder().is_test(true).try_init();
        let state = FakeState {
            supported: supported.to_vec(),
            ..Default::default()
        };
        FakeGbm {
            state: Arc::new(Mutex::new(state)),
            fail_finds: Arc::new(AtomicUsize::new(0)),
            finder_calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn state(&self) -> MutexGuard<FakeState> {
        self.state.lock().unwrap()
    }

    /// `mapper_sphal` of every node lookup so far.
    pub fn finder_calls(&self) -> Vec<bool> {
        self.finder_calls.lock().unwrap().clone()
    }

    pub fn backend(&self) -> Arc<GbmMesaBackend> {
        let finder = FakeNodeFinder {
            fail_finds: self.fail_finds.clone(),
            calls: self.finder_calls.clone(),
        };
        let loader = FakeLoader {
            state: self.state.clone(),
        };
        let backend = GbmMesaBuilder::new()
            .set_node_finder(Box::new(finder))
            .set_backend_loader(Box::new(loader))
            .build()
            .unwrap();
        Arc::new(backend)
    }

    pub fn driver(&self) -> (Arc<GbmMesaBackend>, Driver) {
        let backend = self.backend();
        let drv = Driver::new(backend.clone()).unwrap();
        (backend, drv)
    }
}
