// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! wrapper: Binding to the GBM wrapper library.
//!
//! The wrapper is a small shared library linked against Mesa's libgbm.  It exports a single
//! entry point returning a table of C functions; everything the backend does with GBM goes
//! through that table.

use std::os::raw::c_int;
use std::os::raw::c_void;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::BorrowedFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::OwnedFd;
use std::ptr::null_mut;
use std::ptr::NonNull;

use libloading::os::unix::Library as UnixLibrary;
use libloading::os::unix::RTLD_NOW;
use libloading::Library;
use libloading::Symbol;
use log::error;

use crate::drv::DrmFormat;
use crate::gralloc_utils::GrallocError;
use crate::gralloc_utils::GrallocResult;

/// Default file name of the wrapper library.
pub const GBM_WRAPPER_LIBRARY: &str = "libgbm_mesa_wrapper.so";
/// Default name of the symbol returning the operation table.
pub const GBM_WRAPPER_SYMBOL: &str = "get_gbm_ops";

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct gbm_device {
    _unused: [u8; 0],
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct gbm_bo {
    _unused: [u8; 0],
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct alloc_args {
    pub gbm: *mut gbm_device,
    pub width: c_int,
    pub height: c_int,
    pub drm_format: u32,
    pub force_linear: bool,
    pub needs_map_stride: bool,
    pub use_scanout: bool,
    pub out_fd: c_int,
    pub out_stride: u32,
    pub out_map_stride: u32,
    pub out_modifier: u64,
}

#[repr(C)]
#[allow(non_camel_case_types)]
pub struct gbm_ops {
    pub dev_create: Option<unsafe extern "C" fn(fd: c_int) -> *mut gbm_device>,
    pub dev_destroy: Option<unsafe extern "C" fn(gbm: *mut gbm_device)>,
    pub get_gbm_format: Option<unsafe extern "C" fn(drm_format: u32) -> u32>,
    pub alloc: Option<unsafe extern "C" fn(args: *mut alloc_args) -> c_int>,
    pub import: Option<
        unsafe extern "C" fn(
            gbm: *mut gbm_device,
            buf_fd: c_int,
            width: u32,
            height: u32,
            stride: u32,
            modifier: u64,
            drm_format: u32,
        ) -> *mut gbm_bo,
    >,
    pub free: Option<unsafe extern "C" fn(bo: *mut gbm_bo)>,
    pub map: Option<
        unsafe extern "C" fn(
            bo: *mut gbm_bo,
            width: c_int,
            height: c_int,
            addr: *mut *mut c_void,
            map_data: *mut *mut c_void,
        ),
    >,
    pub unmap: Option<unsafe extern "C" fn(bo: *mut gbm_bo, map_data: *mut c_void)>,
}

/// Opaque GBM device handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GbmDevice(NonNull<c_void>);

impl GbmDevice {
    pub fn from_raw(ptr: *mut c_void) -> Option<GbmDevice> {
        NonNull::new(ptr).map(GbmDevice)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Opaque GBM buffer handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GbmBo(NonNull<c_void>);

impl GbmBo {
    pub fn from_raw(ptr: *mut c_void) -> Option<GbmBo> {
        NonNull::new(ptr).map(GbmBo)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Parameters of a single backend allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct AllocRequest {
    pub width: u32,
    pub height: u32,
    pub drm_format: DrmFormat,
    pub force_linear: bool,
    pub needs_map_stride: bool,
    pub use_scanout: bool,
}

/// What the backend reports for a successful allocation.
#[derive(Debug)]
pub struct AllocOutput {
    pub fd: OwnedFd,
    pub stride: u32,
    pub map_stride: u32,
    pub modifier: u64,
}

/// Parameters for wrapping an existing dma-buf into a backend buffer.
#[derive(Copy, Clone, Debug)]
pub struct ImportRequest<'a> {
    pub fd: BorrowedFd<'a>,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub modifier: u64,
    pub drm_format: DrmFormat,
}

/// A live CPU mapping of a backend buffer.
#[derive(Copy, Clone, Debug)]
pub struct Mapping {
    pub addr: *mut c_void,
    /// Passed back to `GbmOps::unmap`.
    pub map_data: NonNull<c_void>,
}

/// Operations of the GBM wrapper.
pub trait GbmOps: Send + Sync {
    fn dev_create(&self, fd: BorrowedFd<'_>) -> Option<GbmDevice>;

    fn dev_destroy(&self, gbm: GbmDevice);

    /// Returns the GBM format matching `format`, or 0 if GBM has none.
    fn get_gbm_format(&self, format: DrmFormat) -> u32;

    fn alloc(&self, gbm: GbmDevice, req: &AllocRequest) -> GrallocResult<AllocOutput>;

    fn import(&self, gbm: GbmDevice, req: &ImportRequest) -> Option<GbmBo>;

    fn free(&self, bo: GbmBo);

    fn map(&self, bo: GbmBo, width: u32, height: u32) -> GrallocResult<Mapping>;

    fn unmap(&self, bo: GbmBo, map_data: NonNull<c_void>);

    fn supports_format(&self, format: DrmFormat) -> bool {
        self.get_gbm_format(format) != 0
    }
}

type DevCreateFn = unsafe extern "C" fn(c_int) -> *mut gbm_device;
type DevDestroyFn = unsafe extern "C" fn(*mut gbm_device);
type GetGbmFormatFn = unsafe extern "C" fn(u32) -> u32;
type AllocFn = unsafe extern "C" fn(*mut alloc_args) -> c_int;
type ImportFn =
    unsafe extern "C" fn(*mut gbm_device, c_int, u32, u32, u32, u64, u32) -> *mut gbm_bo;
type FreeFn = unsafe extern "C" fn(*mut gbm_bo);
type MapFn = unsafe extern "C" fn(*mut gbm_bo, c_int, c_int, *mut *mut c_void, *mut *mut c_void);
type UnmapFn = unsafe extern "C" fn(*mut gbm_bo, *mut c_void);

// Copy of a `gbm_ops` table with every entry checked to be present.
#[derive(Copy, Clone)]
struct GbmOpsTable {
    dev_create: DevCreateFn,
    dev_destroy: DevDestroyFn,
    get_gbm_format: GetGbmFormatFn,
    alloc: AllocFn,
    import: ImportFn,
    free: FreeFn,
    map: MapFn,
    unmap: UnmapFn,
}

impl GbmOpsTable {
    fn new(ops: &gbm_ops) -> GrallocResult<GbmOpsTable> {
        Ok(GbmOpsTable {
            dev_create: ops
                .dev_create
                .ok_or(GrallocError::BackendIncomplete("dev_create"))?,
            dev_destroy: ops
                .dev_destroy
                .ok_or(GrallocError::BackendIncomplete("dev_destroy"))?,
            get_gbm_format: ops
                .get_gbm_format
                .ok_or(GrallocError::BackendIncomplete("get_gbm_format"))?,
            alloc: ops.alloc.ok_or(GrallocError::BackendIncomplete("alloc"))?,
            import: ops.import.ok_or(GrallocError::BackendIncomplete("import"))?,
            free: ops.free.ok_or(GrallocError::BackendIncomplete("free"))?,
            map: ops.map.ok_or(GrallocError::BackendIncomplete("map"))?,
            unmap: ops.unmap.ok_or(GrallocError::BackendIncomplete("unmap"))?,
        })
    }
}

/// `GbmOps` implemented by calling into a wrapper operation table.
pub struct WrapperGbmOps {
    table: GbmOpsTable,
    // Keeps the code behind `table` loaded.  Dropped after `table`.
    _library: Option<Library>,
}

impl WrapperGbmOps {
    /// Uses the table of a wrapper linked into the process.
    pub fn from_static(ops: &'static gbm_ops) -> GrallocResult<WrapperGbmOps> {
        Ok(WrapperGbmOps {
            table: GbmOpsTable::new(ops)?,
            _library: None,
        })
    }

    /// Opens `library` and fetches the operation table through `symbol`.
    pub fn load(library: &str, symbol: &str) -> GrallocResult<WrapperGbmOps> {
        // Safe because the wrapper library has no initialization preconditions.
        let lib: Library = unsafe { UnixLibrary::open(Some(library), RTLD_NOW) }
            .map_err(|source| GrallocError::BackendLibrary {
                name: library.to_string(),
                source,
            })?
            .into();

        let table = {
            // Safe because the entry point takes no arguments and returns a pointer to a
            // table with static storage in the library.
            let get_gbm_ops: Symbol<unsafe extern "C" fn() -> *const gbm_ops> =
                unsafe { lib.get(symbol.as_bytes()) }.map_err(|source| {
                    GrallocError::BackendSymbol {
                        name: symbol.to_string(),
                        source,
                    }
                })?;

            // Safe because the table outlives this block; `lib` stays loaded.
            let ops = unsafe { get_gbm_ops().as_ref() }.ok_or(GrallocError::BackendNoOps)?;
            GbmOpsTable::new(ops)?
        };

        Ok(WrapperGbmOps {
            table,
            _library: Some(lib),
        })
    }
}

// Safe because the table only holds function pointers and the wrapper functions themselves
// may be called from any thread.
unsafe impl Send for WrapperGbmOps {}
unsafe impl Sync for WrapperGbmOps {}

// Safe to call the table entries below because `GbmOpsTable::new` checked all of them and
// `_library` keeps them loaded for the lifetime of `self`.
impl GbmOps for WrapperGbmOps {
    fn dev_create(&self, fd: BorrowedFd<'_>) -> Option<GbmDevice> {
        let gbm = unsafe { (self.table.dev_create)(fd.as_raw_fd()) };
        GbmDevice::from_raw(gbm as *mut c_void)
    }

    fn dev_destroy(&self, gbm: GbmDevice) {
        unsafe { (self.table.dev_destroy)(gbm.as_ptr() as *mut gbm_device) }
    }

    fn get_gbm_format(&self, format: DrmFormat) -> u32 {
        unsafe { (self.table.get_gbm_format)(format.0) }
    }

    fn alloc(&self, gbm: GbmDevice, req: &AllocRequest) -> GrallocResult<AllocOutput> {
        let mut args = alloc_args {
            gbm: gbm.as_ptr() as *mut gbm_device,
            width: req.width.try_into()?,
            height: req.height.try_into()?,
            drm_format: req.drm_format.0,
            force_linear: req.force_linear,
            needs_map_stride: req.needs_map_stride,
            use_scanout: req.use_scanout,
            out_fd: -1,
            out_stride: 0,
            out_map_stride: 0,
            out_modifier: 0,
        };

        let ret = unsafe { (self.table.alloc)(&mut args) };
        if ret != 0 {
            return Err(GrallocError::ComponentError(ret));
        }

        if args.out_fd < 0 {
            error!("backend allocation succeeded without a buffer descriptor");
            return Err(GrallocError::ComponentError(-libc::EINVAL));
        }

        Ok(AllocOutput {
            // Safe because on success the wrapper hands ownership of `out_fd` to the caller.
            fd: unsafe { OwnedFd::from_raw_fd(args.out_fd) },
            stride: args.out_stride,
            map_stride: args.out_map_stride,
            modifier: args.out_modifier,
        })
    }

    fn import(&self, gbm: GbmDevice, req: &ImportRequest) -> Option<GbmBo> {
        let bo = unsafe {
            (self.table.import)(
                gbm.as_ptr() as *mut gbm_device,
                req.fd.as_raw_fd(),
                req.width,
                req.height,
                req.stride,
                req.modifier,
                req.drm_format.0,
            )
        };
        GbmBo::from_raw(bo as *mut c_void)
    }

    fn free(&self, bo: GbmBo) {
        unsafe { (self.table.free)(bo.as_ptr() as *mut gbm_bo) }
    }

    fn map(&self, bo: GbmBo, width: u32, height: u32) -> GrallocResult<Mapping> {
        let mut addr: *mut c_void = libc::MAP_FAILED;
        let mut map_data: *mut c_void = null_mut();
        unsafe {
            (self.table.map)(
                bo.as_ptr() as *mut gbm_bo,
                width.try_into()?,
                height.try_into()?,
                &mut addr,
                &mut map_data,
            )
        };

        if addr.is_null() || addr == libc::MAP_FAILED {
            return Err(GrallocError::MappingFailed);
        }

        let map_data = NonNull::new(map_data).ok_or(GrallocError::MappingFailed)?;
        Ok(Mapping { addr, map_data })
    }

    fn unmap(&self, bo: GbmBo, map_data: NonNull<c_void>) {
        unsafe { (self.table.unmap)(bo.as_ptr() as *mut gbm_bo, map_data.as_ptr()) }
    }
}

/// Produces the wrapper operations.  Called once per device context.
pub trait BackendLoader: Send + Sync {
    fn load(&self) -> GrallocResult<Box<dyn GbmOps>>;
}

/// Loads the wrapper from a shared library.
pub struct DlBackendLoader {
    library: String,
    symbol: String,
}

impl DlBackendLoader {
    pub fn new(library: &str, symbol: &str) -> DlBackendLoader {
        DlBackendLoader {
            library: library.to_string(),
            symbol: symbol.to_string(),
        }
    }
}

impl Default for DlBackendLoader {
    fn default() -> DlBackendLoader {
        DlBackendLoader::new(GBM_WRAPPER_LIBRARY, GBM_WRAPPER_SYMBOL)
    }
}

impl BackendLoader for DlBackendLoader {
    fn load(&self) -> GrallocResult<Box<dyn GbmOps>> {
        let ops = WrapperGbmOps::load(&self.library, &self.symbol).map_err(|e| {
            error!("Failed to load {}: {}", self.library, e);
            e
        })?;
        Ok(Box::new(ops))
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CStr;
    use std::os::unix::io::AsFd;
    use std::os::unix::io::IntoRawFd;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use nix::sys::memfd::memfd_create;
    use nix::sys::memfd::MFdFlags;
    use nix::unistd::ftruncate;

    use super::*;
    use crate::gralloc_os::descriptor_size;

    static FREED: AtomicUsize = AtomicUsize::new(0);
    static mut MAPPED: [u8; 64] = [0; 64];

    unsafe extern "C" fn test_dev_create(fd: c_int) -> *mut gbm_device {
        if fd < 0 {
            null_mut()
        } else {
            0x1000 as *mut gbm_device
        }
    }

    unsafe extern "C" fn test_dev_destroy(_gbm: *mut gbm_device) {}

    unsafe extern "C" fn test_get_gbm_format(drm_format: u32) -> u32 {
        if drm_format == DrmFormat::R8.0 {
            drm_format
        } else {
            0
        }
    }

    unsafe extern "C" fn test_alloc(args: *mut alloc_args) -> c_int {
        let args = &mut *args;
        if args.drm_format != DrmFormat::R8.0 {
            return -libc::ENOSYS;
        }

        let name = CStr::from_bytes_with_nul(b"wrapper-test\0").unwrap();
        let fd = memfd_create(name, MFdFlags::MFD_CLOEXEC).unwrap();
        ftruncate(&fd, (args.width * args.height) as i64).unwrap();
        args.out_fd = fd.into_raw_fd();
        args.out_stride = args.width as u32;
        args.out_map_stride = if args.needs_map_stride { 64 } else { 0 };
        args.out_modifier = if args.force_linear { 0 } else { 7 };
        0
    }

    unsafe extern "C" fn test_import(
        _gbm: *mut gbm_device,
        _buf_fd: c_int,
        _width: u32,
        _height: u32,
        _stride: u32,
        _modifier: u64,
        _drm_format: u32,
    ) -> *mut gbm_bo {
        0x2000 as *mut gbm_bo
    }

    unsafe extern "C" fn test_free(_bo: *mut gbm_bo) {
        FREED.fetch_add(1, Ordering::SeqCst);
    }

    unsafe extern "C" fn test_map(
        _bo: *mut gbm_bo,
        _width: c_int,
        height: c_int,
        addr: *mut *mut c_void,
        map_data: *mut *mut c_void,
    ) {
        if height == 0 {
            return;
        }
        *addr = std::ptr::addr_of_mut!(MAPPED) as *mut c_void;
        *map_data = 0x3000 as *mut c_void;
    }

    unsafe extern "C" fn test_unmap(_bo: *mut gbm_bo, _map_data: *mut c_void) {}

    static TEST_OPS: gbm_ops = gbm_ops {
        dev_create: Some(test_dev_create),
        dev_destroy: Some(test_dev_destroy),
        get_gbm_format: Some(test_get_gbm_format),
        alloc: Some(test_alloc),
        import: Some(test_import),
        free: Some(test_free),
        map: Some(test_map),
        unmap: Some(test_unmap),
    };

    static INCOMPLETE_OPS: gbm_ops = gbm_ops {
        dev_create: Some(test_dev_create),
        dev_destroy: Some(test_dev_destroy),
        get_gbm_format: Some(test_get_gbm_format),
        alloc: Some(test_alloc),
        import: Some(test_import),
        free: None,
        map: Some(test_map),
        unmap: Some(test_unmap),
    };

    #[test]
    fn incomplete_table_is_rejected() {
        let result = WrapperGbmOps::from_static(&INCOMPLETE_OPS);
        assert!(matches!(result, Err(GrallocError::BackendIncomplete("free"))));
    }

    #[test]
    fn missing_library() {
        let loader = DlBackendLoader::new("libgbm_mesa_wrapper_missing.so", GBM_WRAPPER_SYMBOL);
        assert!(matches!(
            loader.load(),
            Err(GrallocError::BackendLibrary { .. })
        ));
    }

    #[test]
    fn table_calls() {
        let ops = WrapperGbmOps::from_static(&TEST_OPS).unwrap();
        let node = memfd_create(
            CStr::from_bytes_with_nul(b"node\0").unwrap(),
            MFdFlags::MFD_CLOEXEC,
        )
        .unwrap();
        let gbm = ops.dev_create(node.as_fd()).unwrap();

        assert!(ops.supports_format(DrmFormat::R8));
        assert!(!ops.supports_format(DrmFormat::BGR888));

        let mut req = AllocRequest {
            width: 4096,
            height: 2,
            drm_format: DrmFormat::R8,
            force_linear: true,
            needs_map_stride: false,
            use_scanout: false,
        };
        let out = ops.alloc(gbm, &req).unwrap();
        assert_eq!(out.stride, 4096);
        assert_eq!(out.map_stride, 0);
        assert_eq!(out.modifier, 0);
        assert_eq!(descriptor_size(out.fd.as_fd()).unwrap(), 8192);

        req.drm_format = DrmFormat::BGR888;
        assert!(matches!(
            ops.alloc(gbm, &req),
            Err(GrallocError::ComponentError(e)) if e == -libc::ENOSYS
        ));

        let bo = ops
            .import(
                gbm,
                &ImportRequest {
                    fd: out.fd.as_fd(),
                    width: 4096,
                    height: 2,
                    stride: 4096,
                    modifier: 0,
                    drm_format: DrmFormat::R8,
                },
            )
            .unwrap();

        let mapping = ops.map(bo, 4096, 2).unwrap();
        assert!(!mapping.addr.is_null());
        ops.unmap(bo, mapping.map_data);
        assert!(matches!(
            ops.map(bo, 4096, 0),
            Err(GrallocError::MappingFailed)
        ));

        let freed = FREED.load(Ordering::SeqCst);
        ops.free(bo);
        assert_eq!(FREED.load(Ordering::SeqCst), freed + 1);
        ops.dev_destroy(gbm);
    }
}
