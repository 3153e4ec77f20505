// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A minigbm style graphics buffer allocator backend that delegates allocation, import and CPU
//! mapping to Mesa's GBM through a dynamically loaded wrapper library.

pub mod drv;
pub mod gbm_mesa;
mod gralloc_os;
mod gralloc_utils;
#[macro_use]
mod macros;

pub use crate::drv::Backend;
pub use crate::drv::Bo;
pub use crate::drv::BoUseFlags;
pub use crate::drv::Driver;
pub use crate::drv::DrmFormat;
pub use crate::drv::ImportFdData;
pub use crate::drv::MapFlags;
pub use crate::drv::Vma;
pub use crate::gbm_mesa::GbmMesaBackend;
pub use crate::gbm_mesa::GbmMesaBuilder;
pub use crate::gralloc_utils::*;
