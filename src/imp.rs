// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Device backends.
//!
//! The loader only depends on [crate::device::Device]; backends live here and are selected by
//! cargo feature.  At the moment we ship the software backend.

#[cfg(feature = "backend_software")]
pub mod software;
