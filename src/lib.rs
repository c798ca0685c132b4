//! diskferry library
//!
//! Sparse-aware disk image transfer over the imageio wire API: extent
//! planning, backend negotiation, a pooled transfer scheduler, and block
//! checksums, with qemu tooling behind a narrow seam for non-raw formats.

pub mod backend;
pub mod checksum;
pub mod client;
pub mod error;
pub mod extent;
pub mod http;
pub mod logger;
#[cfg(unix)]
pub mod nbd;
pub mod ova;
pub mod plan;
pub mod progress;
pub mod qemu;
pub mod scheduler;
pub mod source;
pub mod tls;
pub mod url;

pub use client::{
    checksum as image_checksum, default_connections, download, info, measure, upload,
    DownloadOptions, ImageDetails, MeasureDetails, UploadOptions,
};
pub use error::{Error, Result};
