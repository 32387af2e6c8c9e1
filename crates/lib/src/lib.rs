//! # Multi-boot ROM switching
//!
//! This crate implements integrity-verified flashing of the boot (and
//! whitelisted firmware) images belonging to one of several bootable
//! system installations sharing a device. Images are only ever written
//! to a block device after their content has been proven to match a
//! digest recorded in the persistent checksum store, and the bytes that
//! were verified are exactly the bytes that get written.

pub mod checksums;
pub mod lsm;
pub mod roms;
pub mod switcher;

// Re-export blockdev crate for internal use
pub(crate) use romswitch_blockdev as blockdev;
