//! Boot integration.
//!
//! Distro detection, kernel installation into the image, EXTLINUX stage-2
//! setup, and the stage-1 boot sector write.

pub(crate) mod distro;
pub(crate) mod kernel;
pub(crate) mod loader;
pub(crate) mod mbr;

pub use distro::DistroFamily;
pub(crate) use kernel::KernelOutcome;
