//! Raw disk image construction.
//!
//! Allocation, partitioning, filesystem creation, and the mount syscalls
//! for the build window. Loop device handling lives in `crate::loopdev`.

pub(crate) mod allocate;
pub(crate) mod format;
pub(crate) mod mount;
pub(crate) mod partition;

pub use format::FilesystemKind;
pub(crate) use partition::PartitionTable;
