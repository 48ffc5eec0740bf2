//! Diskforge - container filesystems to BIOS-bootable disk images
//!
//! Takes an exported container filesystem tree (or tarball) and produces a
//! raw disk image that boots under BIOS: one MBR-partitioned disk with a
//! single bootable root partition, a kernel installed for known distro
//! families, and the extlinux bootloader wired up.
//!
//! ## Architecture
//!
//! ```text
//! Converter (facade)
//!   └─ RuntimeInner (shared state: options, layout, jobs, loop pool)
//!        └─ convert::run_job — one pipeline per job
//!             export → allocate → partition → format → mount
//!                    → populate → kernel → bootloader → finalize
//! ```
//!
//! This crate is organized into focused modules:
//! - `runtime`: public facade, options, and the on-disk home layout
//! - `convert`: the conversion pipeline tasks and their shared context
//! - `pipeline`: generic sequential task execution framework
//! - `disk`: image allocation, partitioning, formatting, mount plumbing
//! - `loopdev`: bounded loop device pool
//! - `boot`: distro detection, kernel install, extlinux, MBR boot code
//! - `rootfs`: filesystem tree copy preserving ownership, modes, mtimes
//! - `guard`: rollback of partially-built resources on failure
//! - `artifacts`: image digests, manifests, listing and cleanup
//!
//! ## Example
//!
//! ```ignore
//! use diskforge::{Converter, ConvertRequest};
//!
//! #[tokio::main]
//! async fn main() -> diskforge::DiskforgeResult<()> {
//!     let converter = Converter::with_defaults()?;
//!     let result = converter
//!         .convert(ConvertRequest::new("./rootfs-export"))
//!         .await?;
//!     println!("{}", result.message);
//!     Ok(())
//! }
//! ```

mod artifacts;
mod boot;
mod convert;
mod disk;
mod errors;
mod guard;
mod job;
mod logging;
mod loopdev;
mod pipeline;
mod preflight;
mod rootfs;
mod runtime;
mod source;
mod util;

pub use artifacts::{ArtifactEntry, ArtifactManifest};
pub use boot::DistroFamily;
pub use convert::{
    ConversionResult, ConvertRequest, DEFAULT_DISK_SIZE_MB, DEFAULT_OUTPUT_FILENAME,
};
pub use disk::FilesystemKind;
pub use errors::{DiskforgeError, DiskforgeResult, ErrorDetail};
pub use job::{JobId, JobSnapshot, JobStage, JobStatus};
pub use runtime::Converter;
pub use runtime::options::{ExhaustPolicy, RuntimeOptions};
pub use source::{LocalSource, SourceProvider};

pub(crate) use logging::init_logging_for;
