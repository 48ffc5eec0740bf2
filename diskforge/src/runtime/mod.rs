//! Converter runtime: options, on-disk layout, and the public facade.

pub(crate) mod core;
pub(crate) mod layout;
pub(crate) mod options;

pub use self::core::Converter;
pub(crate) use self::core::RuntimeInner;
