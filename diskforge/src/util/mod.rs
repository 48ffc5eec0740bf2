//! Small shared helpers.

pub(crate) mod process;
