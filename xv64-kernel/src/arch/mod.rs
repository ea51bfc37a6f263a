//! Machine support for the kernel core.

pub mod x86;
