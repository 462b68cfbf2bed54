//! Architecture support. This kernel targets x86_64 only; the module
//! exists so hardware touchpoints stay in one place.

pub mod x86_64;

pub use x86_64::{halt_loop, idle_once, read_tsc};
