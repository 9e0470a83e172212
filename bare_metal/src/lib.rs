#![cfg_attr(not(test), no_std)]
//! Low-level building blocks shared by the kernel crates: address newtypes,
//! alignment helpers and the few CPU instructions needed during early boot.

mod align;
mod addr;

pub mod cpu;

pub use self::align::*;
pub use self::addr::*;
