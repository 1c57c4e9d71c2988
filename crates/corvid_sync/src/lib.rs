#![cfg_attr(not(test), no_std)]

mod guard;
mod relax;
mod spin;

pub use guard::SpinGuard;
pub use relax::{LoopRelax, Relax, SpinRelax};
pub use spin::Spin;
