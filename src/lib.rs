#![cfg_attr(not(test), no_std)]

//! The kernel memory subsystem: reference-counted physical page frames,
//! kernel linear-address ranges, page-table mappings and the slab, all
//! bootstrapped from the firmware memory map.

pub mod mem;
