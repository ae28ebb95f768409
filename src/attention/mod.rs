//! Attention implementations.
//!
//! This module contains:
//! - The blockwise online-softmax fold ([`flash`]) used at every ring step
//! - The full-sequence reference path ([`full`]) for single-rank runs
//! - The ring orchestrator ([`ring`]) that rotates K/V shards across ranks

pub mod flash;
pub mod full;
pub mod ring;

pub use flash::SoftmaxState;
pub use full::full_attention;
pub use ring::{ring_flash_attention, RingFlashParams};
