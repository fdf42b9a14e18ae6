//! Pure key-placement logic
//!
//! No I/O and no concurrency: the ring is a deterministic function from key
//! to node address. Callers wrap it in whatever synchronization they need.

pub mod ring;

pub use ring::Ring;
