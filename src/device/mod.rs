//! Accelerator-side plumbing: memory, completion tokens and the command queue.
//!
//! The device executes commands asynchronously. The host only ever enqueues
//! work and names the tokens it depends on; it blocks solely in
//! [`CommandQueue::drain`] or [`Event::wait`].

pub mod event;
pub mod memory;
pub mod queue;

pub use event::{Event, EventProfile, EventStatus};
pub use memory::{AlignedHostBuffer, DDR_BANK_COUNT, Device, DeviceBuffer, MemoryBank};
pub use queue::CommandQueue;
