//! Concurrency primitives shared by the transfer paths: a closable counting
//! gate bounding in-flight part operations, and the sliding reassembly
//! window that turns out-of-order part completions into an in-order stream.

pub(crate) mod gate;
pub(crate) mod window;
