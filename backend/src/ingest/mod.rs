//! File handling stages that run before and inside the queue: file validation,
//! chunking, and the per-row checks applied by workers.

pub mod chunker;
pub mod rows;
pub mod validator;
