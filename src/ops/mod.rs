//! Per-operation forward kernels and Jacobian-vector products.
//!
//! These are pure functions over tensors; [`crate::node::Node`] owns the
//! bookkeeping (outputs, accumulators, caches) and calls into them.

pub mod elementwise;
pub mod loss;
pub mod product;
pub mod softmax;
