//! Numeric support: log-domain arithmetic and matrix algebra

pub mod linalg;
pub mod logprob;

pub use linalg::{invert, log_determinant, sanitize, solve};
pub use logprob::{is_log_zero, log_add, safe_ln, sanitize_ln, LOG_ZERO};
