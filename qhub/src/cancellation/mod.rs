//! Cooperative cancellation for runs and stages.

mod token;

pub use token::CancellationToken;
