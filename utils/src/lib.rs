//! Thread-level building blocks for the queued synchronizers.

pub mod park;
pub mod thread_token;
pub mod timing;

pub use park::{interrupted, park, park_timeout, park_until, self_interrupt, ThreadParker};
pub use thread_token::ThreadToken;
pub use timing::Deadline;
