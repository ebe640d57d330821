/// Error answers.
pub mod error;
/// Bodies of the successful answers.
pub mod success;
