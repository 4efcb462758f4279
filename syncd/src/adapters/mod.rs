pub mod commerce_a;
pub mod commerce_b;
pub mod common;
pub mod fulfillment_f;
pub mod newsletter_n;

pub use common::{AdapterCtx, AdapterError};
