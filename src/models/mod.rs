//! Data models for calls, subscriptions and call records

mod call;
mod call_record;
mod subscription;

pub use call::*;
pub use call_record::*;
pub use subscription::*;
