//! Repository layer: entity-scoped database operations.
//!
//! Free functions over `&Connection`, so the same code runs inside a
//! transaction (`&Transaction` derefs to `&Connection`) or on a bare
//! connection. All public functions are re-exported here.

mod account;
mod appointment;
mod audit;
mod closed_date;
mod otp;
mod outbox;

pub use account::*;
pub use appointment::*;
pub use audit::*;
pub use closed_date::*;
pub use otp::*;
pub use outbox::*;
