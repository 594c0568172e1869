//! Room-scoped mailbox relay used by browser peers to exchange offers,
//! answers and ICE candidates by polling.
//!
//! The store is purely in-memory. Delivery is at-least-once while a record is
//! inside the retention window and best-effort afterwards.

mod clock;
mod error;
mod store;
mod sweep;

pub use clock::{Clock, ManualClock, StampClock, SystemClock};
pub use error::MailboxError;
pub use store::{MailboxSettings, MailboxStore, StoreStats};
pub use sweep::{SweepReport, Sweeper};
