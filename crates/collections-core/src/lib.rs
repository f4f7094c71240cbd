//! Shared domain types, error taxonomy, clock, paths, config, and logging
//! used by every `novotechno-collections` component and binary.

pub mod atomic_file;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod ids;
pub mod invoice;
pub mod paths;
pub mod logging;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use error::{Classify, ErrorKind, IoKindError};
pub use invoice::{
    ClientId, Invoice, InvoiceKey, InvoiceNumber, InvoiceStatus, Payment, ReminderLogEntry,
    ReminderOutcome,
};
pub use paths::StateRoot;
