// src/lib.rs
//! Card-reader driven member identification and one-time entry charging
//! for the gym front desk.

pub mod backend;
pub mod charge;
pub mod config;
pub mod device;
pub mod error;
pub mod feed;
pub mod policy;
pub mod session;
pub mod types;

pub use backend::{GymBackend, HttpBackend};
pub use charge::{ChargeReceipt, ChargeRequest, ChargeState, EntryChargeCoordinator};
pub use config::{Config, ReaderConfig};
pub use error::{ApiError, ChargeError, ConfigError, LookupError, SessionError};
pub use feed::OutcomeFeed;
pub use policy::{classify, identify};
pub use session::{CardScanSession, SessionEvent, SessionEvents};
pub use types::{CardUid, EntryType, Identification, IdentificationOutcome, ScanMode};
