//! # Record Validation
//!
//! A predicate run against every record a collection is asked to post or
//! put. A rejected record raises an alert and never reaches the network.

use crate::record::Record;

/// Decides whether a record may be written to the server.
pub trait RecordValidator: Send + Sync {
    fn validate(&self, record: &Record) -> bool;
}

impl<F> RecordValidator for F
where
    F: Fn(&Record) -> bool + Send + Sync,
{
    fn validate(&self, record: &Record) -> bool {
        self(record)
    }
}

/// Accepts every record. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RecordValidator for AcceptAll {
    fn validate(&self, _record: &Record) -> bool {
        true
    }
}

/// Accepts records carrying a usable `id`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireId;

impl RecordValidator for RequireId {
    fn validate(&self, record: &Record) -> bool {
        record.id().is_some()
    }
}
