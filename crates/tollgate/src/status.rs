//! Status codes carried by every billing response.

use serde::{Deserialize, Serialize};

/// Outcome of a billing operation.
///
/// A closed, flat set. Every response carries exactly one of these, including
/// responses the engine synthesizes itself (for example [`Status::Busy`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    /// The vendor accepted the operation but has not settled it yet.
    Pending,
    Unauthorised,
    /// Another request is in flight.
    Busy,
    UserCanceled,
    /// The active provider lost its billing backend.
    BillingUnavailable,
    /// No provider has been selected.
    NoBillingProvider,
    ServiceUnavailable,
    ItemUnavailable,
    ItemAlreadyOwned,
    UnknownError,
}

impl Status {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Pending => "pending",
            Status::Unauthorised => "unauthorised",
            Status::Busy => "busy",
            Status::UserCanceled => "user_canceled",
            Status::BillingUnavailable => "billing_unavailable",
            Status::NoBillingProvider => "no_billing_provider",
            Status::ServiceUnavailable => "service_unavailable",
            Status::ItemUnavailable => "item_unavailable",
            Status::ItemAlreadyOwned => "item_already_owned",
            Status::UnknownError => "unknown_error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}
