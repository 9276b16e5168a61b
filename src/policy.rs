// src/policy.rs
use log::{info, warn};

use crate::backend::GymBackend;
use crate::error::LookupError;
use crate::types::{
    CardUid, Identification, IdentificationOutcome, LookupResponse, STATUS_ASSIGNED,
    STATUS_NOT_REGISTERED, STATUS_UNASSIGNED,
};

/// Maps a lookup response onto exactly one outcome.
///
/// Anything the backend is not supposed to send (an unknown status, an
/// assigned card without a positive member id) becomes `Unknown`.
pub fn classify(response: &LookupResponse) -> IdentificationOutcome {
    match response.status.as_str() {
        STATUS_NOT_REGISTERED => IdentificationOutcome::NotRegistered,
        STATUS_UNASSIGNED => IdentificationOutcome::Unassigned,
        STATUS_ASSIGNED => match response.user_id {
            Some(id) if id > 0 => IdentificationOutcome::Assigned(id as u64),
            _ => IdentificationOutcome::Unknown,
        },
        _ => IdentificationOutcome::Unknown,
    }
}

/// Parse, look up and classify one card number.
///
/// Used for reader scans and for numbers typed in by the operator alike.
pub async fn identify(backend: &dyn GymBackend, raw: &str) -> Result<Identification, LookupError> {
    let uid = CardUid::parse(raw).ok_or_else(|| LookupError::MalformedCard(raw.to_string()))?;
    let card_number = uid.card_number()?;

    let response = backend.lookup_card(card_number).await?;
    let outcome = classify(&response);

    match outcome {
        IdentificationOutcome::Unknown => {
            warn!("Card {} returned unexpected lookup response {:?}", uid, response)
        }
        _ => info!("Card {} identified as {:?}", uid, outcome),
    }

    Ok(Identification { uid, outcome })
}
