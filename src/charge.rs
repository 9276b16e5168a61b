// src/charge.rs
use std::num::NonZeroU32;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use log::{info, warn};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;

use crate::backend::GymBackend;
use crate::error::ChargeError;
use crate::session::{SessionEvent, SessionEvents};
use crate::types::{
    EntryType, Identification, IdentificationOutcome, UNREGISTERED_USER_ID, UserId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeEndpoint {
    Registered,
    Unregistered,
}

impl ChargeEndpoint {
    pub fn path(&self) -> &'static str {
        match self {
            ChargeEndpoint::Registered => "/user-one-time-entries",
            ChargeEndpoint::Unregistered => "/user-one-time-entries/unregistered",
        }
    }
}

/// Who the entry is charged to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeTarget {
    Member(UserId),
    /// Card not linked to a member yet; the backend links it later by number.
    Unregistered { card_number: String },
}

/// Body of POST /user-one-time-entries[/unregistered]
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OneTimeEntryPayload {
    #[serde(rename = "userID")]
    pub user_id: i64,
    #[serde(rename = "oneTimeEntryID")]
    pub one_time_entry_id: u32,
    #[serde(rename = "purchaseDate")]
    pub purchase_date: NaiveDate,
    #[serde(rename = "isUsed")]
    pub is_used: bool,
    #[serde(
        rename = "customPrice",
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub custom_price: Option<Decimal>,
    #[serde(rename = "cardNumber", skip_serializing_if = "Option::is_none")]
    pub card_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    pub target: ChargeTarget,
    pub entry_type: EntryType,
    pub count: NonZeroU32,
    /// Only ever set for `EntryType::Manual`.
    pub unit_price: Option<Decimal>,
}

impl ChargeRequest {
    pub fn for_identification(
        identification: &Identification,
        entry_type: EntryType,
        count: u32,
        unit_price: Option<Decimal>,
    ) -> Result<Self, ChargeError> {
        let target = match identification.outcome {
            IdentificationOutcome::Assigned(user_id) => ChargeTarget::Member(user_id),
            IdentificationOutcome::NotRegistered | IdentificationOutcome::Unassigned => {
                ChargeTarget::Unregistered {
                    card_number: identification.uid.as_str().to_string(),
                }
            }
            IdentificationOutcome::Unknown => return Err(ChargeError::Unidentified),
        };

        let count = NonZeroU32::new(count).ok_or(ChargeError::InvalidCount)?;

        let unit_price = match entry_type {
            // Manual entries without a price are recorded as free
            EntryType::Manual => Some(unit_price.unwrap_or(Decimal::ZERO)),
            EntryType::Standard | EntryType::Student => None,
        };

        Ok(Self {
            target,
            entry_type,
            count,
            unit_price,
        })
    }

    pub fn endpoint(&self) -> ChargeEndpoint {
        match self.target {
            ChargeTarget::Member(_) => ChargeEndpoint::Registered,
            ChargeTarget::Unregistered { .. } => ChargeEndpoint::Unregistered,
        }
    }

    pub fn payload(&self, purchase_date: NaiveDate) -> OneTimeEntryPayload {
        let (user_id, card_number) = match &self.target {
            ChargeTarget::Member(id) => (*id as i64, None),
            ChargeTarget::Unregistered { card_number } => {
                (UNREGISTERED_USER_ID, Some(card_number.clone()))
            }
        };

        OneTimeEntryPayload {
            user_id,
            one_time_entry_id: self.entry_type.id(),
            purchase_date,
            is_used: false,
            custom_price: self.unit_price,
            card_number,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeState {
    Idle,
    AwaitingIdentification,
    Charging,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChargeReceipt {
    pub request: ChargeRequest,
    /// Whatever the backend returned for the created entries.
    pub record: Value,
}

/// One identify-then-charge attempt. Submits at most once; build a new
/// coordinator for the next attempt.
pub struct EntryChargeCoordinator {
    backend: Arc<dyn GymBackend>,
    state: ChargeState,
    today: fn() -> NaiveDate,
}

fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}

impl EntryChargeCoordinator {
    pub fn new(backend: Arc<dyn GymBackend>) -> Self {
        Self {
            backend,
            state: ChargeState::Idle,
            today: utc_today,
        }
    }

    pub fn with_clock(mut self, today: fn() -> NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn state(&self) -> ChargeState {
        self.state
    }

    /// Waits for the next event of a scan session and charges it.
    pub async fn charge_next_scan(
        &mut self,
        events: &mut SessionEvents,
        entry_type: EntryType,
        count: u32,
        unit_price: Option<Decimal>,
    ) -> Result<ChargeReceipt, ChargeError> {
        if self.state != ChargeState::Idle {
            return Err(ChargeError::AttemptFinished);
        }
        self.state = ChargeState::AwaitingIdentification;

        let identification = match events.next().await {
            Some(SessionEvent::Identified(identification)) => identification,
            Some(SessionEvent::LookupFailed { error, .. }) => return self.fail(error.into()),
            Some(SessionEvent::ConnectionLost { reason }) => {
                return self.fail(ChargeError::ConnectionLost(reason));
            }
            None => return self.fail(ChargeError::ConnectionLost("session closed".into())),
        };

        self.submit(&identification, entry_type, count, unit_price)
            .await
    }

    pub async fn charge_for_outcome(
        &mut self,
        identification: &Identification,
        entry_type: EntryType,
        count: u32,
        unit_price: Option<Decimal>,
    ) -> Result<ChargeReceipt, ChargeError> {
        match self.state {
            ChargeState::Idle | ChargeState::AwaitingIdentification => {}
            _ => return Err(ChargeError::AttemptFinished),
        }
        self.submit(identification, entry_type, count, unit_price)
            .await
    }

    async fn submit(
        &mut self,
        identification: &Identification,
        entry_type: EntryType,
        count: u32,
        unit_price: Option<Decimal>,
    ) -> Result<ChargeReceipt, ChargeError> {
        let request = match ChargeRequest::for_identification(
            identification,
            entry_type,
            count,
            unit_price,
        ) {
            Ok(request) => request,
            Err(err) => return self.fail(err),
        };

        self.state = ChargeState::Charging;
        let payload = request.payload((self.today)());
        let endpoint = request.endpoint();

        match self
            .backend
            .create_one_time_entries(endpoint, request.count.get(), &payload)
            .await
        {
            Ok(record) => {
                info!(
                    "Charged {} x {:?} for card {} via {}",
                    request.count,
                    entry_type,
                    identification.uid,
                    endpoint.path()
                );
                self.state = ChargeState::Succeeded;
                Ok(ChargeReceipt { request, record })
            }
            Err(err) => self.fail(ChargeError::Rejected(err)),
        }
    }

    fn fail<T>(&mut self, err: ChargeError) -> Result<T, ChargeError> {
        warn!("Charge attempt failed: {}", err);
        self.state = ChargeState::Failed;
        Err(err)
    }
}
