//! Message types for the durable queues.
//!
//! A [`QueuedMessage`] is always in exactly one of two states: queued (a candidate for
//! delivery once its next delivery timestamp has passed) or dead letter (excluded from
//! delivery until explicitly resurrected). Acknowledging or deleting a message removes it
//! for good.

use std::{collections::HashMap, fmt};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::Error;

/// Unique id of a queued message. Assigned by the store and never reused.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct QueueEntryId(i64);

impl QueueEntryId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for QueueEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Logical partition of the shared message table.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for QueueName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for QueueName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<&QueueName> for QueueName {
    fn from(name: &QueueName) -> Self {
        name.clone()
    }
}

/// A payload type with a stable type tag.
///
/// The tag is persisted next to the serialized bytes, so it must not change once messages
/// of the type have been queued.
pub trait MessagePayload: Serialize + DeserializeOwned {
    const PAYLOAD_TYPE: &'static str;
}

/// Serialized message content plus the type tag needed to decode it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub type_name: String,
    pub data: Bytes,
}

impl Payload {
    pub fn new(type_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            type_name: type_name.into(),
            data: data.into(),
        }
    }

    /// Encode a typed payload as JSON, tagged with [`MessagePayload::PAYLOAD_TYPE`].
    pub fn of<T: MessagePayload>(value: &T) -> Result<Self, Error> {
        Self::json(T::PAYLOAD_TYPE, value)
    }

    pub fn json<T: Serialize>(type_name: impl Into<String>, value: &T) -> Result<Self, Error> {
        Ok(Self::new(type_name, serde_json::to_vec(value)?))
    }

    pub fn is<T: MessagePayload>(&self) -> bool {
        self.type_name == T::PAYLOAD_TYPE
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, Error> {
        Ok(serde_json::from_slice(&self.data)?)
    }
}

/// A message as persisted in the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: QueueEntryId,
    pub queue_name: QueueName,
    pub payload: Payload,
    pub meta_data: HashMap<String, String>,
    pub added_timestamp: DateTime<Utc>,
    /// Earliest time the message may be claimed. While a claim is held this is the lease
    /// expiry.
    pub next_delivery_timestamp: DateTime<Utc>,
    pub delivery_timestamp: Option<DateTime<Utc>>,
    /// Claims since the message was queued or last resurrected. Drives the redelivery policy.
    pub delivery_attempts: u32,
    /// Claims over the whole lifetime of the message.
    pub total_delivery_attempts: u32,
    pub redelivery_attempts: u32,
    pub last_delivery_error: Option<String>,
    pub is_being_delivered: bool,
    pub is_dead_letter_message: bool,
    pub marked_as_dead_letter_at: Option<DateTime<Utc>>,
    pub cause_of_enqueuing: Option<String>,
}

/// Ordering of message listings and of the claim scan, by message id.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum QueueingSortOrder {
    #[default]
    Asc,
    Desc,
}

impl QueueingSortOrder {
    pub(crate) fn sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessageCounts {
    pub queue_name: QueueName,
    pub number_of_queued_messages: u64,
    pub number_of_dead_letter_messages: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u32,
    }

    impl MessagePayload for OrderPlaced {
        const PAYLOAD_TYPE: &'static str = "OrderPlaced";
    }

    #[test]
    fn typed_payload_carries_its_tag() {
        let payload = Payload::of(&OrderPlaced { order_id: 42 }).unwrap();

        assert_eq!(payload.type_name, "OrderPlaced");
        assert!(payload.is::<OrderPlaced>());
        assert_eq!(
            payload.deserialize::<OrderPlaced>().unwrap(),
            OrderPlaced { order_id: 42 }
        );
    }

    #[test]
    fn undecodable_payload_is_a_serialization_error() {
        let payload = Payload::new("OrderPlaced", &b"not json"[..]);
        assert!(matches!(
            payload.deserialize::<OrderPlaced>(),
            Err(Error::Serialization { .. })
        ));
    }

    #[test]
    fn sort_order_parses() {
        assert_eq!("DESC".parse::<QueueingSortOrder>().unwrap(), QueueingSortOrder::Desc);
        assert_eq!(QueueingSortOrder::Asc.to_string(), "ASC");
        assert_eq!(QueueingSortOrder::Desc.sql(), "DESC");
    }
}
