//! Typed identifiers for every entity the core persists.
//!
//! Each id wraps a [`Uuid`] so repository signatures can't mix up, say, a
//! `MessageId` and a `WebhookId` at the call site.

use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            Deserialize,
            Serialize,
            From,
            Display,
            Deref,
            FromStr,
            sqlx::Type,
        )]
        #[sqlx(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

typed_id!(TenantId);
typed_id!(DomainId);
typed_id!(MessageId);
typed_id!(SuppressionId);
typed_id!(WebhookId);
typed_id!(WebhookDeliveryId);
