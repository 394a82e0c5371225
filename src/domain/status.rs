use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusError {
    #[error("Unknown {kind} value '{value}'")]
    Unknown { kind: &'static str, value: String },

    #[error("Invalid {kind} transition: {from} -> {to}")]
    InvalidTransition {
        kind: &'static str,
        from: &'static str,
        to: &'static str,
    },
}

/// Payment lifecycle of an order. `Paid` only regresses through an explicit refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Refunded => "refunded",
        }
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Paid) | (Self::Paid, Self::Refunded)
        )
    }

    /// Returns `Ok(None)` when already in `next` so callers can treat repeats as no-ops.
    pub fn transition(self, next: Self) -> Result<Option<Self>, StatusError> {
        if self == next {
            return Ok(None);
        }
        if self.can_transition_to(next) {
            Ok(Some(next))
        } else {
            Err(StatusError::InvalidTransition {
                kind: "payment status",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

/// Fulfillment lifecycle of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FulfillmentStatus {
    Pending,
    Confirmed,
    InPreparation,
    InTransit,
    Delivered,
    Canceled,
}

impl FulfillmentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::InPreparation => "in_preparation",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::Canceled => "canceled",
        }
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed)
                | (Self::Confirmed, Self::InPreparation)
                | (Self::InPreparation, Self::InTransit)
                | (Self::InTransit, Self::Delivered)
                | (Self::Pending | Self::Confirmed | Self::InPreparation, Self::Canceled)
        )
    }

    pub fn transition(self, next: Self) -> Result<Option<Self>, StatusError> {
        if self == next {
            return Ok(None);
        }
        if self.can_transition_to(next) {
            Ok(Some(next))
        } else {
            Err(StatusError::InvalidTransition {
                kind: "fulfillment status",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

/// State of a single gateway-mediated payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Created,
    Succeeded,
    Failed,
    Canceled,
}

impl AttemptStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Created)
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(self, Self::Created) && next.is_terminal()
    }

    /// The order payment status an attempt outcome maps to.
    pub const fn payment_status(self) -> PaymentStatus {
        match self {
            Self::Succeeded => PaymentStatus::Paid,
            Self::Created | Self::Failed | Self::Canceled => PaymentStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum PaymentMethod {
    #[serde(rename = "efectivo", alias = "cash")]
    Cash,
    #[serde(rename = "tarjeta", alias = "card")]
    Card,
}

impl PaymentMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "efectivo",
            Self::Card => "tarjeta",
        }
    }

    pub const fn requires_gateway(self) -> bool {
        match self {
            Self::Cash => false,
            Self::Card => true,
        }
    }
}

macro_rules! string_enum {
    ($ty:ty, $kind:literal, [$($variant:expr),+ $(,)?] $(, aliases: [$($alias:literal => $target:expr),*])?) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = StatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == $variant.as_str() {
                        return Ok($variant);
                    }
                )+
                $($(
                    if s == $alias {
                        return Ok($target);
                    }
                )*)?
                Err(StatusError::Unknown {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }
    };
}

string_enum!(
    PaymentStatus,
    "payment status",
    [PaymentStatus::Pending, PaymentStatus::Paid, PaymentStatus::Refunded]
);
string_enum!(
    FulfillmentStatus,
    "fulfillment status",
    [
        FulfillmentStatus::Pending,
        FulfillmentStatus::Confirmed,
        FulfillmentStatus::InPreparation,
        FulfillmentStatus::InTransit,
        FulfillmentStatus::Delivered,
        FulfillmentStatus::Canceled,
    ]
);
string_enum!(
    AttemptStatus,
    "attempt status",
    [
        AttemptStatus::Created,
        AttemptStatus::Succeeded,
        AttemptStatus::Failed,
        AttemptStatus::Canceled,
    ]
);
string_enum!(
    PaymentMethod,
    "payment method",
    [PaymentMethod::Cash, PaymentMethod::Card],
    aliases: ["cash" => PaymentMethod::Cash, "card" => PaymentMethod::Card]
);
