pub mod money;
pub mod status;

pub use money::{Currency, Money, MoneyError};
pub use status::{AttemptStatus, FulfillmentStatus, PaymentMethod, PaymentStatus, StatusError};
