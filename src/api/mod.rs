pub mod gateway;
pub mod stripe;

pub use gateway::{CreateIntent, GatewayError, IntentStatus, PaymentGateway, PaymentIntent};
pub use stripe::StripeGateway;
