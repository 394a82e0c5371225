pub mod audit;
pub mod confirmation;
pub mod notifications;
pub mod orchestrator;
pub mod webhook;
