//! Domain layer: payment intents, requests, correlation data and the ports
//! through which the engine reaches payment providers.

pub mod context;
pub mod failure;
pub mod intent;
pub mod ports;
pub mod request;
