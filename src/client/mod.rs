//! The `client` module is the producer side of the WebSocket API, used by
//! the `send` and `logs` subcommands.

pub mod gateway_client;
pub use gateway_client::GatewayClient;
