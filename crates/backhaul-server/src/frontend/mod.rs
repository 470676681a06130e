//! Client-facing protocol adapters

pub mod http_connect;
pub mod tunnel;

pub use http_connect::{handle_connect, parse_connect_head, ConnectRequest, HeadError};
pub use tunnel::serve_tunnel_client;
