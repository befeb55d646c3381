pub mod parser; // Market channel payload normalization
pub mod polymarket_gamma; // Active market discovery
pub mod polymarket_ws; // Market channel listener
pub mod trades_poller; // REST fallback ingestion
pub mod ws_session; // Connection state + backoff

pub use polymarket_ws::{Listener, ListenerConfig, ListenerStats};
pub use trades_poller::TradesPoller;
pub use ws_session::ConnectionState;
