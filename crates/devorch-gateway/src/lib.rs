//! devorch gateway - live state over WebSocket, control over REST
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ ┌──────────┐ ┌──────────┐
//! │ Web UI   │ │ devorch  │ │ scripts  │
//! │ (ws)     │ │ tail(ws) │ │ (REST)   │
//! └────┬─────┘ └────┬─────┘ └────┬─────┘
//!      └────────────┼────────────┘
//!          ┌────────▼─────────┐
//!          │  Gateway router  │
//!          └───┬──────────┬───┘
//!     ┌────────▼───┐  ┌───▼──────────┐
//!     │ Observer   │  │ Orchestrator │
//!     │ hub        │◄─┤ state store  │
//!     └────────────┘  └──────────────┘
//! ```
//!
//! Every observer gets a full `state` snapshot on connect, then every delta
//! in version order. A slow observer is resynced with a fresh snapshot
//! instead of slowing everyone else down.

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod protocol;

pub use client::{GatewayClient, GatewayConnection};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayState};
pub use hub::{ObserverHub, ObserverId};
pub use protocol::{ClientFrame, ClientMessage, Reply, RunCommand, ServerFrame};

/// Gateway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default HTTP and WebSocket port
pub const DEFAULT_PORT: u16 = 8766;

/// Default host
pub const DEFAULT_HOST: &str = "127.0.0.1";
