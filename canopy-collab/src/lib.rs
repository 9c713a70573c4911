//! # canopy-collab: network plumbing for canopy sessions
//!
//! Carries replica updates and presence between peers through a relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐    WebSocket     ┌──────────────┐
//! │  SyncClient  │ ◄──────────────► │  SyncServer  │
//! │  (per peer)  │  JSON / binary   │   (relay)    │
//! └──────┬───────┘                  └──────┬───────┘
//!        │ SyncEvent                       │
//!        ▼                                 ▼
//! ┌──────────────┐                  ┌──────────────┐
//! │ CollabSession│                  │  LoroDoc per │
//! │ (canopy-core)│                  │     room     │
//! └──────────────┘                  └──────┬───────┘
//!                                          │
//!                                  ┌───────┴───────┐
//!                                  │ BroadcastGroup│
//!                                  │   (fan-out)   │
//!                                  └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: message envelope, JSON text frames with a bincode fallback
//! - [`broadcast`]: room fan-out with backpressure
//! - [`server`]: relay server
//! - [`client`]: client with reconnect backoff and offline queue

pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod server;

pub use broadcast::{BroadcastGroup, BroadcastStats, RoomMessage};
pub use client::{Backoff, ClientConfig, ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use protocol::{Envelope, Frame, ProtocolError, DEFAULT_BINARY_THRESHOLD};
pub use server::{ServerConfig, ServerStats, SyncServer};
