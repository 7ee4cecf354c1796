//! # reviewroom-collab — Realtime core for shared video-review sessions
//!
//! Small group of participants watching synchronized video feeds; any
//! editor can rearrange the shared panel layout, everyone converges on the
//! same state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CollabClient │ ◄────────────────► │ CollabServer │
//! │  (per user)  │   JSON envelopes   │  (central)   │
//! └──────────────┘                    └──────┬───────┘
//!                                            │ per connection
//!                                    ┌───────┴──────────┐
//!                                    │ SessionConnection │
//!                                    │  (state machine)  │
//!                                    └───────┬──────────┘
//!                        ┌───────────────────┼───────────────────┐
//!                        ▼                   ▼                   ▼
//!                 ┌─────────────┐    ┌───────────────┐   ┌─────────────┐
//!                 │ TokenService│    │SessionRegistry│   │ LayoutStore │
//!                 │ (HMAC caps) │    │   (fan-out)   │   │ (versioned) │
//!                 └─────────────┘    └───────────────┘   └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`token`] — Signed, short-lived connection tokens (HMAC-SHA256)
//! - [`protocol`] — JSON wire protocol and close codes
//! - [`registry`] — Per-session connection rooms with fan-out
//! - [`store`] — Versioned layout store with optimistic concurrency
//! - [`directory`] — Session membership checks (external seam)
//! - [`engine`] — Per-connection protocol state machine
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client
//!
//! ## Concurrency model
//!
//! Layout edits use compare-and-swap on the version number: a publish
//! names the version it was based on, the store commits it only if that is
//! still the latest, and losers get the authoritative state back to rebase
//! against. Last-writer-wins at document granularity, no merging.

pub mod client;
pub mod directory;
pub mod engine;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod store;
pub mod token;

// Re-exports for convenience
pub use client::{ClientError, ClientEvent, CollabClient};
pub use directory::{MemorySessionDirectory, SessionDirectory};
pub use engine::{CollabEngine, HandshakeRejection, Phase, SessionConnection};
pub use protocol::{
    ClientMessage, CloseReason, Envelope, LayoutUpdate, ProtocolError, ServerMessage,
};
pub use registry::{ConnectionHandle, RegistryStats, SendOutcome, SessionRegistry};
pub use server::{CollabServer, ServerConfig, ServerError};
pub use store::{
    default_layout, AppendOutcome, LayoutDocument, LayoutRecord, LayoutStore, MemoryLayoutStore,
    StoreError,
};
pub use token::{
    Claims, InvalidToken, MintedToken, Role, TokenConfig, TokenError, TokenKind, TokenService,
};
