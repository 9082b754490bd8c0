//! Client-side conversation sync engine.
//!
//! This crate owns the local view of one open conversation and the user's
//! conversation list, reconciles optimistic sends with authoritative remote
//! state, and defines the port the hosted backend adapter implements.

/// Local cache of the open conversation and the conversation list.
pub mod cache;
/// Async command/event channel primitives.
pub mod channel;
/// Synchronous sync reducer.
pub mod engine;
/// Stable sync error types and HTTP classification helpers.
pub mod error;
/// Optimistic/authoritative message merge.
pub mod merge;
/// Delivery acknowledgement normalization.
pub mod normalization;
/// Remote capabilities required by the engine.
pub mod port;
/// Backoff policy for conflict re-application and reconnects.
pub mod retry;
/// Command loop driving the engine against a remote port.
pub mod runtime;
/// Conversation lifecycle state machine.
pub mod state_machine;
/// Domain and UI-facing protocol types.
pub mod types;

pub use cache::{LocalCache, OpenConversation};
pub use channel::{EventStream, RuntimeLink, SyncChannelError};
pub use engine::{
    ChangeAction, EngineConfig, LoadOutcome, LoadedConversation, OpenPlan, OutgoingSend,
    SyncEngine,
};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use merge::{CachedMessage, MergeOutcome, merge_messages};
pub use normalization::{DeliveryReport, PEER_COPY_FAILED, normalize_delivery};
pub use port::{ChangeSink, RemotePort, SubscriptionHandle};
pub use retry::RetryPolicy;
pub use runtime::{SyncRuntimeHandle, spawn_runtime};
pub use state_machine::{ConversationStateMachine, FetchTicket};
pub use types::{
    BlockRelation, BlockState, Conversation, ConversationPhase, ConversationSummary,
    ConversationView, DeliveryStatus, MediaUpload, Message, MessageView, PeerProfile,
    RemoteChange, SendAck, SessionContext, SyncCommand, SyncEvent,
};
