//! Feed subscription — connection, event decoding, dispatch, and the
//! reconnect supervisor that keeps the subscription alive.

pub mod client;
pub mod dispatcher;
pub mod event;
pub mod supervisor;

pub use client::{FeedClient, FeedConnection};
pub use dispatcher::EventDispatcher;
pub use event::{FeedAction, FeedEvent, ThreadMessagePayload, WorkspaceSettings};
pub use supervisor::{BackoffDecision, BackoffPolicy, ReconnectSupervisor};
