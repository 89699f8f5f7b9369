//! Client side of the messaging core: REST access, the realtime session,
//! and the state a chat UI renders from.

pub mod display;
pub mod error;
pub mod outbox;
pub mod presence;
pub mod rest;
pub mod session;
pub mod typing;
pub mod view;

pub use error::{ClientError, Result};
pub use presence::{ConnectionState, PresenceEvent, PresenceSnapshot, PresenceStatus, PresenceTracker};
pub use rest::RestClient;
pub use session::RealtimeSession;
pub use view::{ConversationView, ReactionAction, Receipt};
