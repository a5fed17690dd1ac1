pub mod chat;
pub mod errors;
pub mod events;
pub mod ids;
pub mod media;
pub mod settings;
pub mod types;

pub use chat::{ChatLog, ChatMessage};
pub use errors::SessionError;
pub use ids::{StreamId, Uid};
pub use types::{MediaKind, Participant, Role, Session, SessionPhase};
