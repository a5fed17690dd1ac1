pub mod chat;
pub mod headless;
pub mod membership;
pub mod mock;
pub mod orchestrator;
pub mod render;

pub use chat::{ChatIdentity, ChatSynchronizer};
pub use headless::{HeadlessEngine, LogSurface};
pub use membership::{MembershipConfig, RoomMembershipController};
pub use orchestrator::{BroadcastState, SessionOrchestrator, UiState};
pub use render::RenderTargets;
