pub mod api;
pub mod client;
pub mod codec;
pub mod mock;
pub mod reliable;

pub use api::{ControlPlane, HttpControlPlane, YoutubeStream};
pub use client::{EventHandler, LoopbackPeer, SignalingClient};
pub use reliable::{ReliableControlPlane, RetryConfig};
