pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod media;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod transport;

pub use error::{Result, SessionError};
pub use session::{RoomRequest, SessionHandle, SessionManager};
