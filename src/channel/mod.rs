// Realtime Channels
//
// Channel handle primitive plus the two session channels built on it.

pub mod generation;
pub mod handle;
pub mod notification;
pub mod presence;
pub mod registry;

pub use generation::{Generation, GenerationCounter};
pub use handle::{ChannelHandle, ChannelStatus, EventHandler, ListenerId};
pub use notification::{NotificationChannel, UnreadSignal, UnreadState};
pub use presence::PresenceChannel;
pub use registry::{PresencePayload, PresenceRecord, PresenceRegistry};
