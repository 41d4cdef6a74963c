// Salesdesk Realtime
//
// Session-scoped realtime channels for the salesdesk front end: an online
// presence roster and supervisor-chat unread notifications, opened on login
// and torn down on logout.

pub mod channel;
pub mod config;
pub mod error;
pub mod manager;
pub mod session;
pub mod transport;

pub use channel::{
    ChannelHandle, ChannelStatus, Generation, GenerationCounter, ListenerId, NotificationChannel,
    PresenceChannel, PresenceRecord, PresenceRegistry, UnreadState,
};
pub use config::RealtimeConfig;
pub use error::{ChannelError, ConfigError, SalesdeskError, TeardownError, TransportError};
pub use manager::{SessionChannelManager, SessionPhase};
pub use session::{LoginIdentity, Permissions, Role, Session};
pub use transport::{
    ChannelEvent, EventClass, InMemoryTransport, PresenceEvent, PresenceTable, RealtimeTransport,
    SubscribeOptions, Subscription, SubscriptionId,
};
