pub mod collab;
pub mod errors;
pub mod ids;
pub mod observer;
pub mod protocol;

pub use collab::{AllowAllChannels, ChannelAuthorizer, IdentityDecoder, MessageRecord, MessageStore};
pub use errors::RelayError;
pub use ids::{ChannelId, ConnectionId, UserId};
pub use observer::{NoopObserver, RelayIncident, RelayObserver};
pub use protocol::{Ack, AckStatus, Action, RelayEvent};
