//! In-memory replica of global network state.

pub mod channel;
pub mod modes;
pub mod network;
pub mod server;
pub mod user;

pub use channel::{BanEntry, Channel, ChannelModes, MemberModes, Membership};
pub use modes::{ModeArg, ModeChange, ParseFlags};
pub use network::Network;
pub use server::Server;
pub use user::{User, UserModes};

/// Field length limits, shared with the rest of the network.
pub const NICKLEN: usize = 30;
pub const USERLEN: usize = 10;
pub const HOSTLEN: usize = 63;
pub const REALLEN: usize = 50;
pub const TOPICLEN: usize = 250;
pub const CHANNELLEN: usize = 200;

/// Highest channel-operator oplevel.
pub const MAX_OPLEVEL: u16 = 999;

/// Maximum parameterized modes per announced MODE line.
pub const MAX_MODE_PARAMS: usize = 6;

/// Maximum bans kept per channel.
pub const MAX_BANS: usize = 45;

/// Servers claiming to have booted before this are lying (or worse); such
/// timestamps are logged and otherwise ignored.
pub const PREHISTORY: i64 = 780_000_000;
