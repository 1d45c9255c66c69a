pub mod codec;
pub mod command;
pub mod receiver;
pub mod relay;

pub use codec::{decode, encode, CmdType};
pub use command::{clamp_quality, Command, MetadataSelector, DEFAULT_SNAPSHOT_QUALITY};
pub use receiver::{ChunkedReceiver, ReceiverSet, ReceiverState, Reply, TransferSink};
pub use relay::{unwrap_user, wrap_user, DataPacketKind};
