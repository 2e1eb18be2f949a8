use change_feed::FeedError;
use thiserror::Error;

use crate::store::StoreError;
use crate::TopicKey;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("change feed error: {0}")]
    Feed(#[from] FeedError),
    #[error("remote store error: {0}")]
    Store(#[from] StoreError),
    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("channel for {0} is closed")]
    ChannelClosed(TopicKey),
    #[error("topic {0} is not tracked")]
    NotTracked(TopicKey),
    #[error("topic {0} does not map to a table")]
    UnknownTopic(TopicKey),
    #[error("sync engine is shut down")]
    ShutDown,
}

pub type SyncResult<T> = Result<T, SyncError>;
