mod adapter;
mod affinity;
mod channel;
mod classify;
mod config_view;
mod failed_keys;
mod failover;
mod scheduler;
mod upstream;
mod url_ranker;

pub use adapter::{AdapterError, ClientReply, ProtocolAdapter, StreamTranslator};
pub use affinity::TraceAffinityMap;
pub use channel::{ChannelConfig, ChannelStatus, Config};
pub use classify::{should_retry_with_next_key, Classification};
pub use config_view::ConfigView;
pub use failed_keys::FailedKeyCache;
pub use failover::{ChannelAttempt, FailoverBody, ProxyCore, RequestSpec};
pub use scheduler::{ChannelScheduler, SelectionReason, SelectionResult};
pub use upstream::{
    UpstreamBody, UpstreamClient, UpstreamClientConfig, UpstreamFailure, UpstreamHttpRequest,
    UpstreamResponse,
};
pub use url_ranker::{SortedUrl, UrlRanker};
