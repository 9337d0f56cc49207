//! Services module for transaction-sync-service.

pub mod feed;
pub mod memory;
pub mod metrics;
pub mod mongo;
pub mod repository;
pub mod reward_network;

pub use feed::{FeedConfig, FeedError, HttpFeedClient, TransactionFeed};
pub use memory::MemoryStore;
pub use metrics::{get_metrics, init_metrics, record_error};
pub use mongo::MongoStore;
pub use repository::{
    CardRepository, CompanyRepository, MatchCacheRepository, Repositories, SummaryRepository,
    TransactionRepository,
};
pub use reward_network::{
    RewardNetwork, RewardNetworkClient, RewardNetworkConfig, RewardTransactionRecord,
};
