mod engine;
mod query;
mod sweep;

pub use engine::{metrics_key, KeyMetricsSnapshot, MetricsEngine, RequestRecord};
pub use query::{
    ActivitySegment, GlobalStatsHistory, GlobalStatsSummary, HistoryPoint, KeyHistoryPoint,
    RecentActivity, TimeWindowStats,
};
