pub mod engine;
pub mod instance;
pub mod metrics;
pub mod statistic;

pub use self::engine::Engine;
pub use self::instance::{Instance, MetricsCache};
pub use self::metrics::{Datapoint, MetricDefinition, derive_metric_category};
pub use self::statistic::Statistic;
