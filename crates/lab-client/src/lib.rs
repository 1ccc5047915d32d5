//! Network side of the console: configuration, REST client, fetch caching,
//! request limiting and the live pilot feed.

pub mod api;
pub mod cache;
pub mod config;
pub mod limiter;
pub mod live;

pub use api::{ApiClient, ApiError};
pub use cache::{CollectionCache, FetchCache, Fetched};
pub use config::{ConfigError, ConfigOverrides, ConsoleConfig};
pub use limiter::Limiter;
pub use live::{FeedError, PilotFeed};
