//! # Sipsync
//!
//! Live state sync for a multiplayer wine-tasting session. A host walks the
//! flight wine by wine while participants score and guess; this crate keeps
//! every participant's view of the event in step with the server.
//!
//! Three pieces compose into one per-page [`SyncFacade`]:
//!
//! - [`ResponseCache`] + [`ApiClient`]: reads are answered from memory while
//!   fresh and revalidated with `If-None-Match` once stale.
//! - [`PollingScheduler`]: periodic refresh with exponential backoff on
//!   failure, paused while the page is hidden.
//! - [`RealtimeChannel`]: one WebSocket per session with rooms and local
//!   publish/subscribe, shared by every page.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use sipsync::{
//!     ApiClient, PageVisibility, RealtimeChannel, ResponseCache, SyncConfig, SyncFacade,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> sipsync::Result<()> {
//! let config = SyncConfig::from_env()?;
//! let cache = Arc::new(ResponseCache::new(config.freshness_window()));
//! let api = Arc::new(ApiClient::from_config(&config, cache));
//!
//! let channel = Arc::new(RealtimeChannel::new(config.channel_config()));
//! channel.connect().await;
//!
//! let facade = SyncFacade::new(
//!     "42",
//!     api,
//!     Arc::clone(&channel),
//!     config.polling_config(),
//!     PageVisibility::default(),
//! );
//! facade
//!     .start_sync(|view| println!("now tasting wine {:?}", view.current_wine()))
//!     .await;
//!
//! // ... on unmount
//! facade.stop_sync();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod polling;
pub mod realtime;
pub mod sync;
pub mod types;

pub use api::{ApiClient, FetchMode};
pub use cache::{CacheEntry, CacheKey, ResponseCache};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use polling::{PageVisibility, PollingConfig, PollingScheduler, PollingState, SchedulerPhase};
pub use realtime::{
    ChannelConfig, ChannelSubscription, EventKind, PushEvent, RealtimeChannel,
    SubscriptionConfig,
};
pub use sync::{EventSource, SyncFacade, SyncView};
pub use types::{ConnectionStatus, EventSnapshot, PointerSource, PointerState, PointerUpdate};
