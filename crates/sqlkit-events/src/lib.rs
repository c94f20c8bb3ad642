// crates/sqlkit-events/src/lib.rs
//! Event-sourcing store on Postgres (`events` schema).
//!
//! Append-only events with a global position and gapless per-stream
//! versions, optimistic concurrency on append, subscriptions with
//! claim-based exactly-once-ish polling, snapshots, registered aggregates
//! (compiled to generated pl/pgsql loader functions), and projections in
//! two flavors: sync triggers inside the appending transaction and async
//! subscriptions polled by host-side runners.

use anyhow::Result;
use sqlx::PgPool;

pub mod aggregates;
pub mod append;
pub mod projections;
pub mod read;
pub mod snapshots;
pub mod subscriptions;
pub mod types;

pub use aggregates::{
    get_aggregate, load_aggregate, load_registered_aggregate, register_aggregate,
    unregister_aggregate, AggregateDef, LoadedAggregate,
};
pub use append::{append, get_stream, register_type, stream_version, AppendOptions};
pub use projections::{
    get_projection, list_projections, projection_subscription_name, register_projection,
    unregister_projection, ProjectionDef,
};
pub use read::{
    get_event, get_event_at_position, max_position, read_all, read_by_category, read_by_type,
    read_stream, ReadDirection,
};
pub use snapshots::{delete_snapshot, load_snapshot, save_snapshot, Snapshot};
pub use subscriptions::{
    ack, cleanup_expired_claims, cleanup_subscription_claims, create_subscription,
    delete_subscription, get_subscription, list_subscriptions, poll, set_subscription_active,
    SubscriptionInfo, SubscriptionOptions, SubscriptionRow,
};
pub use types::{EventRecord, EventType, StreamRow};

/// Install the `events` schema. Idempotent.
pub async fn install(pool: &PgPool) -> Result<()> {
    sqlkit_db::run_install_script(pool, "events", include_str!("../sql/install.sql")).await
}
