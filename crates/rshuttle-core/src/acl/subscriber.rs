//! Live ACL reload over a Redis pub/sub channel.
//!
//! Three keys hold the current ACL tables as JSON blobs (`sshuttleAcl`,
//! `sshuttleAclSources`, `sshuttleAclExcluded`); a fourth, the `aclEvents`
//! channel, carries a message naming which of the three keys just changed.
//! On startup, and whenever a notification arrives, this task re-`GET`s the
//! named key and swaps the corresponding table in [`AclTables`]. Connection
//! loss is retried forever with a fixed backoff — an ACL reload path going
//! down is not, on its own, a reason to tear down an established session.

use std::sync::Arc;
use std::time::Duration;

use redis::AsyncCommands;
use tracing::{debug, error, info, warn};

use crate::acl::tables::{AclTables, RawSourceAcl, RawTargetAcl};

const ALLOWED_TARGETS_KEY: &str = "sshuttleAcl";
const ALLOWED_SOURCES_KEY: &str = "sshuttleAclSources";
const EXCLUDED_SOURCES_KEY: &str = "sshuttleAclExcluded";
const EVENTS_CHANNEL: &str = "aclEvents";

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Runs forever, reconnecting on failure. Intended to be spawned as its own
/// task; it never returns except by panicking on a bug, not on a
/// disconnect.
pub async fn run(redis_host: String, redis_port: u16, tables: Arc<AclTables>) {
    loop {
        match run_once(&redis_host, redis_port, &tables).await {
            Ok(()) => unreachable!("run_once only returns via Err"),
            Err(e) => {
                error!(error = %e, "ACL redis connection lost, retrying in {:?}", RECONNECT_DELAY);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

async fn run_once(redis_host: &str, redis_port: u16, tables: &AclTables) -> redis::RedisResult<()> {
    let url = format!("redis://{redis_host}:{redis_port}/");
    info!(%redis_host, redis_port, "connecting to ACL redis server");
    let client = redis::Client::open(url)?;
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;
    info!(%redis_host, redis_port, "connected to ACL redis server");

    // Full reload of all three tables before subscribing, so a session that
    // starts while ACLs already exist doesn't run closed-by-default any
    // longer than necessary.
    reload(&mut conn, tables, ALLOWED_TARGETS_KEY).await;
    reload(&mut conn, tables, ALLOWED_SOURCES_KEY).await;
    reload(&mut conn, tables, EXCLUDED_SOURCES_KEY).await;

    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(EVENTS_CHANNEL).await?;
    let mut messages = pubsub.on_message();

    loop {
        let Some(msg) = tokio_stream::StreamExt::next(&mut messages).await else {
            return Err(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "pubsub stream ended",
            )));
        };
        let channel: String = msg.get_channel_name().to_string();
        if channel != EVENTS_CHANNEL {
            continue;
        }
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "malformed ACL event payload, ignoring");
                continue;
            }
        };
        match payload.as_str() {
            ALLOWED_TARGETS_KEY | ALLOWED_SOURCES_KEY | EXCLUDED_SOURCES_KEY => {
                reload(&mut conn, tables, &payload).await;
            }
            other => debug!(key = %other, "unsupported ACL event key, ignoring"),
        }
    }
}

async fn reload(conn: &mut redis::aio::MultiplexedConnection, tables: &AclTables, key: &str) {
    let raw: Option<String> = match conn.get(key).await {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, %key, "failed to fetch ACL key from redis");
            return;
        }
    };

    let Some(raw) = raw else {
        apply_empty(tables, key);
        return;
    };

    match key {
        ALLOWED_TARGETS_KEY => match serde_json::from_str::<RawTargetAcl>(&raw) {
            Ok(parsed) => {
                let table = parsed.into_table();
                if table.is_empty() {
                    warn!("allowed-targets ACL is empty, restricting all access");
                }
                tables.set_allowed_targets(table);
            }
            Err(e) => warn!(error = %e, "failed to parse allowed-targets ACL, leaving prior table in place"),
        },
        ALLOWED_SOURCES_KEY => match serde_json::from_str::<RawSourceAcl>(&raw) {
            Ok(parsed) => tables.set_allowed_sources(parsed.into_table()),
            Err(e) => warn!(error = %e, "failed to parse allowed-sources ACL, leaving prior table in place"),
        },
        EXCLUDED_SOURCES_KEY => match serde_json::from_str::<RawSourceAcl>(&raw) {
            Ok(parsed) => tables.set_excluded_sources(parsed.into_table()),
            Err(e) => warn!(error = %e, "failed to parse excluded-sources ACL, leaving prior table in place"),
        },
        _ => unreachable!("reload only called with one of the three known keys"),
    }
}

fn apply_empty(tables: &AclTables, key: &str) {
    match key {
        ALLOWED_TARGETS_KEY => {
            warn!("allowed-targets ACL key missing, restricting all access");
            tables.set_allowed_targets(Default::default());
        }
        ALLOWED_SOURCES_KEY => tables.set_allowed_sources(Default::default()),
        EXCLUDED_SOURCES_KEY => tables.set_excluded_sources(Default::default()),
        _ => unreachable!(),
    }
}
