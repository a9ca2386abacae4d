//! Long-polling loop for `getUpdates`.
//!
//! The loop owns the poll offset and the update deduper; nothing else touches
//! them. The offset advances before an update is dispatched, so a handler
//! failure (or a crash mid-handling) can never cause the same update_id to be
//! re-fetched and replayed. Within the dedup window the same update_id is
//! dispatched at most once even when the API re-delivers it.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use mmcx_config::TelegramConfig;

use crate::client::{ApiReply, TelegramClient};
use crate::dedup::SlidingWindowDeduper;

/// Pause after a reply-shaped failure (API said not-ok or sent garbage).
const BAD_REPLY_BACKOFF: Duration = Duration::from_secs(1);
/// Pause after a network-level fetch failure.
const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Consumer of deduplicated inbound updates.
#[async_trait]
pub trait UpdateHandler: Send + Sync {
    async fn handle_update(&self, update: &Value) -> Result<()>;
}

/// What to do with one raw update from a poll batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// No integer update_id: drop, touch neither offset nor deduper.
    Malformed,
    /// Offset advanced, but the id is within the dedup window: skip dispatch.
    Duplicate(i64),
    /// Offset advanced, first sighting: dispatch.
    Dispatch(i64),
}

/// Advance the offset past `update` and classify it. The offset moves even
/// for duplicates: the API keeps re-delivering until a higher offset is
/// acknowledged.
pub fn ingest(
    update: &Value,
    offset: &mut Option<i64>,
    deduper: &mut SlidingWindowDeduper<i64>,
) -> Ingest {
    let Some(uid) = update.get("update_id").and_then(Value::as_i64) else {
        return Ingest::Malformed;
    };
    let next = uid + 1;
    *offset = Some(offset.map_or(next, |current| current.max(next)));
    if deduper.seen_or_add(uid) {
        Ingest::Duplicate(uid)
    } else {
        Ingest::Dispatch(uid)
    }
}

/// Feed a backlog batch into the deduper and return the offset just past it,
/// or None when the batch held no usable update ids.
pub fn scan_backlog(updates: &[Value], deduper: &mut SlidingWindowDeduper<i64>) -> Option<i64> {
    let mut max_uid: Option<i64> = None;
    for update in updates {
        let Some(uid) = update.get("update_id").and_then(Value::as_i64) else {
            warn!("ignoring backlog update without integer update_id");
            continue;
        };
        deduper.seen_or_add(uid);
        max_uid = Some(max_uid.map_or(uid, |m| m.max(uid)));
    }
    max_uid.map(|m| m + 1)
}

/// One best-effort, zero-timeout fetch to skip whatever accumulated while the
/// process was down. Backlog ids are pre-seeded into the deduper so a later
/// re-delivery cannot slip through. Any failure just means "start
/// unconstrained" - never fatal.
pub async fn bootstrap_offset(
    client: &TelegramClient,
    allowed_updates: &[String],
    deduper: &mut SlidingWindowDeduper<i64>,
) -> Option<i64> {
    let reply = match client.get_updates(None, 0, allowed_updates).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("startup backlog probe failed, polling from default offset: {e:#}");
            return None;
        }
    };
    let result = match reply {
        ApiReply::Ok { result } => result,
        ApiReply::Failure { description, .. } => {
            warn!("startup backlog probe returned an error reply: {description}");
            return None;
        }
    };
    let updates = result.as_array().cloned().unwrap_or_default();
    if updates.is_empty() {
        return None;
    }
    let offset = scan_backlog(&updates, deduper);
    if let Some(offset) = offset {
        info!(
            backlog = updates.len(),
            offset, "skipped startup backlog of stale updates"
        );
    }
    offset
}

/// Run the polling loop until `cancel` flips. In-flight fetches and backoff
/// sleeps are abandoned on cancellation, not awaited.
pub async fn poll_loop(
    client: &TelegramClient,
    handler: &dyn UpdateHandler,
    cfg: &TelegramConfig,
    mut cancel: watch::Receiver<bool>,
) {
    let mut deduper = SlidingWindowDeduper::new(cfg.effective_dedup_window());
    let mut offset = bootstrap_offset(client, &cfg.allowed_updates, &mut deduper).await;

    info!(offset = ?offset, "telegram polling started");

    loop {
        if *cancel.borrow() {
            info!("telegram poller shutting down");
            return;
        }

        let fetched = tokio::select! {
            result = client.get_updates(offset, cfg.poll_timeout_secs, &cfg.allowed_updates) => result,
            _ = cancel.changed() => {
                info!("telegram poller cancelled");
                return;
            }
        };

        let reply = match fetched {
            Ok(reply) => reply,
            Err(e) => {
                warn!("getUpdates failed: {e:#}");
                if sleep_or_cancel(FETCH_ERROR_BACKOFF, &mut cancel).await {
                    return;
                }
                continue;
            }
        };

        let result = match reply {
            ApiReply::Ok { result } => result,
            ApiReply::Failure {
                description,
                status,
                ..
            } => {
                warn!(?status, "getUpdates returned an error reply: {description}");
                if sleep_or_cancel(BAD_REPLY_BACKOFF, &mut cancel).await {
                    return;
                }
                continue;
            }
        };

        let updates = result.as_array().cloned().unwrap_or_default();
        for update in &updates {
            match ingest(update, &mut offset, &mut deduper) {
                Ingest::Malformed => {
                    warn!("ignoring update without integer update_id: {update}");
                }
                Ingest::Duplicate(uid) => {
                    debug!(uid, "skipping duplicate update");
                }
                Ingest::Dispatch(uid) => {
                    if let Err(e) = handler.handle_update(update).await {
                        // Offset already advanced: log and move on, the
                        // update is not retried.
                        error!(uid, "update handler failed: {e:#}");
                    }
                }
            }
        }
    }
}

/// Sleep for `duration`, returning true if cancellation fired first.
async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.changed() => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upd(uid: i64) -> Value {
        json!({ "update_id": uid, "message": { "text": "x" } })
    }

    #[test]
    fn offset_tracks_max_uid_plus_one() {
        let mut offset = None;
        let mut deduper = SlidingWindowDeduper::new(16);
        for uid in [5, 9, 7] {
            ingest(&upd(uid), &mut offset, &mut deduper);
        }
        assert_eq!(offset, Some(10));
        // A late repeat of a lower uid must not move the offset backwards.
        assert_eq!(
            ingest(&upd(7), &mut offset, &mut deduper),
            Ingest::Duplicate(7)
        );
        assert_eq!(offset, Some(10));
    }

    #[test]
    fn duplicate_within_window_is_not_dispatched_but_advances_offset() {
        let mut offset = None;
        let mut deduper = SlidingWindowDeduper::new(16);
        // First batch.
        assert_eq!(
            ingest(&upd(100), &mut offset, &mut deduper),
            Ingest::Dispatch(100)
        );
        assert_eq!(
            ingest(&upd(101), &mut offset, &mut deduper),
            Ingest::Dispatch(101)
        );
        // Second batch re-delivers 101 under network retry.
        assert_eq!(
            ingest(&upd(101), &mut offset, &mut deduper),
            Ingest::Duplicate(101)
        );
        assert_eq!(
            ingest(&upd(102), &mut offset, &mut deduper),
            Ingest::Dispatch(102)
        );
        assert_eq!(offset, Some(103));
    }

    #[test]
    fn malformed_updates_touch_nothing() {
        let mut offset = Some(50);
        let mut deduper = SlidingWindowDeduper::new(16);
        for bad in [
            json!({}),
            json!({ "update_id": "notanint" }),
            json!({ "update_id": 1.5 }),
            json!({ "update_id": null }),
        ] {
            assert_eq!(ingest(&bad, &mut offset, &mut deduper), Ingest::Malformed);
        }
        assert_eq!(offset, Some(50));
        assert!(deduper.is_empty());
    }

    #[test]
    fn backlog_scan_returns_max_plus_one_and_preseeds_dedup() {
        let mut deduper = SlidingWindowDeduper::new(16);
        let batch = vec![upd(5), upd(7), upd(6)];
        assert_eq!(scan_backlog(&batch, &mut deduper), Some(8));

        // Even if the API replays the backlog, nothing gets dispatched.
        let mut offset = Some(8);
        for uid in [5, 6, 7] {
            assert_eq!(
                ingest(&upd(uid), &mut offset, &mut deduper),
                Ingest::Duplicate(uid)
            );
        }
        assert_eq!(offset, Some(8));
    }

    #[test]
    fn backlog_scan_skips_malformed_entries() {
        let mut deduper = SlidingWindowDeduper::new(16);
        let batch = vec![json!({ "update_id": "x" }), upd(3)];
        assert_eq!(scan_backlog(&batch, &mut deduper), Some(4));

        let empty: Vec<Value> = vec![json!({})];
        assert_eq!(scan_backlog(&empty, &mut deduper), None);
    }
}
