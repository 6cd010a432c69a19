use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::ExecutionDb;
use crate::execution::types::{
    AppendOutcome, AttemptCursor, AttemptFilter, AttemptKey, AttemptStatus, EventCursor,
    EventProcessingStatus, ExecutionAttempt, LocationEvent, NewLocationEvent, PageOrder,
    RuleExecutionHistory, RuleId, TransitionOutcome, status_code,
};
use crate::rate_limit::advance_history;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Idempotent on `event_id`; a replay with a different wallet is a conflict.
    async fn append_event(&self, event: NewLocationEvent) -> Result<LocationEvent, StoreError>;

    /// Appends unless a live attempt for the same (event, rule, wallet) exists,
    /// in which case that attempt is returned.
    async fn append_attempt(&self, attempt: ExecutionAttempt)
    -> Result<AppendOutcome, StoreError>;

    async fn get_event(&self, event_id: &str) -> Result<Option<LocationEvent>, StoreError>;

    /// Oldest first, strictly after `after`, at most `limit`.
    async fn list_events(
        &self,
        after: Option<&EventCursor>,
        limit: usize,
    ) -> Result<Vec<LocationEvent>, StoreError>;

    /// Newest first.
    async fn list_attempts(
        &self,
        filter: &AttemptFilter,
    ) -> Result<Vec<ExecutionAttempt>, StoreError>;

    /// One page of the whole attempt log in `order`, strictly after `after`.
    async fn page_attempts(
        &self,
        order: PageOrder,
        after: Option<&AttemptCursor>,
        limit: usize,
    ) -> Result<Vec<ExecutionAttempt>, StoreError>;

    /// Move the newest attempt for `key` whose status code is in `guard` to `to`.
    ///
    /// Completed and rejected attempts are never rewritten whatever the guard says.
    async fn transition(
        &self,
        key: &AttemptKey,
        guard: &[&str],
        to: AttemptStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    async fn delete_event_if_collectable(
        &self,
        event_id: &str,
        unmatched_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn get_history(
        &self,
        rule_id: RuleId,
        wallet: &str,
    ) -> Result<Option<RuleExecutionHistory>, StoreError>;

    async fn record_execution(
        &self,
        rule_id: RuleId,
        wallet: &str,
        at: DateTime<Utc>,
        window_seconds: Option<i64>,
    ) -> Result<RuleExecutionHistory, StoreError>;

    /// False when the nonce was already used by this wallet.
    async fn consume_nonce(
        &self,
        wallet: &str,
        nonce: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn registered_signing_key(
        &self,
        wallet: &str,
        contract_address: &str,
    ) -> Result<Option<String>, StoreError>;

    /// First registration wins; later calls leave the stored key untouched.
    async fn register_signing_key(
        &self,
        wallet: &str,
        contract_address: &str,
        public_key: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

pub fn memory() -> Arc<dyn ExecutionStore> {
    Arc::new(MemoryExecutionStore::default())
}

pub fn postgres(db: Arc<ExecutionDb>) -> Arc<dyn ExecutionStore> {
    Arc::new(PostgresExecutionStore { db })
}

const NEVER_REWRITTEN: &[&str] = &[status_code::COMPLETED, status_code::REJECTED];

#[derive(Default)]
struct MemoryExecutionStore {
    inner: Mutex<MemoryExecutionStoreInner>,
}

#[derive(Default)]
struct MemoryExecutionStoreInner {
    events: HashMap<String, LocationEvent>,
    history: HashMap<(RuleId, String), RuleExecutionHistory>,
    nonces: HashSet<(String, String)>,
    signing_keys: HashMap<(String, String), String>,
}

fn newest_index<'a>(
    attempts: impl Iterator<Item = (usize, &'a ExecutionAttempt)>,
) -> Option<usize> {
    attempts
        .max_by_key(|(index, attempt)| (attempt.matched_at, *index))
        .map(|(index, _)| index)
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn append_event(&self, event: NewLocationEvent) -> Result<LocationEvent, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.events.get(&event.event_id) {
            if existing.wallet != event.wallet {
                return Err(StoreError::Conflict(
                    "event_id reused with a different wallet".to_string(),
                ));
            }
            return Ok(existing.clone());
        }
        let stored = LocationEvent {
            event_id: event.event_id.clone(),
            wallet: event.wallet,
            user_id: event.user_id,
            latitude: event.latitude,
            longitude: event.longitude,
            received_at: event.received_at,
            processing_status: EventProcessingStatus::Received,
            attempts: Vec::new(),
        };
        inner.events.insert(event.event_id, stored.clone());
        Ok(stored)
    }

    async fn append_attempt(
        &self,
        attempt: ExecutionAttempt,
    ) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .events
            .get_mut(&attempt.event_id)
            .ok_or_else(|| StoreError::NotFound(format!("event {}", attempt.event_id)))?;

        if let Some(live) = event.attempts.iter().find(|existing| {
            existing.rule_id == attempt.rule_id
                && existing.wallet == attempt.wallet
                && existing.status.is_live()
        }) {
            return Ok(AppendOutcome::Existing(live.clone()));
        }

        event.attempts.push(attempt.clone());
        if event.processing_status == EventProcessingStatus::Received {
            event.processing_status = EventProcessingStatus::Matched;
        }
        Ok(AppendOutcome::Appended(attempt))
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<LocationEvent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.events.get(event_id).cloned())
    }

    async fn list_events(
        &self,
        after: Option<&EventCursor>,
        limit: usize,
    ) -> Result<Vec<LocationEvent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut events = inner
            .events
            .values()
            .filter(|event| after.is_none_or(|cursor| cursor.precedes(event)))
            .cloned()
            .collect::<Vec<_>>();
        events.sort_by(|left, right| {
            left.received_at
                .cmp(&right.received_at)
                .then_with(|| left.event_id.cmp(&right.event_id))
        });
        events.truncate(limit);
        Ok(events)
    }

    async fn list_attempts(
        &self,
        filter: &AttemptFilter,
    ) -> Result<Vec<ExecutionAttempt>, StoreError> {
        let inner = self.inner.lock().await;
        let mut attempts = inner
            .events
            .values()
            .flat_map(|event| event.attempts.iter())
            .filter(|attempt| filter.matches(attempt))
            .cloned()
            .collect::<Vec<_>>();
        attempts.sort_by(|left, right| {
            right
                .matched_at
                .cmp(&left.matched_at)
                .then_with(|| right.attempt_id.cmp(&left.attempt_id))
        });
        Ok(attempts)
    }

    async fn page_attempts(
        &self,
        order: PageOrder,
        after: Option<&AttemptCursor>,
        limit: usize,
    ) -> Result<Vec<ExecutionAttempt>, StoreError> {
        let inner = self.inner.lock().await;
        let mut attempts = inner
            .events
            .values()
            .flat_map(|event| event.attempts.iter())
            .filter(|attempt| after.is_none_or(|cursor| cursor.precedes(attempt, order)))
            .cloned()
            .collect::<Vec<_>>();
        attempts.sort_by(|left, right| {
            let ordering = left
                .matched_at
                .cmp(&right.matched_at)
                .then_with(|| left.attempt_id.cmp(&right.attempt_id));
            match order {
                PageOrder::OldestFirst => ordering,
                PageOrder::NewestFirst => ordering.reverse(),
            }
        });
        attempts.truncate(limit);
        Ok(attempts)
    }

    async fn transition(
        &self,
        key: &AttemptKey,
        guard: &[&str],
        to: AttemptStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let event = inner
            .events
            .get_mut(&key.event_id)
            .ok_or_else(|| StoreError::NotFound(format!("event {}", key.event_id)))?;

        let for_key = || {
            event
                .attempts
                .iter()
                .enumerate()
                .filter(|(_, attempt)| attempt.rule_id == key.rule_id && attempt.wallet == key.wallet)
        };
        let target = newest_index(for_key().filter(|(_, attempt)| {
            attempt.status.matches_any(guard) && !attempt.status.matches_any(NEVER_REWRITTEN)
        }));
        let Some(index) = target else {
            let newest = newest_index(for_key()).ok_or_else(|| {
                StoreError::NotFound(format!(
                    "attempt for rule {} and wallet {} in event {}",
                    key.rule_id, key.wallet, key.event_id
                ))
            })?;
            return Ok(TransitionOutcome::Skipped {
                current: event.attempts[newest].clone(),
            });
        };

        let completed = to.is_completed();
        let attempt = &mut event.attempts[index];
        attempt.status = to;
        attempt.updated_at = at;
        let updated = attempt.clone();
        if completed {
            event.processing_status = EventProcessingStatus::Executed;
        }
        Ok(TransitionOutcome::Applied(updated))
    }

    async fn delete_event_if_collectable(
        &self,
        event_id: &str,
        unmatched_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let collectable = inner
            .events
            .get(event_id)
            .is_some_and(|event| event.is_collectable(unmatched_before));
        if collectable {
            inner.events.remove(event_id);
        }
        Ok(collectable)
    }

    async fn get_history(
        &self,
        rule_id: RuleId,
        wallet: &str,
    ) -> Result<Option<RuleExecutionHistory>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.history.get(&(rule_id, wallet.to_string())).cloned())
    }

    async fn record_execution(
        &self,
        rule_id: RuleId,
        wallet: &str,
        at: DateTime<Utc>,
        window_seconds: Option<i64>,
    ) -> Result<RuleExecutionHistory, StoreError> {
        let mut inner = self.inner.lock().await;
        let key = (rule_id, wallet.to_string());
        let next = advance_history(inner.history.get(&key), rule_id, wallet, at, window_seconds);
        inner.history.insert(key, next.clone());
        Ok(next)
    }

    async fn consume_nonce(
        &self,
        wallet: &str,
        nonce: &str,
        _at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .nonces
            .insert((wallet.to_string(), nonce.to_string())))
    }

    async fn registered_signing_key(
        &self,
        wallet: &str,
        contract_address: &str,
    ) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .signing_keys
            .get(&(wallet.to_string(), contract_address.to_string()))
            .cloned())
    }

    async fn register_signing_key(
        &self,
        wallet: &str,
        contract_address: &str,
        public_key: &str,
        _at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .signing_keys
            .entry((wallet.to_string(), contract_address.to_string()))
            .or_insert_with(|| public_key.to_string());
        Ok(())
    }
}

struct PostgresExecutionStore {
    db: Arc<ExecutionDb>,
}

const ATTEMPT_COLUMNS: &str = "attempt_id, event_id, rule_id, wallet, user_id, status_json, matched_at, updated_at";

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn append_event(&self, event: NewLocationEvent) -> Result<LocationEvent, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;

        tx.execute(
            r#"
            INSERT INTO geotrigger.location_events (
                event_id, wallet, user_id, latitude, longitude, received_at, processing_status
            ) VALUES ($1,$2,$3,$4,$5,$6,'received')
            ON CONFLICT (event_id) DO NOTHING
            "#,
            &[
                &event.event_id,
                &event.wallet,
                &event.user_id,
                &event.latitude,
                &event.longitude,
                &event.received_at,
            ],
        )
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?;

        let stored = load_event(&tx, &event.event_id, false)
            .await?
            .ok_or_else(|| StoreError::Db("event vanished after insert".to_string()))?;
        if stored.wallet != event.wallet {
            return Err(StoreError::Conflict(
                "event_id reused with a different wallet".to_string(),
            ));
        }

        tx.commit()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        Ok(stored)
    }

    async fn append_attempt(
        &self,
        attempt: ExecutionAttempt,
    ) -> Result<AppendOutcome, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;

        let locked = tx
            .query_opt(
                "SELECT event_id FROM geotrigger.location_events WHERE event_id = $1 FOR UPDATE",
                &[&attempt.event_id],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        if locked.is_none() {
            return Err(StoreError::NotFound(format!("event {}", attempt.event_id)));
        }

        let live_codes = codes(status_code::LIVE);
        let live = tx
            .query_opt(
                &format!(
                    r#"
                    SELECT {ATTEMPT_COLUMNS}
                      FROM geotrigger.execution_attempts
                     WHERE event_id = $1 AND rule_id = $2 AND wallet = $3
                       AND status_code = ANY($4)
                     ORDER BY matched_at DESC, attempt_id DESC
                     LIMIT 1
                    "#
                ),
                &[&attempt.event_id, &attempt.rule_id, &attempt.wallet, &live_codes],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        if let Some(row) = live {
            let existing = map_attempt_row(&row).map_err(StoreError::Db)?;
            tx.commit()
                .await
                .map_err(|error| StoreError::Db(error.to_string()))?;
            return Ok(AppendOutcome::Existing(existing));
        }

        let status_json = status_json(&attempt.status)?;
        tx.execute(
            r#"
            INSERT INTO geotrigger.execution_attempts (
                attempt_id, event_id, rule_id, wallet, user_id, status_code, status_json,
                transaction_hash, matched_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
            "#,
            &[
                &attempt.attempt_id,
                &attempt.event_id,
                &attempt.rule_id,
                &attempt.wallet,
                &attempt.user_id,
                &attempt.status.code(),
                &status_json,
                &attempt.status.transaction_hash(),
                &attempt.matched_at,
                &attempt.updated_at,
            ],
        )
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?;

        tx.execute(
            r#"
            UPDATE geotrigger.location_events
               SET processing_status = 'matched'
             WHERE event_id = $1 AND processing_status = 'received'
            "#,
            &[&attempt.event_id],
        )
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?;

        tx.commit()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        Ok(AppendOutcome::Appended(attempt))
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<LocationEvent>, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        let event = load_event(&tx, event_id, false).await?;
        tx.commit()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        Ok(event)
    }

    async fn list_events(
        &self,
        after: Option<&EventCursor>,
        limit: usize,
    ) -> Result<Vec<LocationEvent>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let after_received_at = after.map(|cursor| cursor.received_at);
        let after_event_id = after.map(|cursor| cursor.event_id.clone());
        let rows = client
            .query(
                r#"
                SELECT event_id, wallet, user_id, latitude, longitude, received_at, processing_status
                  FROM geotrigger.location_events
                 WHERE $1::TIMESTAMPTZ IS NULL
                    OR (received_at, event_id) > ($1, $2::TEXT)
                 ORDER BY received_at ASC, event_id ASC
                 LIMIT $3
                "#,
                &[&after_received_at, &after_event_id, &limit],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        let mut events = rows
            .iter()
            .map(map_event_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)?;
        if events.is_empty() {
            return Ok(events);
        }

        let event_ids = events
            .iter()
            .map(|event| event.event_id.clone())
            .collect::<Vec<_>>();
        let attempt_rows = client
            .query(
                &format!(
                    r#"
                    SELECT {ATTEMPT_COLUMNS}
                      FROM geotrigger.execution_attempts
                     WHERE event_id = ANY($1)
                     ORDER BY matched_at ASC, attempt_id ASC
                    "#
                ),
                &[&event_ids],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        let mut by_event: HashMap<String, Vec<ExecutionAttempt>> = HashMap::new();
        for row in &attempt_rows {
            let attempt = map_attempt_row(row).map_err(StoreError::Db)?;
            by_event
                .entry(attempt.event_id.clone())
                .or_default()
                .push(attempt);
        }
        for event in &mut events {
            event.attempts = by_event.remove(&event.event_id).unwrap_or_default();
        }
        Ok(events)
    }

    async fn list_attempts(
        &self,
        filter: &AttemptFilter,
    ) -> Result<Vec<ExecutionAttempt>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                &format!(
                    r#"
                    SELECT {ATTEMPT_COLUMNS}
                      FROM geotrigger.execution_attempts
                     WHERE (
                              ($1::TEXT IS NULL AND cardinality($2::TEXT[]) = 0)
                              OR user_id = $1
                              OR wallet = ANY($2)
                           )
                       AND ($3::BIGINT IS NULL OR rule_id = $3)
                       AND ($4::TEXT IS NULL OR event_id = $4)
                     ORDER BY matched_at DESC, attempt_id DESC
                    "#
                ),
                &[&filter.user_id, &filter.wallets, &filter.rule_id, &filter.event_id],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_attempt_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn page_attempts(
        &self,
        order: PageOrder,
        after: Option<&AttemptCursor>,
        limit: usize,
    ) -> Result<Vec<ExecutionAttempt>, StoreError> {
        let (comparison, direction) = match order {
            PageOrder::OldestFirst => (">", "ASC"),
            PageOrder::NewestFirst => ("<", "DESC"),
        };
        let client = self.db.client();
        let client = client.lock().await;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let after_matched_at = after.map(|cursor| cursor.matched_at);
        let after_attempt_id = after.map(|cursor| cursor.attempt_id.clone());
        let rows = client
            .query(
                &format!(
                    r#"
                    SELECT {ATTEMPT_COLUMNS}
                      FROM geotrigger.execution_attempts
                     WHERE $1::TIMESTAMPTZ IS NULL
                        OR (matched_at, attempt_id) {comparison} ($1, $2::TEXT)
                     ORDER BY matched_at {direction}, attempt_id {direction}
                     LIMIT $3
                    "#
                ),
                &[&after_matched_at, &after_attempt_id, &limit],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_attempt_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::Db)
    }

    async fn transition(
        &self,
        key: &AttemptKey,
        guard: &[&str],
        to: AttemptStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;

        let guard_codes = codes(guard);
        let never = codes(NEVER_REWRITTEN);
        let status_json = status_json(&to)?;
        let updated = tx
            .query_opt(
                &format!(
                    r#"
                    WITH target AS (
                        SELECT attempt_id
                          FROM geotrigger.execution_attempts
                         WHERE event_id = $1 AND rule_id = $2 AND wallet = $3
                           AND status_code = ANY($4)
                           AND NOT (status_code = ANY($5))
                         ORDER BY matched_at DESC, attempt_id DESC
                         LIMIT 1
                         FOR UPDATE
                    )
                    UPDATE geotrigger.execution_attempts AS attempts
                       SET status_code = $6,
                           status_json = $7,
                           transaction_hash = COALESCE($8, attempts.transaction_hash),
                           updated_at = $9
                      FROM target
                     WHERE attempts.attempt_id = target.attempt_id
                 RETURNING {}
                    "#,
                    prefixed_attempt_columns("attempts")
                ),
                &[
                    &key.event_id,
                    &key.rule_id,
                    &key.wallet,
                    &guard_codes,
                    &never,
                    &to.code(),
                    &status_json,
                    &to.transaction_hash(),
                    &at,
                ],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;

        let outcome = match updated {
            Some(row) => {
                let attempt = map_attempt_row(&row).map_err(StoreError::Db)?;
                if attempt.status.is_completed() {
                    tx.execute(
                        "UPDATE geotrigger.location_events SET processing_status = 'executed' WHERE event_id = $1",
                        &[&key.event_id],
                    )
                    .await
                    .map_err(|error| StoreError::Db(error.to_string()))?;
                }
                TransitionOutcome::Applied(attempt)
            }
            None => {
                let current = tx
                    .query_opt(
                        &format!(
                            r#"
                            SELECT {ATTEMPT_COLUMNS}
                              FROM geotrigger.execution_attempts
                             WHERE event_id = $1 AND rule_id = $2 AND wallet = $3
                             ORDER BY matched_at DESC, attempt_id DESC
                             LIMIT 1
                            "#
                        ),
                        &[&key.event_id, &key.rule_id, &key.wallet],
                    )
                    .await
                    .map_err(|error| StoreError::Db(error.to_string()))?
                    .ok_or_else(|| {
                        StoreError::NotFound(format!(
                            "attempt for rule {} and wallet {} in event {}",
                            key.rule_id, key.wallet, key.event_id
                        ))
                    })?;
                TransitionOutcome::Skipped {
                    current: map_attempt_row(&current).map_err(StoreError::Db)?,
                }
            }
        };

        tx.commit()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        Ok(outcome)
    }

    async fn delete_event_if_collectable(
        &self,
        event_id: &str,
        unmatched_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;

        let Some(event) = load_event(&tx, event_id, true).await? else {
            return Ok(false);
        };
        if !event.is_collectable(unmatched_before) {
            tx.commit()
                .await
                .map_err(|error| StoreError::Db(error.to_string()))?;
            return Ok(false);
        }

        tx.execute(
            "DELETE FROM geotrigger.execution_attempts WHERE event_id = $1",
            &[&event_id],
        )
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?;
        tx.execute(
            "DELETE FROM geotrigger.location_events WHERE event_id = $1",
            &[&event_id],
        )
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?;

        tx.commit()
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        Ok(true)
    }

    async fn get_history(
        &self,
        rule_id: RuleId,
        wallet: &str,
    ) -> Result<Option<RuleExecutionHistory>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT rule_id, wallet, window_started_at, window_count, last_execution_at,
                       execution_count
                  FROM geotrigger.rule_execution_history
                 WHERE rule_id = $1 AND wallet = $2
                "#,
                &[&rule_id, &wallet],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_history_row)
            .transpose()
            .map_err(StoreError::Db)
    }

    async fn record_execution(
        &self,
        rule_id: RuleId,
        wallet: &str,
        at: DateTime<Utc>,
        window_seconds: Option<i64>,
    ) -> Result<RuleExecutionHistory, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let window_seconds = window_seconds.filter(|seconds| *seconds > 0);
        let row = client
            .query_one(
                r#"
                INSERT INTO geotrigger.rule_execution_history AS history (
                    rule_id, wallet, window_started_at, window_count, last_execution_at,
                    execution_count
                ) VALUES ($1, $2, $3, 1, $3, 1)
                ON CONFLICT (rule_id, wallet) DO UPDATE SET
                    window_started_at = CASE
                        WHEN $4::BIGINT IS NULL
                          OR EXTRACT(EPOCH FROM ($3 - history.window_started_at)) >= $4::BIGINT
                        THEN $3
                        ELSE history.window_started_at
                    END,
                    window_count = CASE
                        WHEN $4::BIGINT IS NULL
                          OR EXTRACT(EPOCH FROM ($3 - history.window_started_at)) >= $4::BIGINT
                        THEN 1
                        ELSE history.window_count + 1
                    END,
                    last_execution_at = GREATEST(history.last_execution_at, $3),
                    execution_count = history.execution_count + 1
                RETURNING rule_id, wallet, window_started_at, window_count, last_execution_at,
                          execution_count
                "#,
                &[&rule_id, &wallet, &at, &window_seconds],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        map_history_row(&row).map_err(StoreError::Db)
    }

    async fn consume_nonce(
        &self,
        wallet: &str,
        nonce: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let inserted = client
            .execute(
                r#"
                INSERT INTO geotrigger.payload_nonces (wallet, nonce, consumed_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (wallet, nonce) DO NOTHING
                "#,
                &[&wallet, &nonce, &at],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        Ok(inserted == 1)
    }

    async fn registered_signing_key(
        &self,
        wallet: &str,
        contract_address: &str,
    ) -> Result<Option<String>, StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                SELECT public_key
                  FROM geotrigger.passkey_registrations
                 WHERE wallet = $1 AND contract_address = $2
                "#,
                &[&wallet, &contract_address],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        row.map(|row| row.try_get::<_, String>("public_key"))
            .transpose()
            .map_err(|error| StoreError::Db(error.to_string()))
    }

    async fn register_signing_key(
        &self,
        wallet: &str,
        contract_address: &str,
        public_key: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO geotrigger.passkey_registrations (
                    wallet, contract_address, public_key, registered_at
                ) VALUES ($1, $2, $3, $4)
                ON CONFLICT (wallet, contract_address) DO NOTHING
                "#,
                &[&wallet, &contract_address, &public_key, &at],
            )
            .await
            .map_err(|error| StoreError::Db(error.to_string()))?;
        Ok(())
    }
}

fn codes(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

fn prefixed_attempt_columns(alias: &str) -> String {
    ATTEMPT_COLUMNS
        .split(',')
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn status_json(status: &AttemptStatus) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(status).map_err(|error| StoreError::Db(error.to_string()))
}

async fn load_event(
    tx: &tokio_postgres::Transaction<'_>,
    event_id: &str,
    for_update: bool,
) -> Result<Option<LocationEvent>, StoreError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let row = tx
        .query_opt(
            &format!(
                r#"
                SELECT event_id, wallet, user_id, latitude, longitude, received_at, processing_status
                  FROM geotrigger.location_events
                 WHERE event_id = $1{lock}
                "#
            ),
            &[&event_id],
        )
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut event = map_event_row(&row).map_err(StoreError::Db)?;

    let attempt_rows = tx
        .query(
            &format!(
                r#"
                SELECT {ATTEMPT_COLUMNS}
                  FROM geotrigger.execution_attempts
                 WHERE event_id = $1
                 ORDER BY matched_at ASC, attempt_id ASC
                "#
            ),
            &[&event_id],
        )
        .await
        .map_err(|error| StoreError::Db(error.to_string()))?;
    event.attempts = attempt_rows
        .iter()
        .map(map_attempt_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::Db)?;
    Ok(Some(event))
}

fn map_event_row(row: &tokio_postgres::Row) -> Result<LocationEvent, String> {
    let processing_status: String = row
        .try_get("processing_status")
        .map_err(|e| e.to_string())?;
    Ok(LocationEvent {
        event_id: row.try_get("event_id").map_err(|e| e.to_string())?,
        wallet: row.try_get("wallet").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        latitude: row.try_get("latitude").map_err(|e| e.to_string())?,
        longitude: row.try_get("longitude").map_err(|e| e.to_string())?,
        received_at: row.try_get("received_at").map_err(|e| e.to_string())?,
        processing_status: EventProcessingStatus::parse(&processing_status)
            .ok_or_else(|| format!("unknown processing status {processing_status}"))?,
        attempts: Vec::new(),
    })
}

fn map_attempt_row(row: &tokio_postgres::Row) -> Result<ExecutionAttempt, String> {
    let status_json: serde_json::Value =
        row.try_get("status_json").map_err(|e| e.to_string())?;
    Ok(ExecutionAttempt {
        attempt_id: row.try_get("attempt_id").map_err(|e| e.to_string())?,
        event_id: row.try_get("event_id").map_err(|e| e.to_string())?,
        rule_id: row.try_get("rule_id").map_err(|e| e.to_string())?,
        wallet: row.try_get("wallet").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        status: serde_json::from_value(status_json).map_err(|e| e.to_string())?,
        matched_at: row.try_get("matched_at").map_err(|e| e.to_string())?,
        updated_at: row.try_get("updated_at").map_err(|e| e.to_string())?,
    })
}

fn map_history_row(row: &tokio_postgres::Row) -> Result<RuleExecutionHistory, String> {
    Ok(RuleExecutionHistory {
        rule_id: row.try_get("rule_id").map_err(|e| e.to_string())?,
        wallet: row.try_get("wallet").map_err(|e| e.to_string())?,
        window_started_at: row
            .try_get("window_started_at")
            .map_err(|e| e.to_string())?,
        window_count: row.try_get("window_count").map_err(|e| e.to_string())?,
        last_execution_at: row
            .try_get("last_execution_at")
            .map_err(|e| e.to_string())?,
        execution_count: row
            .try_get("execution_count")
            .map_err(|e| e.to_string())?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::execution::types::{PendingReason, RejectReason, SupersedeReason};

    async fn seeded(store: &Arc<dyn ExecutionStore>, event_id: &str, at: DateTime<Utc>) {
        store
            .append_event(NewLocationEvent {
                event_id: event_id.to_string(),
                wallet: "W".to_string(),
                user_id: Some("user-1".to_string()),
                latitude: 40.0,
                longitude: -73.0,
                received_at: at,
            })
            .await
            .expect("append event");
    }

    fn key(event_id: &str) -> AttemptKey {
        AttemptKey {
            event_id: event_id.to_string(),
            rule_id: 5,
            wallet: "W".to_string(),
        }
    }

    #[tokio::test]
    async fn second_live_attempt_for_same_key_returns_the_first() {
        let store = memory();
        let now = Utc::now();
        seeded(&store, "evt-1", now).await;

        let first = store
            .append_attempt(ExecutionAttempt::new("evt-1", 5, "W", None, PendingReason::RequiresWebauthn, now))
            .await
            .expect("append first");
        let second = store
            .append_attempt(ExecutionAttempt::new("evt-1", 5, "W", None, PendingReason::RequiresWebauthn, now))
            .await
            .expect("append second");

        assert!(matches!(first, AppendOutcome::Appended(_)));
        assert!(matches!(second, AppendOutcome::Existing(_)));
        assert_eq!(first.attempt().attempt_id, second.attempt().attempt_id);

        let event = store.get_event("evt-1").await.expect("get").expect("event");
        assert_eq!(event.processing_status, EventProcessingStatus::Matched);
        assert_eq!(event.attempts.len(), 1);
    }

    #[tokio::test]
    async fn keyset_pages_visit_every_attempt_once() {
        let store = memory();
        let now = Utc::now();
        for (index, event_id) in ["evt-a", "evt-b", "evt-c"].iter().enumerate() {
            let at = now - Duration::minutes(10 - index as i64);
            seeded(&store, event_id, at).await;
            store
                .append_attempt(ExecutionAttempt::new(event_id, 5, "W", None, PendingReason::RequiresWebauthn, at))
                .await
                .expect("append");
        }

        for (order, expected) in [
            (PageOrder::OldestFirst, ["evt-a", "evt-b", "evt-c"]),
            (PageOrder::NewestFirst, ["evt-c", "evt-b", "evt-a"]),
        ] {
            let mut cursor: Option<AttemptCursor> = None;
            let mut visited = Vec::new();
            loop {
                let page = store
                    .page_attempts(order, cursor.as_ref(), 2)
                    .await
                    .expect("page");
                visited.extend(page.iter().map(|attempt| attempt.event_id.clone()));
                if page.len() < 2 {
                    break;
                }
                cursor = page.last().map(AttemptCursor::at);
            }
            assert_eq!(visited, expected);
        }

        let first = store.list_events(None, 2).await.expect("events");
        let rest = store
            .list_events(first.last().map(EventCursor::at).as_ref(), 2)
            .await
            .expect("events");
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].event_id, "evt-c");
    }

    #[tokio::test]
    async fn guarded_transition_skips_when_state_moved_on() {
        let store = memory();
        let now = Utc::now();
        seeded(&store, "evt-1", now).await;
        store
            .append_attempt(ExecutionAttempt::new("evt-1", 5, "W", None, PendingReason::RequiresWebauthn, now))
            .await
            .expect("append");

        let rejected = store
            .transition(
                &key("evt-1"),
                status_code::PENDING,
                AttemptStatus::Rejected {
                    reason: RejectReason::UserDeclined,
                    rejected_at: now,
                },
                now,
            )
            .await
            .expect("reject");
        assert!(matches!(rejected, TransitionOutcome::Applied(_)));

        let again = store
            .transition(
                &key("evt-1"),
                status_code::PENDING,
                AttemptStatus::Superseded {
                    reason: SupersedeReason::RetentionExpired,
                    superseded_at: now,
                },
                now,
            )
            .await
            .expect("second transition");
        match again {
            TransitionOutcome::Skipped { current } => {
                assert_eq!(current.status.code(), status_code::REJECTED);
            }
            other => panic!("expected skip, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn completed_and_rejected_ignore_even_permissive_guards() {
        let store = memory();
        let now = Utc::now();
        seeded(&store, "evt-1", now).await;
        store
            .append_attempt(ExecutionAttempt::new("evt-1", 5, "W", None, PendingReason::RequiresWebauthn, now))
            .await
            .expect("append");
        store
            .transition(
                &key("evt-1"),
                status_code::PENDING,
                AttemptStatus::Completed {
                    transaction_hash: "tx-1".to_string(),
                    completed_at: now,
                },
                now,
            )
            .await
            .expect("complete");

        let outcome = store
            .transition(
                &key("evt-1"),
                &[status_code::COMPLETED],
                AttemptStatus::pending(PendingReason::RequiresWebauthn),
                now,
            )
            .await
            .expect("attempt rewrite");
        assert!(matches!(outcome, TransitionOutcome::Skipped { .. }));

        let event = store.get_event("evt-1").await.expect("get").expect("event");
        assert_eq!(event.processing_status, EventProcessingStatus::Executed);
        assert_eq!(event.attempts[0].status.transaction_hash(), Some("tx-1"));
    }

    #[tokio::test]
    async fn transition_on_unknown_key_is_not_found() {
        let store = memory();
        seeded(&store, "evt-1", Utc::now()).await;
        let result = store
            .transition(
                &key("evt-1"),
                status_code::PENDING,
                AttemptStatus::pending(PendingReason::RequiresWebauthn),
                Utc::now(),
            )
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_respects_collectable_predicate() {
        let store = memory();
        let now = Utc::now();
        seeded(&store, "evt-live", now).await;
        store
            .append_attempt(ExecutionAttempt::new("evt-live", 5, "W", None, PendingReason::RequiresWebauthn, now))
            .await
            .expect("append");
        assert!(!store
            .delete_event_if_collectable("evt-live", now)
            .await
            .expect("delete live"));

        seeded(&store, "evt-unmatched", now - Duration::days(8)).await;
        assert!(store
            .delete_event_if_collectable("evt-unmatched", now - Duration::days(7))
            .await
            .expect("delete unmatched"));
        assert!(store.get_event("evt-unmatched").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn nonces_and_signing_keys_are_first_write_wins() {
        let store = memory();
        let now = Utc::now();
        assert!(store.consume_nonce("W", "n-1", now).await.expect("nonce"));
        assert!(!store.consume_nonce("W", "n-1", now).await.expect("nonce replay"));
        assert!(store.consume_nonce("V", "n-1", now).await.expect("other wallet"));

        store
            .register_signing_key("W", "CCONTRACT", "04aa", now)
            .await
            .expect("register");
        store
            .register_signing_key("W", "CCONTRACT", "04bb", now)
            .await
            .expect("register again");
        assert_eq!(
            store
                .registered_signing_key("W", "CCONTRACT")
                .await
                .expect("lookup")
                .as_deref(),
            Some("04aa")
        );
    }

    #[tokio::test]
    async fn event_replay_with_other_wallet_conflicts() {
        let store = memory();
        let now = Utc::now();
        seeded(&store, "evt-1", now).await;
        let replay = store
            .append_event(NewLocationEvent {
                event_id: "evt-1".to_string(),
                wallet: "OTHER".to_string(),
                user_id: None,
                latitude: 0.0,
                longitude: 0.0,
                received_at: now,
            })
            .await;
        assert!(matches!(replay, Err(StoreError::Conflict(_))));
    }
}
