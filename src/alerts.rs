use crate::collector::CollectTick;
use crate::notify::{Alert, AlertSink, Severity};
use crate::store::{EpochRecord, EpochStore, StoreError};
use serde_json::json;

/// 1 NIBI in unibi.
pub const ONE_NIBI: u64 = 1_000_000;
/// 0.1 NIBI in unibi.
pub const ZERO_POINT_ONE_NIBI: u64 = 100_000;

pub const CONSECUTIVE_MISS_THRESHOLD: u64 = 3;
pub const TOTAL_UNSIGNED_THRESHOLD: u64 = 10;
pub const CRITICAL_UNSIGNED_THRESHOLD: u64 = 20;

pub const MISS_COUNTER_P3_THRESHOLD: u64 = 10;
pub const MISS_COUNTER_P2_THRESHOLD: u64 = 25;
pub const MISS_COUNTER_P1_THRESHOLD: u64 = 50;

pub const API_CONSECUTIVE_MISS_THRESHOLD: u64 = 3;

/// Deduplicating alert evaluator.
///
/// Latches that must survive a restart live in the epoch row
/// (`*_executed` columns); the once-per-epoch signing and API flags live
/// here and are re-derived from the stored counters on startup, so a restart
/// neither re-fires an already-latched alert nor forgets a live streak.
///
/// Owned by the supervisor and borrowed by the monitor loop; nothing else
/// touches it.
#[derive(Debug)]
pub struct AlertEngine {
    last_alert_epoch: Option<u64>,
    consecutive_misses: u64,
    api_consecutive_misses: u64,
    consecutive_alert_sent: bool,
    total_alert_sent: bool,
    critical_alert_sent: bool,
    healthy_api_missing_sent: bool,
}

impl AlertEngine {
    pub fn new() -> Self {
        Self {
            last_alert_epoch: None,
            consecutive_misses: 0,
            api_consecutive_misses: 0,
            consecutive_alert_sent: false,
            total_alert_sent: false,
            critical_alert_sent: false,
            healthy_api_missing_sent: false,
        }
    }

    /// Re-seeds the in-memory state from the newest stored epoch row.
    pub fn restore(store: &EpochStore) -> Result<Self, StoreError> {
        let epoch = match store.last_epoch() {
            Ok(epoch) => epoch,
            Err(StoreError::Empty) => return Ok(Self::new()),
            Err(err) => return Err(err),
        };
        let record = store.get(epoch)?;
        tracing::info!(
            epoch,
            consecutive_misses = record.consecutive_misses,
            api_cons_miss = record.api_cons_miss,
            "restored alert state from database"
        );
        Ok(Self {
            last_alert_epoch: Some(epoch),
            consecutive_misses: record.consecutive_misses,
            api_consecutive_misses: record.api_cons_miss,
            // A counter at or past its threshold means the alert already
            // went out before the restart.
            consecutive_alert_sent: record.consecutive_misses >= CONSECUTIVE_MISS_THRESHOLD,
            total_alert_sent: record.unsigned_oracle_events >= TOTAL_UNSIGNED_THRESHOLD,
            critical_alert_sent: record.unsigned_oracle_events >= CRITICAL_UNSIGNED_THRESHOLD,
            healthy_api_missing_sent: record.api_cons_miss >= API_CONSECUTIVE_MISS_THRESHOLD,
        })
    }

    /// Runs every alert family for one collected tick. The record must be
    /// the row the reducer just wrote for the tick's epoch.
    pub async fn evaluate(
        &mut self,
        tick: &CollectTick,
        record: EpochRecord,
        store: &EpochStore,
        sink: &AlertSink,
    ) -> Result<(), StoreError> {
        let mut record = record;
        self.roll_epoch(tick.current_epoch);
        self.balance_alerts(tick, &mut record, store, sink).await?;
        self.signing_alerts(tick, &record, store, sink).await?;
        self.miss_counter_alerts(&record, store, sink).await?;
        Ok(())
    }

    /// Once-per-epoch flags and the consecutive streak reset on rollover;
    /// balance latches do not (they are not epoch-scoped).
    fn roll_epoch(&mut self, epoch: u64) {
        if self.last_alert_epoch != Some(epoch) {
            self.consecutive_misses = 0;
            self.consecutive_alert_sent = false;
            self.total_alert_sent = false;
            self.critical_alert_sent = false;
            self.healthy_api_missing_sent = false;
            self.last_alert_epoch = Some(epoch);
        }
    }

    async fn balance_alerts(
        &mut self,
        tick: &CollectTick,
        record: &mut EpochRecord,
        store: &EpochStore,
        sink: &AlertSink,
    ) -> Result<(), StoreError> {
        let balance = tick.wallet_balance;
        let epoch = tick.current_epoch;
        let details = json!({
            "wallet_balance": balance.to_string(),
            "denom": "unibi",
        });

        if balance < ONE_NIBI && !record.small_balance_alert_executed {
            store.set_field(epoch, "small_balance_alert_executed", 1)?;
            record.small_balance_alert_executed = true;
            sink.dispatch(&Alert::new(
                Severity::Critical,
                "Price feeder wallet balance has less than 1 NIBI!",
                details.clone(),
            ))
            .await;
        }
        if balance < ZERO_POINT_ONE_NIBI && !record.very_small_balance_alert_executed {
            store.set_field(epoch, "very_small_balance_alert_executed", 1)?;
            record.very_small_balance_alert_executed = true;
            sink.dispatch(&Alert::new(
                Severity::Critical,
                "Price feeder wallet balance has less than 0.1 NIBI!",
                details.clone(),
            ))
            .await;
        }
        if balance >= ONE_NIBI && record.small_balance_alert_executed {
            store.set_field(epoch, "small_balance_alert_executed", 0)?;
            record.small_balance_alert_executed = false;
            sink.dispatch(&Alert::new(
                Severity::Info,
                "Price feeder wallet balance has more than 1 NIBI!",
                details.clone(),
            ))
            .await;
        }
        if balance >= ZERO_POINT_ONE_NIBI && record.very_small_balance_alert_executed {
            store.set_field(epoch, "very_small_balance_alert_executed", 0)?;
            record.very_small_balance_alert_executed = false;
            sink.dispatch(&Alert::new(
                Severity::Info,
                "Price feeder wallet balance has more than 0.1 NIBI!",
                details,
            ))
            .await;
        }
        Ok(())
    }

    async fn signing_alerts(
        &mut self,
        tick: &CollectTick,
        record: &EpochRecord,
        store: &EpochStore,
        sink: &AlertSink,
    ) -> Result<(), StoreError> {
        if tick.signed_this_tick {
            self.consecutive_misses = 0;
        } else {
            self.consecutive_misses += 1;
        }

        let total_misses = record.unsigned_oracle_events;
        if self.consecutive_misses >= CONSECUTIVE_MISS_THRESHOLD && !self.consecutive_alert_sent {
            self.consecutive_alert_sent = true;
            sink.dispatch(&Alert::new(
                Severity::Critical,
                format!(
                    "{} consecutive unsigned events detected",
                    self.consecutive_misses
                ),
                json!({
                    "consecutive_misses": self.consecutive_misses,
                    "slash_epoch": tick.current_epoch,
                }),
            ))
            .await;
        }
        if total_misses >= TOTAL_UNSIGNED_THRESHOLD && !self.total_alert_sent {
            self.total_alert_sent = true;
            sink.dispatch(&Alert::new(
                Severity::Critical,
                format!("Total unsigned events ({total_misses}) exceeded threshold"),
                json!({
                    "unsigned_oracle_events": total_misses,
                    "slash_epoch": tick.current_epoch,
                }),
            ))
            .await;
        }
        if total_misses >= CRITICAL_UNSIGNED_THRESHOLD && !self.critical_alert_sent {
            self.critical_alert_sent = true;
            sink.dispatch(&Alert::new(
                Severity::Critical,
                format!("CRITICAL: Unsigned events ({total_misses}) at critical level"),
                json!({
                    "unsigned_oracle_events": total_misses,
                    "slash_epoch": tick.current_epoch,
                }),
            ))
            .await;
        }

        store.set_field(
            tick.current_epoch,
            "consecutive_misses",
            self.consecutive_misses as i64,
        )?;
        Ok(())
    }

    async fn miss_counter_alerts(
        &mut self,
        record: &EpochRecord,
        store: &EpochStore,
        sink: &AlertSink,
    ) -> Result<(), StoreError> {
        let miss_counter = record.miss_counter_events;
        let epoch = record.slash_epoch;
        let details = json!({
            "miss_counter": miss_counter,
            "slash_epoch": epoch,
        });

        if miss_counter > MISS_COUNTER_P3_THRESHOLD && !record.miss_counter_p3_executed {
            store.set_field(epoch, "miss_counter_p3_executed", 1)?;
            sink.dispatch(&Alert::new(
                Severity::Warning,
                format!("Validator miss counter exceeded {MISS_COUNTER_P3_THRESHOLD} ({miss_counter})"),
                details.clone(),
            ))
            .await;
        }
        if miss_counter > MISS_COUNTER_P2_THRESHOLD && !record.miss_counter_p2_executed {
            store.set_field(epoch, "miss_counter_p2_executed", 1)?;
            sink.dispatch(&Alert::new(
                Severity::Critical,
                format!("Validator miss counter exceeded {MISS_COUNTER_P2_THRESHOLD} ({miss_counter})"),
                details.clone(),
            ))
            .await;
        }
        if miss_counter > MISS_COUNTER_P1_THRESHOLD && !record.miss_counter_p1_executed {
            store.set_field(epoch, "miss_counter_p1_executed", 1)?;
            sink.dispatch(&Alert::new(
                Severity::Critical,
                format!("Validator miss counter exceeded {MISS_COUNTER_P1_THRESHOLD} ({miss_counter})"),
                details,
            ))
            .await;
        }
        Ok(())
    }

    /// Feeds the API-down state machine. Called once per tick: with
    /// `healthy = false` when the probe found no usable endpoint, with
    /// `healthy = true` otherwise.
    pub async fn record_api_status(
        &mut self,
        healthy: bool,
        store: &EpochStore,
        sink: &AlertSink,
    ) -> Result<(), StoreError> {
        if !healthy {
            self.api_consecutive_misses += 1;
            tracing::warn!(
                consecutive = self.api_consecutive_misses,
                "tick skipped: no healthy API endpoint"
            );
            if self.api_consecutive_misses >= API_CONSECUTIVE_MISS_THRESHOLD
                && !self.healthy_api_missing_sent
            {
                self.healthy_api_missing_sent = true;
                sink.dispatch(&Alert::new(
                    Severity::Critical,
                    "API not working!",
                    json!({ "consecutive_failed_probes": self.api_consecutive_misses }),
                ))
                .await;
            }
        } else {
            if self.api_consecutive_misses >= API_CONSECUTIVE_MISS_THRESHOLD
                && self.healthy_api_missing_sent
            {
                sink.dispatch(&Alert::new(
                    Severity::Info,
                    "API working again!",
                    json!({ "failed_probes_before_recovery": self.api_consecutive_misses }),
                ))
                .await;
            }
            self.api_consecutive_misses = 0;
            self.healthy_api_missing_sent = false;
        }

        match store.last_epoch() {
            Ok(epoch) => {
                store.set_field(epoch, "api_cons_miss", self.api_consecutive_misses as i64)?
            }
            // Nothing collected yet; there is no row to annotate.
            Err(StoreError::Empty) => {}
            Err(err) => return Err(err),
        }
        Ok(())
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::AlertChannel;
    use crate::reducer;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    struct RecordingChannel {
        alerts: Arc<Mutex<Vec<Alert>>>,
    }

    #[async_trait]
    impl AlertChannel for RecordingChannel {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, alert: &Alert) -> eyre::Result<()> {
            self.alerts.lock().unwrap().push(alert.clone());
            Ok(())
        }
    }

    fn recording_sink() -> (AlertSink, Arc<Mutex<Vec<Alert>>>) {
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let sink = AlertSink::new(vec![Box::new(RecordingChannel {
            alerts: alerts.clone(),
        })]);
        (sink, alerts)
    }

    fn tick(epoch: u64, signed: bool, balance: u64) -> CollectTick {
        CollectTick {
            endpoint: "https://lcd.example.com".to_owned(),
            miss_counter: 0,
            signed_this_tick: signed,
            current_epoch: epoch,
            wallet_balance: balance,
        }
    }

    async fn run_tick(
        engine: &mut AlertEngine,
        store: &EpochStore,
        sink: &AlertSink,
        tick: &CollectTick,
    ) {
        let record = reducer::apply(store, tick).unwrap();
        engine.evaluate(tick, record, store, sink).await.unwrap();
    }

    #[tokio::test]
    async fn signed_ticks_raise_no_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::ensure(dir.path()).unwrap();
        let (sink, alerts) = recording_sink();
        let mut engine = AlertEngine::new();

        run_tick(&mut engine, &store, &sink, &tick(2, true, 5_000_000)).await;
        assert!(alerts.lock().unwrap().is_empty());
        let record = store.get(2).unwrap();
        assert_eq!(record.consecutive_misses, 0);
        assert_eq!(record.unsigned_oracle_events, 0);
    }

    #[tokio::test]
    async fn consecutive_unsigned_streak_alerts_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::ensure(dir.path()).unwrap();
        let (sink, alerts) = recording_sink();
        let mut engine = AlertEngine::new();

        run_tick(&mut engine, &store, &sink, &tick(2, true, 5_000_000)).await;
        for _ in 0..3 {
            run_tick(&mut engine, &store, &sink, &tick(2, false, 5_000_000)).await;
        }

        let sent = alerts.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Critical);
        assert_eq!(sent[0].summary, "3 consecutive unsigned events detected");
        drop(sent);

        let record = store.get(2).unwrap();
        assert_eq!(record.consecutive_misses, 3);
        assert_eq!(record.unsigned_oracle_events, 3);

        // A fourth unsigned tick extends the streak but stays silent.
        run_tick(&mut engine, &store, &sink, &tick(2, false, 5_000_000)).await;
        assert_eq!(alerts.lock().unwrap().len(), 1);
        assert_eq!(store.get(2).unwrap().consecutive_misses, 4);
    }

    #[tokio::test]
    async fn signed_tick_resets_the_streak() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::ensure(dir.path()).unwrap();
        let (sink, alerts) = recording_sink();
        let mut engine = AlertEngine::new();

        run_tick(&mut engine, &store, &sink, &tick(2, true, 5_000_000)).await;
        run_tick(&mut engine, &store, &sink, &tick(2, false, 5_000_000)).await;
        run_tick(&mut engine, &store, &sink, &tick(2, false, 5_000_000)).await;
        run_tick(&mut engine, &store, &sink, &tick(2, true, 5_000_000)).await;
        run_tick(&mut engine, &store, &sink, &tick(2, false, 5_000_000)).await;

        assert!(alerts.lock().unwrap().is_empty());
        assert_eq!(store.get(2).unwrap().consecutive_misses, 1);
        assert_eq!(store.get(2).unwrap().unsigned_oracle_events, 3);
    }

    #[tokio::test]
    async fn total_unsigned_thresholds_fire_once_each() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::ensure(dir.path()).unwrap();
        let (sink, alerts) = recording_sink();
        let mut engine = AlertEngine::new();

        run_tick(&mut engine, &store, &sink, &tick(2, true, 5_000_000)).await;
        for _ in 0..25 {
            run_tick(&mut engine, &store, &sink, &tick(2, false, 5_000_000)).await;
        }

        let sent = alerts.lock().unwrap();
        let summaries: Vec<&str> = sent.iter().map(|alert| alert.summary.as_str()).collect();
        assert_eq!(
            summaries,
            vec![
                "3 consecutive unsigned events detected",
                "Total unsigned events (10) exceeded threshold",
                "CRITICAL: Unsigned events (20) at critical level",
            ]
        );
    }

    #[tokio::test]
    async fn balance_drop_and_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::ensure(dir.path()).unwrap();
        let (sink, alerts) = recording_sink();
        let mut engine = AlertEngine::new();

        // Below 1 NIBI but above 0.1 NIBI: one critical.
        run_tick(&mut engine, &store, &sink, &tick(2, true, 900_000)).await;
        {
            let sent = alerts.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].severity, Severity::Critical);
            assert_eq!(
                sent[0].summary,
                "Price feeder wallet balance has less than 1 NIBI!"
            );
        }
        assert!(store.get(2).unwrap().small_balance_alert_executed);
        assert!(!store.get(2).unwrap().very_small_balance_alert_executed);

        // Repeat tick at the same level: latched, no duplicate.
        run_tick(&mut engine, &store, &sink, &tick(2, true, 900_000)).await;
        assert_eq!(alerts.lock().unwrap().len(), 1);

        // Recovery: one info, latch cleared.
        run_tick(&mut engine, &store, &sink, &tick(2, true, 1_500_000)).await;
        {
            let sent = alerts.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[1].severity, Severity::Info);
            assert_eq!(
                sent[1].summary,
                "Price feeder wallet balance has more than 1 NIBI!"
            );
        }
        assert!(!store.get(2).unwrap().small_balance_alert_executed);

        // Deep drop: both thresholds cross, two criticals.
        run_tick(&mut engine, &store, &sink, &tick(2, true, 50_000)).await;
        {
            let sent = alerts.lock().unwrap();
            assert_eq!(sent.len(), 4);
            assert_eq!(
                sent[2].summary,
                "Price feeder wallet balance has less than 1 NIBI!"
            );
            assert_eq!(
                sent[3].summary,
                "Price feeder wallet balance has less than 0.1 NIBI!"
            );
        }
        let record = store.get(2).unwrap();
        assert!(record.small_balance_alert_executed);
        assert!(record.very_small_balance_alert_executed);
    }

    #[tokio::test]
    async fn epoch_rollover_carries_balance_latches_and_resets_signing_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::ensure(dir.path()).unwrap();
        let (sink, alerts) = recording_sink();
        let mut engine = AlertEngine::new();

        // Epoch 5: drained wallet and a live two-tick streak.
        run_tick(&mut engine, &store, &sink, &tick(5, true, 50_000)).await;
        run_tick(&mut engine, &store, &sink, &tick(5, false, 50_000)).await;
        run_tick(&mut engine, &store, &sink, &tick(5, false, 50_000)).await;
        let before = store.get(5).unwrap();
        assert!(before.small_balance_alert_executed);
        assert!(before.very_small_balance_alert_executed);
        assert_eq!(before.consecutive_misses, 2);
        alerts.lock().unwrap().clear();

        // First tick of epoch 6: topped-up wallet, signed.
        run_tick(&mut engine, &store, &sink, &tick(6, true, 1_500_000)).await;
        let sent = alerts.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|alert| alert.severity == Severity::Info));
        drop(sent);

        let record = store.get(6).unwrap();
        assert!(!record.small_balance_alert_executed);
        assert!(!record.very_small_balance_alert_executed);
        assert_eq!(record.consecutive_misses, 0);
        assert_eq!(record.unsigned_oracle_events, 0);
        assert!(!record.miss_counter_p1_executed);
        assert!(!record.miss_counter_p2_executed);
        assert!(!record.miss_counter_p3_executed);
    }

    #[tokio::test]
    async fn miss_counter_tiers_latch_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::ensure(dir.path()).unwrap();
        let (sink, alerts) = recording_sink();
        let mut engine = AlertEngine::new();

        let mut high_miss = tick(2, true, 5_000_000);
        high_miss.miss_counter = 60;
        run_tick(&mut engine, &store, &sink, &high_miss).await;

        let sent = alerts.lock().unwrap();
        let summaries: Vec<&str> = sent.iter().map(|alert| alert.summary.as_str()).collect();
        assert_eq!(
            summaries,
            vec![
                "Validator miss counter exceeded 10 (60)",
                "Validator miss counter exceeded 25 (60)",
                "Validator miss counter exceeded 50 (60)",
            ]
        );
        assert_eq!(sent[0].severity, Severity::Warning);
        assert_eq!(sent[1].severity, Severity::Critical);
        drop(sent);

        let record = store.get(2).unwrap();
        assert!(record.miss_counter_p1_executed);
        assert!(record.miss_counter_p2_executed);
        assert!(record.miss_counter_p3_executed);

        // Same epoch, counter still high: all latched.
        run_tick(&mut engine, &store, &sink, &high_miss).await;
        assert_eq!(alerts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn api_down_alerts_after_three_misses_and_recovers_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::ensure(dir.path()).unwrap();
        let (sink, alerts) = recording_sink();
        let mut engine = AlertEngine::new();

        run_tick(&mut engine, &store, &sink, &tick(2, true, 5_000_000)).await;

        for _ in 0..2 {
            engine.record_api_status(false, &store, &sink).await.unwrap();
        }
        assert!(alerts.lock().unwrap().is_empty());

        engine.record_api_status(false, &store, &sink).await.unwrap();
        {
            let sent = alerts.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].summary, "API not working!");
            assert_eq!(sent[0].severity, Severity::Critical);
        }
        assert_eq!(store.get(2).unwrap().api_cons_miss, 3);

        // Further outage ticks stay silent.
        engine.record_api_status(false, &store, &sink).await.unwrap();
        assert_eq!(alerts.lock().unwrap().len(), 1);
        assert_eq!(store.get(2).unwrap().api_cons_miss, 4);

        // Recovery fires exactly once and resets the counter.
        engine.record_api_status(true, &store, &sink).await.unwrap();
        {
            let sent = alerts.lock().unwrap();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[1].summary, "API working again!");
            assert_eq!(sent[1].severity, Severity::Info);
        }
        assert_eq!(store.get(2).unwrap().api_cons_miss, 0);

        engine.record_api_status(true, &store, &sink).await.unwrap();
        assert_eq!(alerts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn api_down_before_any_row_exists_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::ensure(dir.path()).unwrap();
        let (sink, alerts) = recording_sink();
        let mut engine = AlertEngine::new();

        for _ in 0..3 {
            engine.record_api_status(false, &store, &sink).await.unwrap();
        }
        assert_eq!(alerts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restart_does_not_repeat_latched_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let store = EpochStore::ensure(dir.path()).unwrap();
        let (sink, alerts) = recording_sink();

        // Simulate state left behind by a previous run: a long streak and a
        // total already past both thresholds.
        let mut engine = AlertEngine::new();
        run_tick(&mut engine, &store, &sink, &tick(2, true, 5_000_000)).await;
        for _ in 0..20 {
            run_tick(&mut engine, &store, &sink, &tick(2, false, 5_000_000)).await;
        }
        alerts.lock().unwrap().clear();
        drop(engine);

        let mut engine = AlertEngine::restore(&store).unwrap();
        run_tick(&mut engine, &store, &sink, &tick(2, false, 5_000_000)).await;
        assert!(alerts.lock().unwrap().is_empty());
    }
}
