use crate::collector::CollectTick;
use crate::store::{EpochRecord, EpochStore, StoreError};

/// Folds one collected tick into the epoch store and returns the row as
/// written.
///
/// Same-epoch ticks update the existing row in place; the alert latches and
/// the running miss counters are left untouched here because the alert
/// engine owns them. The first tick of a new epoch inserts a fresh row,
/// carrying over only what is not epoch-scoped: the balance latches and the
/// consecutive-miss streak.
pub fn apply(store: &EpochStore, tick: &CollectTick) -> Result<EpochRecord, StoreError> {
    let record = if store.exists(tick.current_epoch)? {
        let current = store.get(tick.current_epoch)?;
        let unsigned_delta = u64::from(!tick.signed_this_tick);
        EpochRecord {
            miss_counter_events: tick.miss_counter,
            unsigned_oracle_events: current.unsigned_oracle_events + unsigned_delta,
            price_feed_addr_balance: tick.wallet_balance,
            ..current
        }
    } else {
        let carryover = if tick.current_epoch > 0 && store.exists(tick.current_epoch - 1)? {
            let previous = store.get(tick.current_epoch - 1)?;
            tracing::info!(
                epoch = tick.current_epoch,
                previous = previous.slash_epoch,
                "new slash epoch; carrying over balance latches"
            );
            Some(previous)
        } else {
            None
        };
        EpochRecord {
            slash_epoch: tick.current_epoch,
            miss_counter_events: tick.miss_counter,
            miss_counter_p1_executed: false,
            miss_counter_p2_executed: false,
            miss_counter_p3_executed: false,
            unsigned_oracle_events: 0,
            price_feed_addr_balance: tick.wallet_balance,
            small_balance_alert_executed: carryover
                .as_ref()
                .is_some_and(|previous| previous.small_balance_alert_executed),
            very_small_balance_alert_executed: carryover
                .as_ref()
                .is_some_and(|previous| previous.very_small_balance_alert_executed),
            consecutive_misses: carryover
                .as_ref()
                .map_or(0, |previous| previous.consecutive_misses),
            api_cons_miss: 0,
        }
    };
    store.upsert(&record)?;
    Ok(record)
}
