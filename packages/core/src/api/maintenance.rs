// Фоновое обслуживание ключей и сессий
//
// Каждый шаг fail-soft: ошибка логируется, следующий запуск повторит.

use super::MessengerCore;
use crate::crypto::CryptoProvider;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Что сделал один проход обслуживания
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub signed_prekey_rotated: bool,
    pub one_time_prekeys_generated: usize,
    pub published: bool,
    pub skipped_keys_removed: usize,
}

impl<P: CryptoProvider> MessengerCore<P> {
    /// Ротация signed pre-key, пополнение one-time pre-keys, публикация,
    /// очистка устаревших skipped message keys
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let keys = self.keys();
        if !keys.is_loaded() {
            debug!(target: "api", "Identity not loaded, skipping maintenance");
            return report;
        }

        report.signed_prekey_rotated = keys.rotate_signed_prekey_if_due();

        match keys.needs_refill() {
            Ok(true) => match keys.refill_one_time_prekeys() {
                Ok(generated) => report.one_time_prekeys_generated = generated,
                Err(e) => warn!(target: "api", error = %e, "One-time pre-key refill failed"),
            },
            Ok(false) => {}
            Err(e) => warn!(target: "api", error = %e, "Cannot count one-time pre-keys"),
        }

        let changed = report.signed_prekey_rotated || report.one_time_prekeys_generated > 0;
        if changed || self.publish_pending.load(Ordering::SeqCst) {
            match self.publish_prekeys().await {
                Ok(()) => report.published = true,
                Err(e) => warn!(target: "api", error = %e, "Pre-key publication failed, will retry"),
            }
        }

        match self
            .sessions()
            .cleanup_skipped_keys(self.config.max_skipped_message_age_seconds)
        {
            Ok(removed) => report.skipped_keys_removed = removed,
            Err(e) => warn!(target: "api", error = %e, "Skipped key cleanup failed"),
        }

        if report != MaintenanceReport::default() {
            info!(target: "api", report = ?report, "Maintenance pass finished");
        }
        report
    }

    /// Запускать обслуживание по таймеру, пока жив хотя бы один Arc на ядро
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let core: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_secs(self.config.maintenance_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(core) = core.upgrade() else {
                    break;
                };
                core.run_maintenance().await;
            }
            debug!(target: "api", "Maintenance task stopped");
        })
    }
}
