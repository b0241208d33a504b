//! Live transfer registry.
//!
//! Every byte pump registers itself here and updates its row per chunk;
//! `/active-transfers` takes a consistent snapshot of scalar fields.
//! Terminal rows linger for a few seconds so a polling dashboard catches
//! the final state, then a timer removes them.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::util::now_secs;

/// How long a completed/errored/disconnected row stays visible.
pub const TERMINAL_LINGER_SECS: u64 = 5;
/// Rows without updates for this long are swept during snapshots.
const STALE_SWEEP_SECS: u64 = 30;
/// Transfer detail rows returned per snapshot.
const SNAPSHOT_DETAIL_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Active,
    Completed,
    Error,
    Disconnected,
}

#[derive(Debug, Clone)]
struct TransferRow {
    file_path: String,
    full_path: String,
    file_type: String,
    client_ip: String,
    uid: String,
    session_id: Option<String>,
    started: Instant,
    start_ts: i64,
    last_update: Instant,
    bytes_transferred: u64,
    total_size: Option<u64>,
    speed_bps: f64,
    status: TransferStatus,
    first_byte_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub transfer_id: String,
    pub file_path: String,
    pub full_path: String,
    pub file_type: String,
    pub client_ip: String,
    pub uid: String,
    pub session_id: Option<String>,
    pub status: TransferStatus,
    pub start_time: i64,
    pub elapsed_secs: f64,
    pub bytes_transferred: u64,
    pub total_size: Option<u64>,
    pub speed_bps: f64,
    pub progress_percent: Option<f64>,
    pub first_byte_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub active_transfers: usize,
    pub completed_transfers: usize,
    pub total_tracked_transfers: usize,
    pub total_speed_bps: f64,
    pub timestamp: i64,
    pub transfers: Vec<TransferSnapshot>,
}

#[derive(Default)]
pub struct TransferRegistry {
    rows: Arc<DashMap<String, TransferRow>>,
}

impl TransferRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { rows: Arc::new(DashMap::new()) })
    }

    /// Register a starting transfer and get its id.
    #[allow(clippy::too_many_arguments)]
    pub fn begin(
        &self,
        file_path: &str,
        full_path: &str,
        file_type: &str,
        client_ip: &str,
        uid: &str,
        session_id: Option<&str>,
        total_size: Option<u64>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        self.rows.insert(
            id.clone(),
            TransferRow {
                file_path: file_path.to_string(),
                full_path: full_path.to_string(),
                file_type: file_type.to_string(),
                client_ip: client_ip.to_string(),
                uid: uid.to_string(),
                session_id: session_id.map(str::to_owned),
                started: now,
                start_ts: now_secs(),
                last_update: now,
                bytes_transferred: 0,
                total_size,
                speed_bps: 0.0,
                status: TransferStatus::Active,
                first_byte_latency_ms: None,
            },
        );
        id
    }

    /// Per-chunk progress update. Speed is cumulative bytes over elapsed
    /// time since the pump started.
    pub fn update(&self, id: &str, bytes_transferred: u64) {
        if let Some(mut row) = self.rows.get_mut(id) {
            let now = Instant::now();
            if row.first_byte_latency_ms.is_none() {
                row.first_byte_latency_ms =
                    Some(row.started.elapsed().as_secs_f64() * 1000.0);
            }
            row.bytes_transferred = bytes_transferred;
            row.last_update = now;
            let elapsed = row.started.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                row.speed_bps = bytes_transferred as f64 / elapsed;
            }
        }
    }

    /// Mark a transfer terminal. The row stays visible for
    /// [`TERMINAL_LINGER_SECS`] and is then removed.
    pub fn finish(&self, id: &str, status: TransferStatus) {
        if let Some(mut row) = self.rows.get_mut(id) {
            row.status = status;
            row.last_update = Instant::now();
        }
        let rows = Arc::clone(&self.rows);
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(TERMINAL_LINGER_SECS)).await;
            rows.remove(&id);
        });
    }

    /// Copy of the current rows for the monitoring endpoint. Sweeps rows
    /// that stopped updating long ago (an aborted pump that never reached
    /// `finish`).
    pub fn snapshot(&self) -> RegistrySnapshot {
        let stale: Vec<String> = self
            .rows
            .iter()
            .filter(|r| r.last_update.elapsed().as_secs() > STALE_SWEEP_SECS)
            .map(|r| r.key().clone())
            .collect();
        for id in stale {
            self.rows.remove(&id);
        }

        let mut active = 0usize;
        let mut completed = 0usize;
        let mut total_speed = 0.0f64;
        let mut transfers = Vec::new();

        for r in self.rows.iter() {
            let row = r.value();
            match row.status {
                TransferStatus::Active => {
                    active += 1;
                    total_speed += effective_speed(row);
                }
                TransferStatus::Completed => {
                    completed += 1;
                    // Recently finished transfers still count towards the
                    // displayed bandwidth.
                    if row.last_update.elapsed().as_secs_f64() < 2.0 {
                        total_speed += effective_speed(row);
                    }
                }
                _ => {}
            }
            if transfers.len() < SNAPSHOT_DETAIL_CAP {
                transfers.push(TransferSnapshot {
                    transfer_id: r.key().clone(),
                    file_path: row.file_path.clone(),
                    full_path: row.full_path.clone(),
                    file_type: row.file_type.clone(),
                    client_ip: row.client_ip.clone(),
                    uid: row.uid.clone(),
                    session_id: row.session_id.clone(),
                    status: row.status,
                    start_time: row.start_ts,
                    elapsed_secs: row.started.elapsed().as_secs_f64(),
                    bytes_transferred: row.bytes_transferred,
                    total_size: row.total_size,
                    speed_bps: effective_speed(row),
                    progress_percent: row.total_size.filter(|t| *t > 0).map(|t| {
                        (row.bytes_transferred as f64 / t as f64) * 100.0
                    }),
                    first_byte_latency_ms: row.first_byte_latency_ms,
                });
            }
        }

        RegistrySnapshot {
            active_transfers: active,
            completed_transfers: completed,
            total_tracked_transfers: self.rows.len(),
            total_speed_bps: total_speed,
            timestamp: now_secs(),
            transfers,
        }
    }
}

fn effective_speed(row: &TransferRow) -> f64 {
    let elapsed = row.started.elapsed().as_secs_f64();
    if row.speed_bps > 0.0 {
        row.speed_bps
    } else if elapsed > 0.0 {
        row.bytes_transferred as f64 / elapsed
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_update_snapshot() {
        let registry = TransferRegistry::new();
        let id = registry.begin(
            "seg-001.ts",
            "/v/2025-06-17/ABC/seg-001.ts",
            "ts",
            "203.0.113.9",
            "u1",
            Some("sid-1"),
            Some(1_000_000),
        );
        registry.update(&id, 250_000);

        let snap = registry.snapshot();
        assert_eq!(snap.active_transfers, 1);
        let t = &snap.transfers[0];
        assert_eq!(t.bytes_transferred, 250_000);
        assert_eq!(t.uid, "u1");
        assert_eq!(t.progress_percent.map(|p| p.round()), Some(25.0));
        assert!(t.first_byte_latency_ms.is_some());
    }

    #[test]
    fn test_unknown_total_has_no_progress() {
        let registry = TransferRegistry::new();
        let id = registry.begin("f", "/f", "default", "ip", "", None, None);
        registry.update(&id, 10);
        let snap = registry.snapshot();
        assert!(snap.transfers[0].progress_percent.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_row_lingers_then_drops() {
        let registry = TransferRegistry::new();
        let id = registry.begin("f", "/f", "ts", "ip", "u", None, Some(10));
        registry.update(&id, 10);
        registry.finish(&id, TransferStatus::Completed);

        // Still visible right after completion.
        let snap = registry.snapshot();
        assert_eq!(snap.completed_transfers, 1);

        tokio::time::sleep(std::time::Duration::from_secs(TERMINAL_LINGER_SECS + 1)).await;
        let snap = registry.snapshot();
        assert_eq!(snap.total_tracked_transfers, 0);
    }
}
