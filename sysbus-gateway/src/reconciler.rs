//! Reconciliation engine.
//!
//! Each cycle first pushes the writes queued in the store to the bus, then
//! reads every range of the poll plan back into the store, then idles until
//! the next interval (or until the facade queues another write).

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysbus_common::{DeviceStatus, SlaveLiveness};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::codec::{Frame, MAX_WRITE_COUNT};
use crate::config::Space;
use crate::error::BusError;
use crate::registers::RegisterMap;
use crate::scheduler::BusScheduler;
use crate::store::{PendingWrite, RegisterStore};

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Cycle start (millis since epoch).
    pub started_at: i64,
    pub duration_ms: u64,
    /// Registers confirmed written.
    pub writes_ok: usize,
    /// Registers returned to the dirty set.
    pub writes_failed: usize,
    /// Dirty registers dropped because they are no longer mapped.
    pub writes_discarded: usize,
    pub ranges_ok: usize,
    pub ranges_failed: usize,
    /// Shutdown was requested before the cycle finished.
    pub interrupted: bool,
}

/// Engine state exposed on the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStatus {
    pub cycles: u64,
    pub last_cycle: Option<CycleReport>,
    pub slaves: Vec<SlaveLiveness>,
}

/// Shared handle on the engine status.
pub type SharedStatus = Arc<RwLock<EngineStatus>>;

/// Consecutive holding registers written with one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    pub slave: u8,
    pub writes: Vec<PendingWrite>,
}

impl WriteBatch {
    /// Write-single for one register, write-multiple otherwise.
    pub fn frame(&self) -> Frame {
        let start = self.writes.first().map(|w| w.address).unwrap_or_default();
        match self.writes.as_slice() {
            [single] => Frame::write_single(self.slave, single.address, single.value),
            writes => Frame::write_multiple(
                self.slave,
                start,
                writes.iter().map(|w| w.value).collect(),
            ),
        }
    }

    /// One write-single batch per register.
    pub fn split(self) -> Vec<WriteBatch> {
        let slave = self.slave;
        self.writes
            .into_iter()
            .map(|write| WriteBatch {
                slave,
                writes: vec![write],
            })
            .collect()
    }

    fn extends(&self, slave: u8, address: u16) -> bool {
        self.slave == slave
            && self.writes.len() < usize::from(MAX_WRITE_COUNT)
            && self
                .writes
                .last()
                .is_some_and(|last| last.address.checked_add(1) == Some(address))
    }
}

/// Group writes (ordered by address) into contiguous per-slave batches.
/// Writes to addresses the map does not know are returned separately.
pub fn coalesce(
    writes: Vec<PendingWrite>,
    map: &RegisterMap,
) -> (Vec<WriteBatch>, Vec<PendingWrite>) {
    let mut batches: Vec<WriteBatch> = Vec::new();
    let mut unknown = Vec::new();

    for write in writes {
        let slave = match (write.space, map.slave_for(write.space, write.address)) {
            (Space::Holding, Some(slave)) => slave,
            _ => {
                unknown.push(write);
                continue;
            }
        };

        match batches.last_mut() {
            Some(batch) if batch.extends(slave, write.address) => batch.writes.push(write),
            _ => batches.push(WriteBatch {
                slave,
                writes: vec![write],
            }),
        }
    }

    (batches, unknown)
}

#[derive(Default)]
struct Outcomes {
    per_slave: BTreeMap<u8, (u64, u64)>,
}

impl Outcomes {
    fn record(&mut self, slave: u8, ok: bool) {
        let counts = self.per_slave.entry(slave).or_default();
        if ok {
            counts.0 += 1;
        } else {
            counts.1 += 1;
        }
    }
}

/// Background engine keeping the store and the bus in step.
pub struct Reconciler {
    bus: Arc<BusScheduler>,
    store: Arc<RegisterStore>,
    map: Arc<RegisterMap>,
    interval: Duration,
    wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    status: SharedStatus,
}

impl Reconciler {
    pub fn new(
        bus: Arc<BusScheduler>,
        store: Arc<RegisterStore>,
        map: Arc<RegisterMap>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bus,
            store,
            map,
            interval,
            wake: Arc::new(Notify::new()),
            shutdown,
            status: SharedStatus::default(),
        }
    }

    /// Notifier that cuts the idle wait short.
    pub fn waker(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until shutdown is requested.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            ranges = self.map.poll_plan().len(),
            "Reconciler started"
        );

        loop {
            if self.shutdown_requested() {
                break;
            }

            let report = self.run_cycle().await;
            if report.interrupted {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.wake.notified() => {
                    debug!("Woken early by a queued write");
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Sender dropped, treat as shutdown
                        break;
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Run one cycle: drain writes, then poll the plan.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport {
            started_at: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        };
        let mut outcomes = Outcomes::default();

        self.drain_writes(&mut report, &mut outcomes).await;
        if !report.interrupted {
            self.poll(&mut report, &mut outcomes).await;
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        self.publish(&report, outcomes);

        if report.writes_failed > 0 || report.ranges_failed > 0 {
            warn!(
                writes_ok = report.writes_ok,
                writes_failed = report.writes_failed,
                ranges_ok = report.ranges_ok,
                ranges_failed = report.ranges_failed,
                "Cycle completed with failures"
            );
        } else {
            debug!(
                writes = report.writes_ok,
                ranges = report.ranges_ok,
                duration_ms = report.duration_ms,
                "Cycle completed"
            );
        }

        report
    }

    async fn drain_writes(&self, report: &mut CycleReport, outcomes: &mut Outcomes) {
        let dirty = self.store.take_dirty().await;
        if dirty.is_empty() {
            return;
        }

        let (batches, unknown) = coalesce(dirty, &self.map);

        for write in &unknown {
            warn!(
                space = %write.space,
                address = write.address,
                value = write.value,
                "Discarding queued write to an unmapped register"
            );
            match self.store.discard(write).await {
                Ok(_) => report.writes_discarded += 1,
                Err(e) => {
                    error!(error = %e, "Failed to discard write");
                    self.store.mark_failed(write).await;
                }
            }
        }

        let mut queue: VecDeque<WriteBatch> = batches.into();
        while let Some(batch) = queue.pop_front() {
            if self.shutdown_requested() {
                report.interrupted = true;
                for batch in std::iter::once(batch).chain(queue.drain(..)) {
                    for write in &batch.writes {
                        self.store.mark_failed(write).await;
                    }
                }
                info!("Shutdown requested, returning unsent writes to the store");
                return;
            }

            let frame = batch.frame();
            match self.bus.execute(&frame).await {
                Ok(_) => {
                    outcomes.record(batch.slave, true);
                    for write in &batch.writes {
                        self.confirm(write, report).await;
                    }
                    debug!(
                        slave = batch.slave,
                        start = frame.start,
                        count = frame.count,
                        "Writes delivered"
                    );
                }
                Err(BusError::Rejected { code, .. }) if batch.writes.len() > 1 => {
                    // Retry register by register so only the refused one stays dirty
                    outcomes.record(batch.slave, true);
                    info!(
                        slave = batch.slave,
                        start = frame.start,
                        count = frame.count,
                        code,
                        "Batch refused, writing its registers one by one"
                    );
                    for single in batch.split().into_iter().rev() {
                        queue.push_front(single);
                    }
                }
                Err(e) => {
                    outcomes.record(batch.slave, matches!(e, BusError::Rejected { .. }));
                    warn!(
                        slave = batch.slave,
                        start = frame.start,
                        count = frame.count,
                        error = %e,
                        "Write failed, will retry next cycle"
                    );
                    for write in &batch.writes {
                        self.store.mark_failed(write).await;
                    }
                    report.writes_failed += batch.writes.len();
                }
            }
        }
    }

    async fn confirm(&self, write: &PendingWrite, report: &mut CycleReport) {
        match self.store.confirm_written(write).await {
            Ok(true) => report.writes_ok += 1,
            Ok(false) => debug!(
                address = write.address,
                "Delivered write was superseded by a newer one"
            ),
            Err(e) => {
                error!(
                    address = write.address,
                    error = %e,
                    "Failed to confirm write, queueing it again"
                );
                self.store.mark_failed(write).await;
                report.writes_failed += 1;
            }
        }
    }

    async fn poll(&self, report: &mut CycleReport, outcomes: &mut Outcomes) {
        for range in self.map.poll_plan() {
            if self.shutdown_requested() {
                report.interrupted = true;
                return;
            }

            match self.bus.execute(&range.frame()).await {
                Ok(response) => {
                    outcomes.record(range.slave, true);
                    match self
                        .store
                        .apply_polled_range(range.space, range.start, &response.payload)
                        .await
                    {
                        Ok(updated) => {
                            report.ranges_ok += 1;
                            debug!(%range, updated, "Range polled");
                        }
                        Err(e) => {
                            report.ranges_failed += 1;
                            error!(%range, error = %e, "Failed to store polled range");
                        }
                    }
                }
                Err(e) => {
                    outcomes.record(range.slave, false);
                    report.ranges_failed += 1;
                    warn!(%range, error = %e, "Poll failed, keeping cached values");
                }
            }
        }
    }

    fn publish(&self, report: &CycleReport, outcomes: Outcomes) {
        let mut status = self.status.write();
        status.cycles += 1;
        status.last_cycle = Some(report.clone());

        for (slave, (ok, failed)) in outcomes.per_slave {
            let position = status.slaves.iter().position(|s| s.slave == slave);
            let index = match position {
                Some(index) => index,
                None => {
                    status.slaves.push(SlaveLiveness::new(slave));
                    status.slaves.len() - 1
                }
            };
            let liveness = &mut status.slaves[index];

            liveness.status = DeviceStatus::from_outcomes(ok, failed);
            if ok > 0 {
                liveness.last_seen = Some(report.started_at);
                liveness.consecutive_failures = 0;
            } else if failed > 0 {
                liveness.consecutive_failures += 1;
                if liveness.consecutive_failures == 1 {
                    warn!(slave, "Slave stopped answering");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FunctionCode;
    use crate::registers::PollRange;

    fn write(address: u16, value: u16) -> PendingWrite {
        PendingWrite {
            space: Space::Holding,
            address,
            value,
            revision: 1,
        }
    }

    fn map() -> RegisterMap {
        RegisterMap::new(
            Vec::new(),
            vec![
                PollRange {
                    slave: 240,
                    space: Space::Holding,
                    start: 0,
                    count: 20,
                },
                PollRange {
                    slave: 241,
                    space: Space::Holding,
                    start: 20,
                    count: 10,
                },
            ],
        )
    }

    #[test]
    fn test_coalesce_contiguous_runs() {
        let writes = vec![write(1, 1), write(2, 2), write(3, 3), write(7, 7)];
        let (batches, unknown) = coalesce(writes, &map());

        assert!(unknown.is_empty());
        assert_eq!(batches.len(), 2);

        let frame = batches[0].frame();
        assert_eq!(frame.function, FunctionCode::WriteMultiple);
        assert_eq!((frame.start, frame.count), (1, 3));
        assert_eq!(frame.payload, vec![1, 2, 3]);

        let frame = batches[1].frame();
        assert_eq!(frame.function, FunctionCode::WriteSingle);
        assert_eq!(frame.start, 7);
    }

    #[test]
    fn test_coalesce_splits_on_slave_boundary() {
        let writes = vec![write(19, 1), write(20, 2)];
        let (batches, _) = coalesce(writes, &map());

        let slaves: Vec<u8> = batches.iter().map(|b| b.slave).collect();
        assert_eq!(slaves, vec![240, 241]);
    }

    #[test]
    fn test_coalesce_reports_unknown_addresses() {
        let writes = vec![write(5, 1), write(500, 2)];
        let (batches, unknown) = coalesce(writes, &map());

        assert_eq!(batches.len(), 1);
        assert_eq!(unknown, vec![write(500, 2)]);
    }

    #[test]
    fn test_split_sends_registers_singly() {
        let (batches, _) = coalesce(vec![write(4, 1), write(5, 2)], &map());
        let singles: Vec<Frame> = batches[0]
            .clone()
            .split()
            .iter()
            .map(WriteBatch::frame)
            .collect();

        assert_eq!(
            singles,
            vec![Frame::write_single(240, 4, 1), Frame::write_single(240, 5, 2)]
        );
    }

    #[test]
    fn test_coalesce_respects_frame_limit() {
        let map = RegisterMap::new(
            Vec::new(),
            vec![
                PollRange {
                    slave: 240,
                    space: Space::Holding,
                    start: 0,
                    count: 125,
                },
                PollRange {
                    slave: 240,
                    space: Space::Holding,
                    start: 125,
                    count: 5,
                },
            ],
        );
        let writes = (0..130).map(|a| write(a, a)).collect();
        let (batches, _) = coalesce(writes, &map);

        let sizes: Vec<usize> = batches.iter().map(|b| b.writes.len()).collect();
        assert_eq!(sizes, vec![123, 7]);
    }
}
