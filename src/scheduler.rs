//! Room Scheduler
//!
//! Owns the mapping from room id to its running Round State Machine and
//! guarantees at most one machine per room. Machines are supervised: an
//! error or panic is reported to operators and leaves the room stopped.
//! Starting a room first drains any of its rounds that ended unsettled.

use crate::errors::{EngineResult, SchedulerError};
use crate::notify::AlertSeverity;
use crate::round::{RoundContext, RoundMachine, RoundPhase};
use crate::settlement::SettlementReport;
use crate::types::{RoomId, RoundKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct RoomHandle {
    generation: u64,
    stop: watch::Sender<bool>,
    phase: watch::Receiver<RoundPhase>,
    task: JoinHandle<()>,
}

struct SchedulerInner {
    ctx: RoundContext,
    rooms: DashMap<RoomId, RoomHandle>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct RoomScheduler {
    inner: Arc<SchedulerInner>,
}

impl RoomScheduler {
    pub fn new(ctx: RoundContext) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                ctx,
                rooms: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start the machine for an approved room. Returns false if one is
    /// already active.
    pub async fn start(&self, room: RoomId) -> EngineResult<bool> {
        let ledger = &self.inner.ctx.ledger;
        let record = ledger
            .get_room(room)
            .await?
            .ok_or(SchedulerError::RoomNotFound(room))?;
        if !record.is_approved() {
            return Err(SchedulerError::RoomNotApproved(room).into());
        }
        if self.is_active(room) {
            return Ok(false);
        }
        let drained = self.drain_stale(room).await?;
        if drained > 0 {
            tracing::warn!(room = %room, rounds = drained, "Drained unsettled rounds before start");
        }
        ledger.set_room_running(room, true).await?;

        match self.inner.rooms.entry(room) {
            Entry::Occupied(existing) if !existing.get().task.is_finished() => Ok(false),
            entry => {
                let handle = self.spawn_machine(room);
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(handle);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(handle);
                    }
                }
                tracing::info!(room = %room, "Room scheduled");
                Ok(true)
            }
        }
    }

    /// Close rounds of `room` that ended without settling, e.g. after a crash
    async fn drain_stale(&self, room: RoomId) -> EngineResult<usize> {
        let ctx = &self.inner.ctx;
        let current = ctx.rounds.round_index(ctx.clock.now());
        let stale: Vec<RoundKey> = ctx
            .ledger
            .open_rounds()
            .await?
            .into_iter()
            .filter(|key| key.room == room && key.round < current)
            .collect();
        for key in &stale {
            ctx.drain_orphan(*key).await?;
        }
        Ok(stale.len())
    }

    /// Refund or settle one round per the orphan policy
    pub async fn drain_orphan(&self, key: RoundKey) -> EngineResult<SettlementReport> {
        self.inner.ctx.drain_orphan(key).await
    }

    fn spawn_machine(&self, room: RoomId) -> RoomHandle {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (machine, phase) = RoundMachine::new(room, self.inner.ctx.clone());
        let (stop, stop_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);

        let task = tokio::spawn(async move {
            let outcome = tokio::spawn(machine.run(stop_rx)).await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(join_error) if join_error.is_panic() => Some("round machine panicked".to_string()),
                Err(_) => None,
            };

            if let Some(reason) = failure {
                tracing::error!(room = %room, "Round machine crashed: {}", reason);
                if let Err(e) = inner.ctx.ledger.set_room_running(room, false).await {
                    tracing::error!(room = %room, "Failed to mark crashed room stopped: {}", e);
                }
                inner.ctx.metrics.record_machine_crash();
                inner.ctx.notifier.alert(
                    Some(room),
                    AlertSeverity::Critical,
                    format!("Room {} stopped after a failure: {}", room, reason),
                );
            }

            inner.rooms.remove_if(&room, |_, handle| handle.generation == generation);
        });

        RoomHandle {
            generation,
            stop,
            phase,
            task,
        }
    }

    /// Clear the running flag and wait for the machine to wind down.
    /// A settlement already under way completes first.
    pub async fn stop(&self, room: RoomId) -> EngineResult<bool> {
        match self.inner.ctx.ledger.set_room_running(room, false).await {
            Ok(_) | Err(crate::errors::LedgerError::RoomNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.halt(room).await)
    }

    /// Signal and await one machine without touching the ledger
    async fn halt(&self, room: RoomId) -> bool {
        let Some((_, handle)) = self.inner.rooms.remove(&room) else {
            return false;
        };
        let _ = handle.stop.send(true);
        if let Err(e) = handle.task.await {
            tracing::warn!(room = %room, "Room supervisor ended abnormally: {}", e);
        }
        tracing::info!(room = %room, "Room halted");
        true
    }

    /// Halt every machine, leaving running flags in place for the next start
    pub async fn halt_all(&self) -> usize {
        let rooms: Vec<RoomId> = self.inner.rooms.iter().map(|e| *e.key()).collect();
        let halted = futures::future::join_all(rooms.into_iter().map(|room| self.halt(room))).await;
        halted.into_iter().filter(|h| *h).count()
    }

    /// Restart a machine for every room marked running. Returns how many started.
    pub async fn on_startup(&self) -> EngineResult<usize> {
        let mut started = 0;
        for room in self.inner.ctx.ledger.running_rooms().await? {
            match self.start(room.id).await {
                Ok(true) => started += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(room = %room.id, "Failed to resume room: {}", e);
                    self.inner.ctx.notifier.alert(
                        Some(room.id),
                        AlertSeverity::Critical,
                        format!("Room {} could not be resumed: {}", room.id, e),
                    );
                }
            }
        }
        tracing::info!(rooms = started, "Resumed running rooms");
        Ok(started)
    }

    pub fn is_active(&self, room: RoomId) -> bool {
        self.inner
            .rooms
            .get(&room)
            .map_or(false, |h| !h.task.is_finished())
    }

    pub fn phase(&self, room: RoomId) -> Option<RoundPhase> {
        self.inner.rooms.get(&room).map(|h| *h.phase.borrow())
    }

    /// Receiver that follows the phase of a room's current machine
    pub fn watch_phase(&self, room: RoomId) -> Option<watch::Receiver<RoundPhase>> {
        self.inner.rooms.get(&room).map(|h| h.phase.clone())
    }

    pub fn active_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.inner.rooms.iter().map(|e| *e.key()).collect();
        rooms.sort();
        rooms
    }
}
