use std::{
    num::NonZeroU32,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Instant,
};

use anyhow::Context;
use crucible_events::{EventChannel, Origin, Scheduler, TickScheduler};

use super::{
    config::ConfRoot,
    demo::{install_spawn_handlers, SpawnRequest, SpawnStats},
    time_step::{FixedRate, TickResult},
};

// === ServerRuntime === //

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub fired: u64,
    pub completed: u64,
    pub spawned: u64,
    pub cancelled: u64,
    pub effects: u64,
    pub failed_lanes: usize,
    pub dropped_tasks: usize,
}

pub struct ServerRuntime {
    conf: ConfRoot,
    scheduler: Arc<TickScheduler>,
    dyn_scheduler: Arc<dyn Scheduler>,
    rate: FixedRate,
    spawn_event: Arc<EventChannel<SpawnRequest>>,
    spawn_origin: Origin,
    stats: Arc<SpawnStats>,
    fired: u64,
    completed: Arc<AtomicU64>,
}

impl ServerRuntime {
    pub fn new(conf: ConfRoot) -> anyhow::Result<Self> {
        conf.validate().context("refusing to start with an invalid config")?;

        let scheduler = Arc::new(TickScheduler::new(conf.scheduler_config()));
        let rate = FixedRate::new(
            conf.tick.rate,
            NonZeroU32::new(conf.tick.max_catch_up).unwrap_or(NonZeroU32::MIN),
        );

        let spawn_event = Arc::new(EventChannel::new());
        let stats = Arc::new(SpawnStats::default());
        let spawn_origin =
            install_spawn_handlers(&spawn_event, &conf.demo, rate.fixed_delta(), stats.clone());

        log::info!(
            "Server runtime ready: {} ticks/s, {} spawn handler(s), lanes named {:?}.",
            rate.rate(),
            spawn_event.handler_count(),
            conf.lanes.name_prefix,
        );

        Ok(Self {
            conf,
            dyn_scheduler: scheduler.clone(),
            scheduler,
            rate,
            spawn_event,
            spawn_origin,
            stats,
            fired: 0,
            completed: Arc::default(),
        })
    }

    pub fn scheduler(&self) -> &Arc<TickScheduler> {
        &self.scheduler
    }

    pub fn spawn_event(&self) -> &Arc<EventChannel<SpawnRequest>> {
        &self.spawn_event
    }

    /// Runs one tick: fires the spawn event if it is due and then advances the scheduler.
    pub fn step(&mut self) -> anyhow::Result<()> {
        let tick = self.scheduler.current_tick();

        if tick % self.conf.demo.spawn_every == 0 && self.spawn_event.has_handlers() {
            let entity = self.fired;
            self.fired += 1;

            let completed = self.completed.clone();
            self.spawn_event
                .fire_awaiting_completion(
                    &self.dyn_scheduler,
                    Arc::new(SpawnRequest::new(entity, tick)),
                    move || {
                        completed.fetch_add(1, Ordering::Relaxed);
                        log::debug!("Spawn request for entity {entity} fully handled");
                    },
                )
                .with_context(|| format!("failed to fire spawn event for entity {entity}"))?;
        }

        self.scheduler.run_tick(self.rate.fixed_delta());
        Ok(())
    }

    /// Drives ticks at the configured rate until `max_ticks` ticks have run (zero means forever).
    pub fn run(&mut self, max_ticks: u64) -> anyhow::Result<()> {
        loop {
            if max_ticks != 0 && self.scheduler.current_tick() >= max_ticks {
                return Ok(());
            }

            match self.rate.tick(Instant::now()) {
                TickResult::Tick(count) => {
                    for _ in 0..count.get() {
                        self.step()?;

                        if max_ticks != 0 && self.scheduler.current_tick() >= max_ticks {
                            break;
                        }
                    }
                }
                TickResult::Sleep(until) => {
                    thread::sleep(until.saturating_duration_since(Instant::now()));
                }
            }
        }
    }

    /// Stops the scheduler and removes the demo handlers. Handlers still suspended are woken with
    /// an abandonment error.
    pub fn shutdown(self) -> RunSummary {
        let removed = self.spawn_event.unregister_by_origin(&self.spawn_origin);
        let dropped_tasks = self.scheduler.shutdown();

        log::info!(
            "Server stopped after {} ticks ({removed} handler(s) removed).",
            self.scheduler.current_tick(),
        );

        RunSummary {
            ticks: self.scheduler.current_tick(),
            fired: self.fired,
            completed: self.completed.load(Ordering::Relaxed),
            spawned: self.stats.spawned.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
            effects: self.stats.effects.load(Ordering::Relaxed),
            failed_lanes: self.scheduler.failed_lanes(),
            dropped_tasks,
        }
    }
}
