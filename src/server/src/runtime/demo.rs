use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use crucible_events::{CancelFlag, Cancellable, EventChannel, Origin};

use super::config::ConfDemo;

// === SpawnRequest === //

/// The payload of the demo spawn event.
#[derive(Debug)]
pub struct SpawnRequest {
    pub entity: u64,
    pub requested_at: u64,
    cancelled: CancelFlag,
    spawned: AtomicBool,
    effect_played: AtomicBool,
}

impl SpawnRequest {
    pub fn new(entity: u64, requested_at: u64) -> Self {
        Self {
            entity,
            requested_at,
            cancelled: CancelFlag::new(),
            spawned: AtomicBool::new(false),
            effect_played: AtomicBool::new(false),
        }
    }

    pub fn was_spawned(&self) -> bool {
        self.spawned.load(Ordering::Acquire)
    }

    pub fn effect_played(&self) -> bool {
        self.effect_played.load(Ordering::Acquire)
    }
}

impl Cancellable for SpawnRequest {
    fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }

    fn set_cancelled(&self, cancelled: bool) {
        self.cancelled.set_cancelled(cancelled);
    }
}

// === Handlers === //

#[derive(Debug, Default)]
pub struct SpawnStats {
    pub spawned: AtomicU64,
    pub cancelled: AtomicU64,
    pub effects: AtomicU64,
}

pub const GUARD_PRIORITY: f64 = -10.;
pub const SPAWN_PRIORITY: f64 = 0.;
pub const EFFECT_PRIORITY: f64 = 10.;

/// Installs the demo handlers on `channel` under a fresh origin and returns that origin.
///
/// - A guard cancels every `cancel_every`th request.
/// - The spawner spawns every request the guard let through.
/// - The effect handler suspends for `effect_delay` ticks before playing a spawn effect.
pub fn install_spawn_handlers(
    channel: &EventChannel<SpawnRequest>,
    conf: &ConfDemo,
    tick_delta: f64,
    stats: Arc<SpawnStats>,
) -> Origin {
    let origin = Origin::named("demo-spawn");

    let cancel_every = conf.cancel_every;
    channel.add_plain(
        {
            let stats = stats.clone();
            move |cx| {
                let req = cx.payload();
                if cancel_every != 0 && (req.entity + 1) % cancel_every == 0 {
                    log::info!("Guard cancelled spawn of entity {}", req.entity);
                    req.cancel();
                    stats.cancelled.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
        },
        origin.clone(),
        GUARD_PRIORITY,
    );

    channel.add_plain(
        {
            let stats = stats.clone();
            move |cx| {
                let req = cx.payload();
                if req.is_cancelled() {
                    return Ok(());
                }

                req.spawned.store(true, Ordering::Release);
                stats.spawned.fetch_add(1, Ordering::Relaxed);
                log::info!(
                    "Spawned entity {} (requested on tick {})",
                    req.entity,
                    req.requested_at
                );
                Ok(())
            }
        },
        origin.clone(),
        SPAWN_PRIORITY,
    );

    let effect_delay = f64::from(conf.effect_delay) * tick_delta;
    channel.add_suspending(
        move |cx, handle| {
            if !cx.payload().was_spawned() {
                return Ok(());
            }

            handle.suspend_for_delay(effect_delay)?;

            let req = cx.payload();
            req.effect_played.store(true, Ordering::Release);
            stats.effects.fetch_add(1, Ordering::Relaxed);
            log::info!("Played spawn effect for entity {}", req.entity);
            Ok(())
        },
        origin.clone(),
        EFFECT_PRIORITY,
    );

    origin
}
