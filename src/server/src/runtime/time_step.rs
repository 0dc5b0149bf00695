use std::{
    num::NonZeroU32,
    time::{Duration, Instant},
};

pub enum TickResult {
    /// Run this many ticks back-to-back.
    Tick(NonZeroU32),
    Sleep(Instant),
}

// Based off of https://gafferongames.com/post/fix_your_timestep/
#[derive(Debug)]
pub struct FixedRate {
    /// The rate in ticks-per-second that this timer will run at.
    rate: f64,

    /// The delta of each of these ticks in seconds. This is also the amount of scheduler time each
    /// tick advances by.
    fixed_delta: f64,

    fixed_delta_as_duration: Duration,

    /// The most ticks a single call to `tick` may request. Anything beyond this is dropped so a
    /// stalled server does not spend the next several seconds catching up.
    max_catch_up: NonZeroU32,

    /// The time of the last tick in the *tick-rate time space*.
    world_time: Option<Instant>,
}

impl FixedRate {
    pub fn new(rate: f64, max_catch_up: NonZeroU32) -> Self {
        let fixed_delta = 1. / rate;
        Self {
            rate,
            fixed_delta,
            fixed_delta_as_duration: Duration::from_secs_f64(fixed_delta),
            max_catch_up,
            world_time: None,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn fixed_delta(&self) -> f64 {
        self.fixed_delta
    }

    pub fn fixed_delta_as_duration(&self) -> Duration {
        self.fixed_delta_as_duration
    }

    pub fn next_tick(&self, now: Instant) -> Instant {
        self.world_time.unwrap_or(now) + self.fixed_delta_as_duration
    }

    pub fn tick(&mut self, now: Instant) -> TickResult {
        // The first tick runs immediately.
        let Some(last_tick) = self.world_time.as_mut() else {
            self.world_time = Some(now);
            return TickResult::Tick(NonZeroU32::MIN);
        };

        let since_last_tick = now.saturating_duration_since(*last_tick);
        let owed = (since_last_tick.as_secs_f64() / self.fixed_delta) as u32;

        let Some(owed) = NonZeroU32::new(owed) else {
            return TickResult::Sleep(self.next_tick(now));
        };

        if owed > self.max_catch_up {
            log::warn!(
                "Server fell {} ticks behind; skipping {} of them",
                owed,
                owed.get() - self.max_catch_up.get(),
            );

            // Skipped ticks are forgotten entirely so world time lines up with the present again.
            *last_tick = now;
            TickResult::Tick(self.max_catch_up)
        } else {
            *last_tick += self.fixed_delta_as_duration * owed.get();
            TickResult::Tick(owed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_ticks(result: TickResult) -> u32 {
        match result {
            TickResult::Tick(count) => count.get(),
            TickResult::Sleep(_) => panic!("expected ticks, got a sleep"),
        }
    }

    #[test]
    fn first_tick_is_immediate() {
        let mut rate = FixedRate::new(20., NonZeroU32::new(5).unwrap());
        assert_eq!(expect_ticks(rate.tick(Instant::now())), 1);
        assert_eq!(rate.fixed_delta(), 0.05);
    }

    #[test]
    fn sleeps_until_the_next_tick() {
        let start = Instant::now();
        let mut rate = FixedRate::new(10., NonZeroU32::new(5).unwrap());
        rate.tick(start);

        match rate.tick(start + Duration::from_millis(30)) {
            TickResult::Sleep(until) => {
                assert!(until > start + Duration::from_millis(99));
                assert!(until <= start + Duration::from_millis(101));
            }
            TickResult::Tick(_) => panic!("ticked too early"),
        }
    }

    #[test]
    fn catches_up_on_missed_ticks() {
        let start = Instant::now();
        let mut rate = FixedRate::new(10., NonZeroU32::new(5).unwrap());
        rate.tick(start);

        assert_eq!(expect_ticks(rate.tick(start + Duration::from_millis(350))), 3);

        // The leftover 50ms carries over into the next request.
        assert_eq!(expect_ticks(rate.tick(start + Duration::from_millis(450))), 1);
    }

    #[test]
    fn caps_catch_up() {
        let start = Instant::now();
        let mut rate = FixedRate::new(10., NonZeroU32::new(2).unwrap());
        rate.tick(start);

        let late = start + Duration::from_secs(3);
        assert_eq!(expect_ticks(rate.tick(late)), 2);
        assert!(matches!(rate.tick(late), TickResult::Sleep(_)));
    }
}
