//! Synthetic treadmill workout

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;
use treadmill_shared::{now_iso, Sample};

/// Produces samples into a latest-value channel
#[derive(Debug, Clone)]
pub struct Simulator {
    tx: watch::Sender<Option<Sample>>,
}

impl Simulator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Receiver side, handed to the HTTP handlers
    pub fn subscribe(&self) -> watch::Receiver<Option<Sample>> {
        self.tx.subscribe()
    }

    /// Latest published sample
    pub fn latest(&self) -> Option<Sample> {
        self.tx.borrow().clone()
    }

    /// Replace the latest sample
    pub fn publish(&self, sample: Sample) {
        self.tx.send_replace(Some(sample));
    }

    /// Forget the latest sample; the pull endpoint answers 404 until the next one
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Publish a new sample every `tick`
    pub fn spawn(&self, tick: Duration) -> JoinHandle<()> {
        let sim = self.clone();

        tokio::spawn(async move {
            let mut ticker = interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut workout = Workout::default();

            loop {
                ticker.tick().await;
                let sample = workout.advance(tick);
                debug!("[SIM] speed={:.1} distance={:.3}", sample.speed, sample.distance);
                sim.publish(sample);
            }
        })
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Running totals of the simulated session
#[derive(Debug, Default)]
struct Workout {
    elapsed: Duration,
    distance_km: f64,
    calories: f64,
    steps: u64,
}

impl Workout {
    fn advance(&mut self, tick: Duration) -> Sample {
        self.elapsed += tick;
        let t = self.elapsed.as_secs_f64();

        // Gentle interval profile between 6 and 10 km/h
        let speed = 8.0 + 2.0 * (t / 60.0).sin();
        let incline = if (t as u64 / 120) % 2 == 0 { 1.0 } else { 3.0 };
        let hours = tick.as_secs_f64() / 3600.0;
        let cadence = 140.0 + speed * 3.0;

        self.distance_km += speed * hours;
        self.calories += speed * 65.0 * hours;
        self.steps += (cadence * tick.as_secs_f64() / 60.0).round() as u64;

        Sample {
            speed,
            incline,
            distance: self.distance_km,
            calories: self.calories,
            heart_rate: Some(110.0 + speed * 5.0),
            cadence: Some(cadence),
            steps: Some(self.steps as f64),
            timestamp: now_iso(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workout_accumulates() {
        let mut workout = Workout::default();
        let first = workout.advance(Duration::from_secs(1));
        let second = workout.advance(Duration::from_secs(1));

        assert!(first.speed >= 6.0 && first.speed <= 10.0);
        assert!(second.distance > first.distance);
        assert!(second.calories > first.calories);
        assert!(second.steps >= first.steps);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_simulator_publishes() {
        let sim = Simulator::new();
        let mut rx = sim.subscribe();
        let task = sim.spawn(Duration::from_millis(100));

        rx.changed().await.unwrap();
        assert!(sim.latest().is_some());

        sim.clear();
        assert!(sim.latest().is_none());
        task.abort();
    }
}
