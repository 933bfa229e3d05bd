//! Custom load shapes.
//!
//! A [`LoadShape`] replaces `--users`, `--hatch-rate` and `--run-time`. About once a
//! second a Local or Master runner asks it how many users should be running and how
//! fast to get there. When it answers `None` the load test stops, then quits (after
//! `--autoquit` seconds if set).
//!
//! ```rust
//! use flock::prelude::*;
//! use std::time::Duration;
//!
//! // Ramp up to 10 users, hold 50 for a minute, then back off before ending.
//! let shape = StagesShape::new(vec![
//!     LoadStage::new(Duration::from_secs(60), 10, 2.0),
//!     LoadStage::new(Duration::from_secs(120), 50, 10.0),
//!     LoadStage::new(Duration::from_secs(150), 10, 10.0),
//! ]);
//! assert_eq!(shape.total_users(), 50);
//! ```

use std::time::Duration;

/// Decides the user count over the course of a load test.
///
/// Any `FnMut(Duration) -> Option<(usize, f32)>` closure is a load shape.
pub trait LoadShape: Send + Sync {
    /// Called with the time since the shape started. Returns the number of users to
    /// run and how many to launch or stop per second, or `None` to end the load test.
    fn tick(&mut self, run_time: Duration) -> Option<(usize, f32)>;
}

impl<F> LoadShape for F
where
    F: FnMut(Duration) -> Option<(usize, f32)> + Send + Sync,
{
    fn tick(&mut self, run_time: Duration) -> Option<(usize, f32)> {
        self(run_time)
    }
}

/// One step of a [`StagesShape`].
#[derive(Clone, Debug, PartialEq)]
pub struct LoadStage {
    /// When this stage ends, measured from the start of the shape.
    pub until: Duration,
    pub users: usize,
    pub hatch_rate: f32,
}
impl LoadStage {
    pub fn new(until: Duration, users: usize, hatch_rate: f32) -> Self {
        LoadStage {
            until,
            users,
            hatch_rate,
        }
    }
}

/// Runs a list of stages in order, ending the load test after the last one.
#[derive(Clone, Debug, Default)]
pub struct StagesShape {
    stages: Vec<LoadStage>,
}
impl StagesShape {
    /// Stages should be sorted by `until`; a stage ending before the one preceding it
    /// never runs.
    pub fn new(stages: Vec<LoadStage>) -> Self {
        StagesShape { stages }
    }

    /// The most users any stage runs.
    pub fn total_users(&self) -> usize {
        self.stages.iter().map(|s| s.users).max().unwrap_or(0)
    }
}
impl LoadShape for StagesShape {
    fn tick(&mut self, run_time: Duration) -> Option<(usize, f32)> {
        self.stages
            .iter()
            .find(|stage| run_time < stage.until)
            .map(|stage| (stage.users, stage.hatch_rate))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stages() {
        let mut shape = StagesShape::new(vec![
            LoadStage::new(Duration::from_secs(10), 5, 1.0),
            LoadStage::new(Duration::from_secs(20), 8, 2.0),
        ]);
        assert_eq!(shape.total_users(), 8);
        assert_eq!(shape.tick(Duration::from_secs(0)), Some((5, 1.0)));
        assert_eq!(shape.tick(Duration::from_millis(9_999)), Some((5, 1.0)));
        // A stage ends exactly at its `until`.
        assert_eq!(shape.tick(Duration::from_secs(10)), Some((8, 2.0)));
        assert_eq!(shape.tick(Duration::from_secs(20)), None);

        // Without stages the load test ends right away.
        let mut shape = StagesShape::default();
        assert_eq!(shape.total_users(), 0);
        assert_eq!(shape.tick(Duration::from_secs(0)), None);
    }

    #[test]
    fn closures() {
        let mut calls = 0;
        let mut shape = move |run_time: Duration| {
            calls += 1;
            if run_time < Duration::from_secs(3) {
                Some((calls, 1.0))
            } else {
                None
            }
        };
        assert_eq!(LoadShape::tick(&mut shape, Duration::from_secs(1)), Some((1, 1.0)));
        assert_eq!(LoadShape::tick(&mut shape, Duration::from_secs(2)), Some((2, 1.0)));
        assert_eq!(LoadShape::tick(&mut shape, Duration::from_secs(3)), None);
    }
}
