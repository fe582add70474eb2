//! Sampling solver statistics at fixed fractions of the time limit.
//!
//! A features run reports statistics repeatedly as search progresses. We
//! keep one snapshot per save point: the first statistics event whose
//! elapsed search time reaches that point's share of the time limit. When a
//! single event jumps past several save points it fills all of them, so
//! snapshots always line up one-to-one with a prefix of the save points.

use crate::error::{HarvestError, Result};
use crate::solver::SolverEvent;
use crate::store::StatisticsSnapshot;
use std::collections::BTreeMap;

/// Upper bound on the number of save points in one run.
pub const MAX_SAVE_POINTS: usize = 100_000;

/// Ascending percentages of the time limit, each in `[0, 100)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SavePoints {
    points: Vec<f64>,
}

impl SavePoints {
    /// `0, inc, 2*inc, ...` up to but excluding 100.
    pub fn from_increment(increment: f64) -> Result<Self> {
        if !increment.is_finite() || increment <= 0.0 || increment > 100.0 {
            return Err(HarvestError::InvalidConfig(format!(
                "save point increment must be in (0, 100], got {}",
                increment
            )));
        }
        if 100.0 / increment > MAX_SAVE_POINTS as f64 {
            return Err(HarvestError::InvalidConfig(format!(
                "save point increment {} gives more than {} save points",
                increment, MAX_SAVE_POINTS
            )));
        }
        // Multiplying instead of accumulating keeps 0.1-style steps exact
        // enough to compare against reported percentages.
        let count = (100.0 / increment).ceil() as usize;
        let points = (0..count)
            .map(|i| i as f64 * increment)
            .filter(|p| *p < 100.0)
            .collect();
        Ok(Self { points })
    }

    /// Explicit save points; must be strictly increasing and within `[0, 100)`.
    pub fn new(points: Vec<f64>) -> Result<Self> {
        if points.is_empty() {
            return Err(HarvestError::InvalidConfig("no save points given".into()));
        }
        if points.iter().any(|p| !p.is_finite() || *p < 0.0 || *p >= 100.0) {
            return Err(HarvestError::InvalidConfig(
                "save points must lie in [0, 100)".into(),
            ));
        }
        if points.windows(2).any(|w| w[0] >= w[1]) {
            return Err(HarvestError::InvalidConfig(
                "save points must be strictly increasing".into(),
            ));
        }
        Ok(Self { points })
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.points
    }
}

/// Turns a statistics stream into save-point snapshots.
#[derive(Debug)]
pub struct SnapshotExtractor {
    save_points: SavePoints,
    time_limit_ms: f64,
    time_key: String,
    snapshots: Vec<StatisticsSnapshot>,
    skipped_events: usize,
}

impl SnapshotExtractor {
    /// `time_key` names the statistic carrying elapsed search seconds.
    pub fn new(save_points: SavePoints, time_limit_ms: u64, time_key: impl Into<String>) -> Self {
        Self {
            snapshots: Vec::with_capacity(save_points.len()),
            save_points,
            time_limit_ms: time_limit_ms.max(1) as f64,
            time_key: time_key.into(),
            skipped_events: 0,
        }
    }

    /// Feed one statistics sample taken `elapsed_ms` into the search.
    ///
    /// Returns how many save points it filled.
    pub fn observe(&mut self, elapsed_ms: f64, features: &BTreeMap<String, f64>) -> usize {
        let percent = elapsed_ms / self.time_limit_ms * 100.0;
        let mut filled = 0;
        while let Some(&point) = self.save_points.as_slice().get(self.snapshots.len()) {
            if percent < point {
                break;
            }
            self.snapshots.push(StatisticsSnapshot {
                percent: point,
                features: features.clone(),
            });
            filled += 1;
        }
        filled
    }

    /// Feed a solver event; anything but a timed statistics event is ignored.
    pub fn observe_event(&mut self, event: &SolverEvent) -> usize {
        let Some(features) = event.numeric_statistics() else {
            return 0;
        };
        match event.search_time_ms(&self.time_key) {
            Some(elapsed_ms) => self.observe(elapsed_ms, &features),
            None => {
                self.skipped_events += 1;
                0
            }
        }
    }

    /// Every save point has a snapshot.
    pub fn is_complete(&self) -> bool {
        self.snapshots.len() == self.save_points.len()
    }

    pub fn snapshots(&self) -> &[StatisticsSnapshot] {
        &self.snapshots
    }

    /// Statistics events that lacked the time statistic.
    pub fn skipped_events(&self) -> usize {
        self.skipped_events
    }

    pub fn into_snapshots(self) -> Vec<StatisticsSnapshot> {
        self.snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(nodes: f64) -> BTreeMap<String, f64> {
        BTreeMap::from([("nodes".to_string(), nodes)])
    }

    #[test]
    fn test_save_points_from_increment() {
        let points = SavePoints::from_increment(5.0).unwrap();
        assert_eq!(points.len(), 20);
        assert_eq!(points.as_slice()[0], 0.0);
        assert_eq!(points.as_slice()[19], 95.0);

        let points = SavePoints::from_increment(0.5).unwrap();
        assert_eq!(points.len(), 200);
        assert_eq!(points.as_slice()[199], 99.5);

        // Increments that don't divide 100 stop below it.
        let points = SavePoints::from_increment(30.0).unwrap();
        assert_eq!(points.as_slice(), &[0.0, 30.0, 60.0, 90.0]);

        assert_eq!(SavePoints::from_increment(100.0).unwrap().as_slice(), &[0.0]);
    }

    #[test]
    fn test_save_points_rejects_bad_input() {
        assert!(SavePoints::from_increment(0.0).is_err());
        assert!(SavePoints::from_increment(-1.0).is_err());
        assert!(SavePoints::from_increment(f64::NAN).is_err());
        assert!(SavePoints::from_increment(150.0).is_err());
        assert!(SavePoints::from_increment(1e-12).is_err());
        assert!(SavePoints::from_increment(f64::MIN_POSITIVE).is_err());
        assert!(SavePoints::from_increment(0.01).unwrap().len() <= MAX_SAVE_POINTS);
        assert!(SavePoints::new(vec![]).is_err());
        assert!(SavePoints::new(vec![0.0, 10.0, 10.0]).is_err());
        assert!(SavePoints::new(vec![0.0, 100.0]).is_err());
        assert!(SavePoints::new(vec![0.0, 25.0, 50.0]).is_ok());
    }

    #[test]
    fn test_each_sample_fills_the_next_point() {
        // Save points 0, 5, 10 against a 100 ms limit; samples at 4, 6, 11 ms.
        let save_points = SavePoints::new(vec![0.0, 5.0, 10.0]).unwrap();
        let mut extractor = SnapshotExtractor::new(save_points, 100, "optTime");

        assert_eq!(extractor.observe(4.0, &features(1.0)), 1);
        assert_eq!(extractor.observe(6.0, &features(2.0)), 1);
        assert_eq!(extractor.observe(11.0, &features(3.0)), 1);
        assert!(extractor.is_complete());

        let snapshots = extractor.into_snapshots();
        let percents: Vec<f64> = snapshots.iter().map(|s| s.percent).collect();
        assert_eq!(percents, vec![0.0, 5.0, 10.0]);
        assert_eq!(snapshots[0].features["nodes"], 1.0);
        assert_eq!(snapshots[1].features["nodes"], 2.0);
        assert_eq!(snapshots[2].features["nodes"], 3.0);
    }

    #[test]
    fn test_points_between_samples() {
        // Save points 5 and 10; samples at 4%, 6% and 11% of the limit.
        let save_points = SavePoints::new(vec![5.0, 10.0]).unwrap();
        let mut extractor = SnapshotExtractor::new(save_points, 1000, "optTime");

        assert_eq!(extractor.observe(40.0, &features(1.0)), 0);
        assert_eq!(extractor.observe(60.0, &features(2.0)), 1);
        assert_eq!(extractor.observe(110.0, &features(3.0)), 1);

        let snapshots = extractor.into_snapshots();
        let percents: Vec<f64> = snapshots.iter().map(|s| s.percent).collect();
        assert_eq!(percents, vec![5.0, 10.0]);
        assert_eq!(snapshots[0].features["nodes"], 2.0);
        assert_eq!(snapshots[1].features["nodes"], 3.0);
    }

    #[test]
    fn test_jump_over_several_points() {
        let save_points = SavePoints::new(vec![0.0, 5.0, 10.0, 15.0]).unwrap();
        let mut extractor = SnapshotExtractor::new(save_points, 100, "optTime");

        assert_eq!(extractor.observe(12.0, &features(7.0)), 3);
        assert!(!extractor.is_complete());
        assert!(extractor.snapshots().iter().all(|s| s.features["nodes"] == 7.0));
    }

    #[test]
    fn test_snapshots_stay_monotonic() {
        let save_points = SavePoints::from_increment(10.0).unwrap();
        let mut extractor = SnapshotExtractor::new(save_points, 1000, "optTime");

        // Out-of-order samples never revisit filled points.
        for elapsed in [0.0, 250.0, 120.0, 310.0, 90.0, 980.0] {
            extractor.observe(elapsed, &features(elapsed));
        }
        let percents: Vec<f64> = extractor.snapshots().iter().map(|s| s.percent).collect();
        assert!(percents.windows(2).all(|w| w[0] < w[1]));
        assert!(extractor.is_complete());
    }

    #[test]
    fn test_incomplete_run_keeps_prefix() {
        let save_points = SavePoints::from_increment(25.0).unwrap();
        let mut extractor = SnapshotExtractor::new(save_points, 1000, "optTime");
        extractor.observe(0.0, &features(1.0));
        extractor.observe(300.0, &features(2.0));

        assert!(!extractor.is_complete());
        assert_eq!(extractor.snapshots().len(), 2);
    }

    #[test]
    fn test_observe_event_uses_time_key() {
        let save_points = SavePoints::from_increment(50.0).unwrap();
        let mut extractor = SnapshotExtractor::new(save_points, 1000, "optTime");

        let timed = SolverEvent::from_line(
            r#"{"type":"statistics","statistics":{"optTime":0.6,"nodes":12,"failures":3}}"#,
        )
        .unwrap();
        assert_eq!(extractor.observe_event(&timed), 2);
        assert_eq!(extractor.snapshots()[1].features["failures"], 3.0);
        // The time statistic itself is part of the feature vector.
        assert_eq!(extractor.snapshots()[1].features["optTime"], 0.6);

        let untimed =
            SolverEvent::from_line(r#"{"type":"statistics","statistics":{"nodes":1}}"#).unwrap();
        let mut extractor = SnapshotExtractor::new(SavePoints::from_increment(50.0).unwrap(), 1000, "optTime");
        assert_eq!(extractor.observe_event(&untimed), 0);
        assert_eq!(extractor.skipped_events(), 1);

        let solution = SolverEvent::from_line(r#"{"type":"solution","time":3}"#).unwrap();
        assert_eq!(extractor.observe_event(&solution), 0);
        assert_eq!(extractor.skipped_events(), 1);
    }
}
