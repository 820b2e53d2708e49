//! Detection counting.
//!
//! Per-frame detections fold into a `FrameTally`, tallies fold into a
//! `RunningAggregate`. The running fold uses only `max` and `+`, so partial
//! aggregates built over disjoint slices of a stream can be merged in any
//! order and still finalize to the same summary.

use serde::{Deserialize, Serialize};

use crate::detect::Detection;

/// COCO class id for "person".
pub const COCO_PERSON: u32 = 0;
/// COCO class id for "car".
pub const COCO_CAR: u32 = 2;
/// Class id treated as fire/smoke. COCO has no fire class; 43 is what the
/// bundled model reports and custom models will want to override it.
pub const DEFAULT_FIRE_CLASS: u32 = 43;

/// Which detector class ids count as persons, cars and fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassMap {
    pub person: u32,
    pub car: u32,
    pub fire: u32,
}

impl Default for ClassMap {
    fn default() -> Self {
        Self {
            person: COCO_PERSON,
            car: COCO_CAR,
            fire: DEFAULT_FIRE_CLASS,
        }
    }
}

/// Counts for a single sampled frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTally {
    pub persons: u64,
    pub cars: u64,
    pub fires: u64,
}

impl FrameTally {
    pub fn from_detections<'a, I>(detections: I, classes: &ClassMap) -> Self
    where
        I: IntoIterator<Item = &'a Detection>,
    {
        detections
            .into_iter()
            .fold(FrameTally::default(), |mut tally, det| {
                if det.class_id == classes.person {
                    tally.persons += 1;
                } else if det.class_id == classes.car {
                    tally.cars += 1;
                } else if det.class_id == classes.fire {
                    tally.fires += 1;
                }
                tally
            })
    }
}

/// Fold state for one processing call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunningAggregate {
    max_persons_per_frame: u64,
    total_cars: u64,
    total_fires: u64,
    frames_sampled: u64,
    frames_total: u64,
}

impl RunningAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a decoded frame, sampled or not.
    pub fn record_decoded(&mut self) {
        self.frames_total += 1;
    }

    /// Fold a sampled frame's tally.
    pub fn fold(&mut self, tally: FrameTally) {
        self.max_persons_per_frame = self.max_persons_per_frame.max(tally.persons);
        self.total_cars += tally.cars;
        self.total_fires += tally.fires;
        self.frames_sampled += 1;
    }

    /// Combine two partial aggregates over disjoint parts of a stream.
    pub fn merge(self, other: RunningAggregate) -> RunningAggregate {
        RunningAggregate {
            max_persons_per_frame: self.max_persons_per_frame.max(other.max_persons_per_frame),
            total_cars: self.total_cars + other.total_cars,
            total_fires: self.total_fires + other.total_fires,
            frames_sampled: self.frames_sampled + other.frames_sampled,
            frames_total: self.frames_total + other.frames_total,
        }
    }

    pub fn max_persons_per_frame(&self) -> u64 {
        self.max_persons_per_frame
    }

    pub fn frames_sampled(&self) -> u64 {
        self.frames_sampled
    }

    pub fn frames_total(&self) -> u64 {
        self.frames_total
    }

    /// Freeze the aggregate. No further folding is possible afterwards.
    pub fn finalize(self) -> AggregateSummary {
        AggregateSummary {
            max_persons_per_frame: self.max_persons_per_frame,
            total_cars: self.total_cars,
            total_fires: self.total_fires,
            frames_sampled: self.frames_sampled,
            frames_total: self.frames_total,
        }
    }
}

/// Finalized counts handed to classification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSummary {
    pub max_persons_per_frame: u64,
    pub total_cars: u64,
    pub total_fires: u64,
    pub frames_sampled: u64,
    pub frames_total: u64,
}
