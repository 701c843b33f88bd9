use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::cache::CacheKey;
use crate::fetch::{FetchStatus, Scene};
use crate::settings::Settings;
use crate::split::Subset;
use crate::types::{DateRange, Label, PointId};

/// `timesteps` equal slots over a date range. Slot `i` holds the dates whose
/// day offset `d` satisfies `i == d * T / D` (integer division).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    range: DateRange,
    timesteps: usize,
}

impl Timeline {
    pub fn new(range: DateRange, timesteps: usize) -> Self {
        Self { range, timesteps }
    }

    pub fn range(&self) -> DateRange {
        self.range
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    fn days(&self) -> i64 {
        self.range.num_days().max(1)
    }

    pub fn slot_of(&self, date: NaiveDate) -> Option<usize> {
        if !self.range.contains(date) || self.timesteps == 0 {
            return None;
        }
        let offset = (date - self.range.start).num_days();
        let slot = (offset * self.timesteps as i64 / self.days()) as usize;
        Some(slot.min(self.timesteps - 1))
    }

    /// Centre of slot `index` as a fractional day offset from the range start.
    fn centre_offset(&self, index: usize) -> f64 {
        (index as f64 + 0.5) * self.days() as f64 / self.timesteps as f64
    }

    pub fn slot_centre(&self, index: usize) -> NaiveDate {
        self.range.start + Duration::days(self.centre_offset(index).floor() as i64)
    }

    /// Band values per slot, taking the usable scene nearest each slot centre.
    /// Ties go to the earlier scene.
    pub fn bin(&self, scenes: &[Scene], bands: &[String]) -> Vec<Option<Vec<f64>>> {
        let mut best: Vec<Option<(f64, NaiveDate, Vec<f64>)>> = vec![None; self.timesteps];

        for scene in scenes {
            let Some(slot) = self.slot_of(scene.date) else {
                continue;
            };
            let Some(values) = scene.band_values(bands) else {
                continue;
            };
            let offset = (scene.date - self.range.start).num_days() as f64;
            let distance = (offset - self.centre_offset(slot)).abs();

            let replace = match &best[slot] {
                None => true,
                Some((current, date, _)) => {
                    distance < *current || (distance == *current && scene.date < *date)
                }
            };
            if replace {
                best[slot] = Some((distance, scene.date, values));
            }
        }

        best.into_iter()
            .map(|slot| slot.map(|(_, _, values)| values))
            .collect()
    }

    pub fn observed_slots(&self, scenes: &[Scene], bands: &[String]) -> usize {
        self.bin(scenes, bands).iter().filter(|slot| slot.is_some()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepQuality {
    Observed,
    Filled,
    Missing,
}

impl TimestepQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimestepQuality::Observed => "observed",
            TimestepQuality::Filled => "filled",
            TimestepQuality::Missing => "missing",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "observed" => Some(TimestepQuality::Observed),
            "filled" => Some(TimestepQuality::Filled),
            "missing" => Some(TimestepQuality::Missing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapePolicy {
    pub bands: Vec<String>,
    pub timesteps: usize,
    pub min_valid_timesteps: usize,
    pub max_gap_fill: usize,
}

impl ShapePolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bands: settings.shape.bands.clone(),
            timesteps: settings.shape.timesteps,
            min_valid_timesteps: settings.shape.min_valid_timesteps,
            max_gap_fill: settings.shape.max_gap_fill,
        }
    }
}

/// Fixed B x T array for one point. `values` is band-major: `values[b * T + t]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    pub point_id: PointId,
    pub label: Label,
    pub subset: Subset,
    pub cache_key: CacheKey,
    pub status: FetchStatus,
    pub bands: Vec<String>,
    pub timesteps: usize,
    pub values: Vec<f64>,
    pub quality: Vec<TimestepQuality>,
}

impl FeatureVector {
    pub fn shape(&self) -> (usize, usize) {
        (self.bands.len(), self.timesteps)
    }

    pub fn value(&self, band: usize, timestep: usize) -> f64 {
        self.values[band * self.timesteps + timestep]
    }

    pub fn observed_timesteps(&self) -> usize {
        self.count(TimestepQuality::Observed)
    }

    pub fn count(&self, quality: TimestepQuality) -> usize {
        self.quality.iter().filter(|q| **q == quality).count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Shaped {
        values: Vec<f64>,
        quality: Vec<TimestepQuality>,
    },
    Insufficient {
        observed: usize,
    },
}

/// Bins scenes into the timeline and fills short gaps.
///
/// Runs of empty slots no longer than `max_gap_fill` take the values of the
/// nearest observed slot (the earlier neighbour on ties) and are marked
/// `Filled`. Longer runs stay `Missing` with NaN values.
pub fn normalize(scenes: &[Scene], timeline: &Timeline, policy: &ShapePolicy) -> Normalized {
    let slots = timeline.bin(scenes, &policy.bands);
    let observed = slots.iter().filter(|slot| slot.is_some()).count();
    if observed < policy.min_valid_timesteps || observed == 0 {
        return Normalized::Insufficient { observed };
    }

    let t_len = slots.len();
    let b_len = policy.bands.len();
    let mut source: Vec<Option<usize>> = (0..t_len).map(|t| slots[t].as_ref().map(|_| t)).collect();
    let mut quality: Vec<TimestepQuality> = slots
        .iter()
        .map(|slot| match slot {
            Some(_) => TimestepQuality::Observed,
            None => TimestepQuality::Missing,
        })
        .collect();

    let mut t = 0;
    while t < t_len {
        if slots[t].is_some() {
            t += 1;
            continue;
        }
        let run_start = t;
        while t < t_len && slots[t].is_none() {
            t += 1;
        }
        let run_end = t;
        if run_end - run_start > policy.max_gap_fill {
            continue;
        }

        let left = run_start.checked_sub(1);
        let right = (run_end < t_len).then_some(run_end);
        for gap in run_start..run_end {
            let nearest = match (left, right) {
                (Some(l), Some(r)) => {
                    if gap - l <= r - gap {
                        Some(l)
                    } else {
                        Some(r)
                    }
                }
                (Some(l), None) => Some(l),
                (None, Some(r)) => Some(r),
                (None, None) => None,
            };
            if let Some(from) = nearest {
                source[gap] = Some(from);
                quality[gap] = TimestepQuality::Filled;
            }
        }
    }

    let mut values = vec![f64::NAN; b_len * t_len];
    for (t, from) in source.iter().enumerate() {
        if let Some(band_values) = from.and_then(|from| slots[from].as_ref()) {
            for (b, value) in band_values.iter().enumerate() {
                values[b * t_len + t] = *value;
            }
        }
    }

    Normalized::Shaped { values, quality }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn scene(day: i64, value: f64) -> Scene {
        let mut values = BTreeMap::new();
        values.insert("B4".to_string(), Some(value));
        values.insert("B8".to_string(), Some(value * 2.0));
        Scene {
            date: date(2021, 1, 1) + Duration::days(day),
            values,
        }
    }

    fn policy(timesteps: usize, min_valid: usize, max_gap_fill: usize) -> ShapePolicy {
        ShapePolicy {
            bands: vec!["B4".to_string(), "B8".to_string()],
            timesteps,
            min_valid_timesteps: min_valid,
            max_gap_fill,
        }
    }

    fn timeline(timesteps: usize) -> Timeline {
        // 100 days, so each of 10 slots is 10 days wide.
        Timeline::new(DateRange::new(date(2021, 1, 1), date(2021, 4, 11)), timesteps)
    }

    #[test]
    fn slots_partition_the_range() {
        let timeline = timeline(10);
        assert_eq!(timeline.slot_of(date(2021, 1, 1)), Some(0));
        assert_eq!(timeline.slot_of(date(2021, 1, 10)), Some(0));
        assert_eq!(timeline.slot_of(date(2021, 1, 11)), Some(1));
        assert_eq!(timeline.slot_of(date(2021, 4, 10)), Some(9));
        assert_eq!(timeline.slot_of(date(2021, 4, 11)), None);
        assert_eq!(timeline.slot_of(date(2020, 12, 31)), None);
        assert_eq!(timeline.slot_centre(0), date(2021, 1, 6));
    }

    #[test]
    fn nearest_scene_to_slot_centre_wins() {
        let timeline = timeline(10);
        let scenes = vec![scene(0, 1.0), scene(4, 2.0), scene(6, 3.0)];
        let slots = timeline.bin(&scenes, &policy(10, 1, 0).bands);
        // Centre of slot 0 is day 5; days 4 and 6 tie and the earlier one wins.
        assert_eq!(slots[0], Some(vec![2.0, 4.0]));
        assert!(slots[1..].iter().all(Option::is_none));
    }

    #[test]
    fn scenes_missing_a_band_are_unusable() {
        let timeline = timeline(10);
        let mut cloudy = scene(5, 1.0);
        cloudy.values.insert("B8".to_string(), None);
        let mut partial = scene(15, 1.0);
        partial.values.remove("B8");
        assert_eq!(timeline.observed_slots(&[cloudy, partial], &policy(10, 1, 0).bands), 0);
    }

    #[test]
    fn eight_of_ten_slots_leaves_two_flagged() {
        let timeline = timeline(10);
        let scenes: Vec<Scene> = [0, 1, 2, 3, 5, 6, 7, 9]
            .iter()
            .map(|slot| scene(slot * 10 + 5, *slot as f64))
            .collect();

        let Normalized::Shaped { values, quality } =
            normalize(&scenes, &timeline, &policy(10, 6, 1))
        else {
            panic!("expected a shaped vector");
        };

        assert_eq!(values.len(), 2 * 10);
        assert_eq!(quality[4], TimestepQuality::Filled);
        assert_eq!(quality[8], TimestepQuality::Filled);
        let not_observed = quality
            .iter()
            .filter(|q| **q != TimestepQuality::Observed)
            .count();
        assert_eq!(not_observed, 2);
        // Slot 4 ties between slots 3 and 5 and takes the earlier neighbour.
        assert_eq!(values[4], 3.0);
        assert_eq!(values[10 + 8], 14.0);
    }

    #[test]
    fn long_gaps_stay_missing() {
        let timeline = timeline(10);
        let scenes: Vec<Scene> = [0, 1, 2, 3, 4, 8, 9]
            .iter()
            .map(|slot| scene(slot * 10 + 5, 1.0))
            .collect();

        let Normalized::Shaped { values, quality } =
            normalize(&scenes, &timeline, &policy(10, 6, 2))
        else {
            panic!("expected a shaped vector");
        };
        assert_eq!(
            &quality[5..8],
            &[TimestepQuality::Missing; 3]
        );
        assert!(values[5].is_nan() && values[10 + 7].is_nan());
    }

    #[test]
    fn too_few_observations_is_insufficient() {
        let timeline = timeline(10);
        let scenes = vec![scene(5, 1.0), scene(15, 1.0)];
        assert_eq!(
            normalize(&scenes, &timeline, &policy(10, 6, 1)),
            Normalized::Insufficient { observed: 2 }
        );
    }
}
