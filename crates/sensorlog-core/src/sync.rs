//! Align several series onto the timestamps of one anchor series.
//!
//! Companion series are linearly interpolated onto each anchor timestamp.
//! Rows outside a companion's observed range are dropped rather than
//! extrapolated: later data will usually arrive and cover them on a later pass.
//!
//! With [`Averaging`] the inputs are averaged first, either into fixed
//! period-wide bins (one row per bin) or as a trailing mean at each anchor
//! timestamp. Bins are aligned to multiples of the period in UTC.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{Error, Result};
use crate::params::Params;
use crate::reading::Reading;
use crate::store::TimeSeriesStore;

/// How far before the first anchor timestamp companion data is read.
pub const COMPANION_LOOKBACK_SECS: i64 = 70 * 60;

/// Anchor timestamps with one aligned value column per input series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncedFrame {
    pub timestamps: Vec<i64>,
    /// `(series key, values)`, anchor first, then companions in request order.
    pub columns: Vec<(String, Vec<f64>)>,
}

impl SyncedFrame {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Values of the column for `key` (exact match).
    pub fn column(&self, key: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }
}

/// Where an averaged row is stamped within its averaging period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeLabel {
    Left,
    #[default]
    Center,
    Right,
}

impl TimeLabel {
    /// `left`, `center` or `right`; anything else is `Center`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => TimeLabel::Left,
            "right" => TimeLabel::Right,
            _ => TimeLabel::Center,
        }
    }
}

/// Averaging applied to every input before a series calculation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Averaging {
    /// Period length in seconds.
    pub period: i64,
    /// Trailing mean at each anchor timestamp instead of fixed bins.
    pub rolling: bool,
    pub label: TimeLabel,
}

impl Averaging {
    /// Read `averaging_hours`, `rolling_average` and `time_label`. `None` when
    /// `averaging_hours` is absent or not positive.
    ///
    /// Rolling windows are truncated to whole minutes.
    pub fn from_params(params: &Params) -> Result<Option<Self>> {
        let hours = params.f64_or("averaging_hours", 0.0)?;
        if hours.is_nan() || hours <= 0.0 {
            return Ok(None);
        }
        let rolling = params.bool_or("rolling_average", false)?;
        let period = if rolling {
            (hours * 60.0).floor() as i64 * 60
        } else {
            (hours * 3600.0).round() as i64
        };
        if period <= 0 {
            return Err(Error::Params(format!(
                "averaging_hours={hours} is shorter than the smallest averaging period"
            )));
        }
        let label = params
            .text("time_label")
            .map_or(TimeLabel::Center, |s| TimeLabel::parse(&s));
        Ok(Some(Self {
            period,
            rolling,
            label,
        }))
    }

    /// Offset of the stamp from the start of its period.
    fn stamp_from_start(&self) -> i64 {
        match self.label {
            TimeLabel::Left => 0,
            TimeLabel::Center => self.period / 2,
            TimeLabel::Right => self.period,
        }
    }
}

/// Builds [`SyncedFrame`]s from a [`TimeSeriesStore`].
pub struct SyncEngine<'a> {
    store: &'a TimeSeriesStore,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a TimeSeriesStore) -> Self {
        Self { store }
    }

    /// Anchor readings strictly after `max(earliest_allowed_ts, last ts of
    /// output_key)`, each paired with every companion interpolated onto it.
    ///
    /// Returns an empty frame when there are no new anchor readings or when
    /// any companion has no readings in its window.
    pub fn build(
        &self,
        anchor_key: &str,
        companion_keys: &[&str],
        earliest_allowed_ts: i64,
        output_key: Option<&str>,
    ) -> SyncedFrame {
        let last_output = output_key
            .and_then(|k| self.store.last_read(k))
            .map_or(0, |r| r.ts);
        let floor = earliest_allowed_ts.max(last_output);

        let anchor = self
            .store
            .range(anchor_key, Some(floor.saturating_add(1)), None);
        let Some(first) = anchor.first() else {
            return SyncedFrame::default();
        };
        let window_start = first.ts - COMPANION_LOOKBACK_SECS;

        let mut timestamps: Vec<i64> = anchor.iter().map(|r| r.ts).collect();
        let mut columns = vec![(
            anchor_key.to_string(),
            anchor.iter().map(|r| r.val).collect::<Vec<f64>>(),
        )];

        for &key in companion_keys {
            let series = self.store.range(key, Some(window_start + 1), None);
            if series.is_empty() {
                debug!("no readings for '{key}' since {window_start}, nothing to synchronize");
                return SyncedFrame::default();
            }
            let values = timestamps.iter().map(|&t| interpolate(&series, t)).collect();
            columns.push((key.to_string(), values));
        }

        // Drop rows where any companion could not be interpolated.
        let keep: Vec<bool> = (0..timestamps.len())
            .map(|i| columns.iter().all(|(_, v)| !v[i].is_nan()))
            .collect();
        if keep.iter().any(|k| !k) {
            timestamps = filter_by(&timestamps, &keep);
            for (_, values) in columns.iter_mut() {
                *values = filter_by(values, &keep);
            }
        }

        SyncedFrame {
            timestamps,
            columns,
        }
    }

    /// Like [`SyncEngine::build`], but rows are averages over
    /// `averaging.period`, stamped per `averaging.label`, and only rows
    /// stamped after `max(earliest_allowed_ts, last ts of output_key)` are
    /// returned.
    ///
    /// Fixed bins need readings from every input in the bin; the newest
    /// shared bin is dropped because it is usually still filling.
    pub fn build_averaged(
        &self,
        anchor_key: &str,
        companion_keys: &[&str],
        earliest_allowed_ts: i64,
        output_key: Option<&str>,
        averaging: &Averaging,
    ) -> SyncedFrame {
        let last_output = output_key
            .and_then(|k| self.store.last_read(k))
            .map_or(0, |r| r.ts);
        let floor = earliest_allowed_ts.max(last_output);
        if averaging.rolling {
            self.rolling(anchor_key, companion_keys, floor, averaging)
        } else {
            self.binned(anchor_key, companion_keys, floor, averaging)
        }
    }

    fn binned(&self, anchor_key: &str, companion_keys: &[&str], floor: i64, avg: &Averaging) -> SyncedFrame {
        let period = avg.period;
        let start = floor.div_euclid(period) * period - period;

        let keys: Vec<&str> = std::iter::once(anchor_key)
            .chain(companion_keys.iter().copied())
            .collect();
        let mut means: Vec<BTreeMap<i64, f64>> = Vec::with_capacity(keys.len());
        for key in &keys {
            let series = self.store.range(key, Some(start), None);
            if series.is_empty() {
                debug!("no readings for '{key}' since {start}, nothing to average");
                return SyncedFrame::default();
            }
            means.push(bin_means(&series, period));
        }

        let mut bins: Vec<i64> = means[0]
            .keys()
            .copied()
            .filter(|b| means[1..].iter().all(|m| m.contains_key(b)))
            .collect();
        bins.pop();
        let offset = avg.stamp_from_start();
        bins.retain(|b| b + offset > floor);
        if bins.is_empty() {
            return SyncedFrame::default();
        }

        SyncedFrame {
            timestamps: bins.iter().map(|b| b + offset).collect(),
            columns: keys
                .iter()
                .zip(&means)
                .map(|(k, m)| {
                    let values = bins
                        .iter()
                        .map(|b| m.get(b).copied().unwrap_or(f64::NAN))
                        .collect();
                    (k.to_string(), values)
                })
                .collect(),
        }
    }

    fn rolling(&self, anchor_key: &str, companion_keys: &[&str], floor: i64, avg: &Averaging) -> SyncedFrame {
        let period = avg.period;
        let offset = avg.stamp_from_start();
        // Row t covers (t - period, t] and is stamped at t - period + offset.
        let first_row_after = floor + period - offset;
        let base = self.build(anchor_key, companion_keys, first_row_after - period, None);
        if base.is_empty() {
            return base;
        }

        let mut timestamps = Vec::new();
        let mut columns: Vec<(String, Vec<f64>)> = base
            .columns
            .iter()
            .map(|(k, _)| (k.clone(), Vec::new()))
            .collect();
        let mut lo = 0;
        for (i, &t) in base.timestamps.iter().enumerate() {
            while base.timestamps[lo] <= t - period {
                lo += 1;
            }
            if t <= first_row_after {
                continue;
            }
            timestamps.push(t - period + offset);
            for ((_, values), (_, out)) in base.columns.iter().zip(columns.iter_mut()) {
                let window = &values[lo..=i];
                out.push(window.iter().sum::<f64>() / window.len() as f64);
            }
        }
        if timestamps.is_empty() {
            return SyncedFrame::default();
        }
        SyncedFrame {
            timestamps,
            columns,
        }
    }
}

/// Mean of the readings in each `period`-wide bin, keyed by bin start.
fn bin_means(series: &[Reading], period: i64) -> BTreeMap<i64, f64> {
    let mut acc: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for r in series {
        let slot = acc.entry(r.ts.div_euclid(period) * period).or_insert((0.0, 0));
        slot.0 += r.val;
        slot.1 += 1;
    }
    acc.into_iter()
        .map(|(bin, (sum, n))| (bin, sum / n as f64))
        .collect()
}

fn filter_by<T: Copy>(values: &[T], keep: &[bool]) -> Vec<T> {
    values
        .iter()
        .zip(keep)
        .filter(|(_, k)| **k)
        .map(|(v, _)| *v)
        .collect()
}

/// Linear interpolation of ascending `series` at `t`; NaN outside its range.
pub fn interpolate(series: &[Reading], t: i64) -> f64 {
    let i = series.partition_point(|r| r.ts <= t);
    if i == 0 {
        return f64::NAN;
    }
    let lo = series[i - 1];
    if lo.ts == t {
        return lo.val;
    }
    let Some(hi) = series.get(i) else {
        return f64::NAN;
    };
    let frac = (t - lo.ts) as f64 / (hi.ts - lo.ts) as f64;
    lo.val + (hi.val - lo.val) * frac
}
