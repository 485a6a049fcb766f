//! Usage statistics derived from a device's reading history.
//!
//! Every statistic treats consecutive samples as the endpoints of a trapezoid
//! in power-over-time space. Nothing here touches storage and nothing here
//! fails: telemetry comes from uncontrolled hardware, so negative or
//! non-finite numbers are read as 0.

use crate::model::{DeviceId, PowerState, Reading};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// Trailing windows the engine reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Day,
    Month,
}

impl Window {
    pub fn duration(&self) -> Duration {
        match self {
            Window::Day => Duration::hours(24),
            Window::Month => Duration::days(30),
        }
    }
}

/// Rolling figures for one device.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetrics {
    pub kwh_24h: f64,
    pub kwh_30d: f64,
    pub avg_daily_hours: f64,
    pub peak_watts: f64,
    pub current_state: PowerState,
}

/// Coerces a telemetry value into something safe to aggregate.
pub fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

fn chronological(a: &Reading, b: &Reading) -> Ordering {
    a.time
        .cmp(&b.time)
        .then_with(|| sanitize(a.power_watts).total_cmp(&sanitize(b.power_watts)))
}

/// Readings inside `[now - window, now]`, oldest first.
fn in_window<'a>(
    readings: &'a [Reading],
    now: DateTime<Utc>,
    window: Window,
) -> Vec<&'a Reading> {
    let start = now - window.duration();
    let mut selected: Vec<&Reading> = readings
        .iter()
        .filter(|r| r.time >= start && r.time <= now)
        .collect();
    selected.sort_by(|a, b| chronological(a, b));
    selected
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / MS_PER_HOUR).max(0.0)
}

/// Energy drawn over the trailing window, in kWh.
///
/// The gap after the newest sample is closed at `now` with that sample's
/// power held constant. A lone sample cannot form a trapezoid, so its own
/// `energyKwh` figure stands in as the estimate.
pub fn windowed_kwh(readings: &[Reading], now: DateTime<Utc>, window: Window) -> f64 {
    let samples = in_window(readings, now, window);

    match samples.as_slice() {
        [] => 0.0,
        [only] => sanitize(only.energy_kwh),
        [.., last] => {
            let mut watt_hours: f64 = samples
                .windows(2)
                .map(|pair| {
                    let avg = (sanitize(pair[0].power_watts) + sanitize(pair[1].power_watts)) / 2.0;
                    avg * hours_between(pair[0].time, pair[1].time)
                })
                .sum();
            watt_hours += sanitize(last.power_watts) * hours_between(last.time, now);
            watt_hours / 1000.0
        }
    }
}

/// Mean hours per day covered by consecutive samples over the last 30 days.
///
/// Days are UTC calendar days. A day only counts when at least one gap
/// between its samples has a positive length.
pub fn avg_daily_hours(readings: &[Reading], now: DateTime<Utc>) -> f64 {
    let samples = in_window(readings, now, Window::Month);

    let mut per_day: Vec<(NaiveDate, f64)> = Vec::new();
    for pair in samples.windows(2) {
        let day = pair[0].time.date_naive();
        if pair[1].time.date_naive() != day {
            continue;
        }
        let hours = hours_between(pair[0].time, pair[1].time);
        match per_day.last_mut() {
            Some((last_day, total)) if *last_day == day => *total += hours,
            _ => per_day.push((day, hours)),
        }
    }

    let active: Vec<f64> = per_day
        .into_iter()
        .map(|(_, hours)| hours)
        .filter(|hours| *hours > 0.0)
        .collect();

    if active.is_empty() {
        0.0
    } else {
        active.iter().sum::<f64>() / active.len() as f64
    }
}

/// Highest positive power seen in the last 30 days, or 0.
pub fn peak_watts(readings: &[Reading], now: DateTime<Utc>) -> f64 {
    in_window(readings, now, Window::Month)
        .into_iter()
        .map(|r| sanitize(r.power_watts))
        .fold(0.0, f64::max)
}

/// Point-in-time state from the newest reading alone.
pub fn current_state(latest: Option<&Reading>) -> PowerState {
    match latest {
        Some(reading) if sanitize(reading.power_watts) > 0.0 => PowerState::On,
        _ => PowerState::Off,
    }
}

pub fn latest_reading(readings: &[Reading]) -> Option<&Reading> {
    readings.iter().max_by(|a, b| chronological(a, b))
}

/// All figures for one device.
///
/// `history` should cover at least the last 30 days; `latest` is the newest
/// sample regardless of age.
pub fn device_metrics(
    history: &[Reading],
    latest: Option<&Reading>,
    now: DateTime<Utc>,
) -> DeviceMetrics {
    DeviceMetrics {
        kwh_24h: windowed_kwh(history, now, Window::Day),
        kwh_30d: windowed_kwh(history, now, Window::Month),
        avg_daily_hours: avg_daily_hours(history, now),
        peak_watts: peak_watts(history, now),
        current_state: current_state(latest),
    }
}

/// Metrics for every device in `device_ids`, with zeroed figures for devices
/// that have no readings.
pub fn metrics_by_device(
    device_ids: &[DeviceId],
    history: &[Reading],
    latest: &[Reading],
    now: DateTime<Utc>,
) -> HashMap<DeviceId, DeviceMetrics> {
    let mut grouped: HashMap<DeviceId, Vec<Reading>> = HashMap::new();
    for reading in history {
        grouped
            .entry(reading.device_id)
            .or_default()
            .push(reading.clone());
    }

    let mut newest: HashMap<DeviceId, &Reading> = HashMap::new();
    for reading in latest {
        newest
            .entry(reading.device_id)
            .and_modify(|current| {
                if chronological(reading, current) == Ordering::Greater {
                    *current = reading;
                }
            })
            .or_insert(reading);
    }

    device_ids
        .iter()
        .map(|id| {
            let readings = grouped.get(id).map(Vec::as_slice).unwrap_or(&[]);
            let metrics = device_metrics(readings, newest.get(id).copied(), now);
            (*id, metrics)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading(device_id: DeviceId, power_watts: f64, time: DateTime<Utc>) -> Reading {
        Reading {
            device_id,
            power_watts,
            voltage: 230.0,
            current_amps: power_watts / 230.0,
            energy_kwh: 0.0,
            frequency: 50.0,
            power_factor: 1.0,
            time,
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_trapezoid_three_samples() {
        let t0 = noon() - Duration::hours(1);
        let readings = vec![
            reading(1, 500.0, t0),
            reading(1, 1500.0, t0 + Duration::seconds(600)),
            reading(1, 0.0, t0 + Duration::seconds(1200)),
        ];

        let expected = ((500.0 + 1500.0) / 2.0 * 600.0 / 3600.0
            + (1500.0 + 0.0) / 2.0 * 600.0 / 3600.0)
            / 1000.0;
        assert_close(windowed_kwh(&readings, noon(), Window::Day), expected);
        assert_close(expected, 0.2916666666666667);
    }

    #[test]
    fn test_open_tail_holds_last_power() {
        let now = noon();
        let readings = vec![
            reading(1, 1000.0, now - Duration::hours(2)),
            reading(1, 1000.0, now - Duration::hours(1)),
        ];

        // One hour between samples plus one hour of tail, both at 1 kW.
        assert_close(windowed_kwh(&readings, now, Window::Day), 2.0);
    }

    #[test]
    fn test_order_does_not_matter() {
        let now = noon();
        let mut readings = vec![
            reading(1, 120.0, now - Duration::minutes(50)),
            reading(1, 900.0, now - Duration::minutes(40)),
            reading(1, 40.0, now - Duration::minutes(25)),
            reading(1, 0.0, now - Duration::minutes(5)),
            reading(1, 300.0, now - Duration::minutes(25)),
        ];
        let sorted = windowed_kwh(&readings, now, Window::Day);

        readings.reverse();
        assert_close(windowed_kwh(&readings, now, Window::Day), sorted);

        readings.swap(0, 3);
        readings.swap(1, 4);
        assert_close(windowed_kwh(&readings, now, Window::Day), sorted);
    }

    #[test]
    fn test_malformed_power_never_goes_negative() {
        let now = noon();
        let readings = vec![
            reading(1, -4000.0, now - Duration::minutes(30)),
            reading(1, f64::NAN, now - Duration::minutes(20)),
            reading(1, f64::NEG_INFINITY, now - Duration::minutes(10)),
            reading(1, -1.0, now - Duration::minutes(1)),
        ];

        let kwh = windowed_kwh(&readings, now, Window::Day);
        assert_eq!(kwh, 0.0);
        assert_eq!(peak_watts(&readings, now), 0.0);
    }

    #[test]
    fn test_single_reading_uses_energy_fallback() {
        let now = noon();
        let mut lone = reading(1, 800.0, now - Duration::minutes(30));
        assert_eq!(windowed_kwh(&[lone.clone()], now, Window::Day), 0.0);

        lone.energy_kwh = 1.25;
        assert_close(windowed_kwh(&[lone.clone()], now, Window::Day), 1.25);

        lone.energy_kwh = -3.0;
        assert_eq!(windowed_kwh(&[lone], now, Window::Day), 0.0);
    }

    #[test]
    fn test_window_excludes_old_and_future_samples() {
        let now = noon();
        let readings = vec![
            reading(1, 5000.0, now - Duration::hours(30)),
            reading(1, 100.0, now - Duration::hours(2)),
            reading(1, 100.0, now - Duration::hours(1)),
            reading(1, 9000.0, now + Duration::hours(1)),
        ];

        assert_close(windowed_kwh(&readings, now, Window::Day), 0.2);
        assert!(windowed_kwh(&readings, now, Window::Month) > 0.2);
    }

    #[test]
    fn test_empty_history_is_zero() {
        let metrics = device_metrics(&[], None, noon());
        assert_eq!(metrics, DeviceMetrics::default());
        assert_eq!(metrics.current_state, PowerState::Off);
    }

    #[test]
    fn test_avg_daily_hours() {
        let day_one = Utc.with_ymd_and_hms(2024, 5, 8, 8, 0, 0).unwrap();
        let day_two = Utc.with_ymd_and_hms(2024, 5, 9, 8, 0, 0).unwrap();
        let readings = vec![
            reading(1, 50.0, day_one),
            reading(1, 50.0, day_one + Duration::hours(2)),
            reading(1, 50.0, day_one + Duration::hours(3)),
            reading(1, 50.0, day_two),
            reading(1, 50.0, day_two + Duration::hours(1)),
            // A day with a single sample has no gap and does not count.
            reading(1, 50.0, Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap()),
        ];

        assert_close(avg_daily_hours(&readings, noon()), 2.0);
    }

    #[test]
    fn test_avg_daily_hours_ignores_gap_across_midnight() {
        let late = Utc.with_ymd_and_hms(2024, 5, 8, 23, 0, 0).unwrap();
        let readings = vec![
            reading(1, 10.0, late),
            reading(1, 10.0, late + Duration::hours(2)),
        ];

        assert_eq!(avg_daily_hours(&readings, noon()), 0.0);
    }

    #[test]
    fn test_peak_watts_within_month() {
        let now = noon();
        let readings = vec![
            reading(1, 2200.0, now - Duration::days(31)),
            reading(1, 1800.0, now - Duration::days(3)),
            reading(1, 950.0, now - Duration::hours(3)),
        ];

        assert_eq!(peak_watts(&readings, now), 1800.0);
    }

    #[test]
    fn test_current_state_uses_latest_only() {
        let now = noon();
        let readings = vec![
            reading(1, 1200.0, now - Duration::minutes(10)),
            reading(1, 0.0, now - Duration::minutes(1)),
        ];

        assert_eq!(current_state(latest_reading(&readings)), PowerState::Off);
        assert_eq!(current_state(Some(&readings[0])), PowerState::On);
        assert_eq!(current_state(None), PowerState::Off);
    }

    #[test]
    fn test_metrics_by_device_fills_missing_devices() {
        let now = noon();
        let history = vec![
            reading(1, 600.0, now - Duration::hours(2)),
            reading(1, 600.0, now - Duration::hours(1)),
            reading(2, 40.0, now - Duration::hours(1)),
        ];
        let latest = vec![history[1].clone(), history[2].clone()];

        let metrics = metrics_by_device(&[1, 2, 3], &history, &latest, now);

        assert_eq!(metrics.len(), 3);
        assert_close(metrics[&1].kwh_24h, 1.2);
        assert_eq!(metrics[&1].peak_watts, 600.0);
        assert_eq!(metrics[&2].current_state, PowerState::On);
        assert_eq!(metrics[&3], DeviceMetrics::default());
    }

    #[test]
    fn test_metrics_serialize_camel_case() {
        let json = serde_json::to_value(DeviceMetrics {
            current_state: PowerState::On,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(json["currentState"], "on");
        assert!(json.get("kwh24h").is_some());
        assert!(json.get("avgDailyHours").is_some());
    }
}
