use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRate {
    pub id: i64,
    pub avg_posts_per_min: f64,
}

/// Per-device arrival history. Identities are remembered for the lifetime of
/// the process; arrival timestamps only for the trailing window.
#[derive(Debug)]
pub struct DeviceActivity {
    window: ChronoDuration,
    seen: BTreeSet<i64>,
    arrivals: BTreeMap<i64, VecDeque<DateTime<Utc>>>,
}

impl DeviceActivity {
    pub fn new(window: Duration) -> Self {
        let window = ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::minutes(10));
        Self {
            window,
            seen: BTreeSet::new(),
            arrivals: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, device_id: i64, at: DateTime<Utc>) {
        self.seen.insert(device_id);
        let samples = self.arrivals.entry(device_id).or_default();
        samples.push_back(at);
        prune(samples, at - self.window);
    }

    pub fn distinct(&self) -> usize {
        self.seen.len()
    }

    /// Average posts per minute for every device ever seen, over the window
    /// ending at `now`. Devices with no arrivals in the window report 0.
    pub fn rates(&mut self, now: DateTime<Utc>) -> Vec<DeviceRate> {
        let cutoff = now - self.window;
        self.arrivals.retain(|_, samples| {
            prune(samples, cutoff);
            !samples.is_empty()
        });
        self.seen
            .iter()
            .map(|id| DeviceRate {
                id: *id,
                avg_posts_per_min: self.arrivals.get(id).map_or(0.0, posts_per_minute),
            })
            .collect()
    }
}

fn prune(samples: &mut VecDeque<DateTime<Utc>>, cutoff: DateTime<Utc>) {
    while samples.front().is_some_and(|ts| *ts < cutoff) {
        samples.pop_front();
    }
}

fn posts_per_minute(samples: &VecDeque<DateTime<Utc>>) -> f64 {
    let (Some(first), Some(last)) = (samples.front(), samples.back()) else {
        return 0.0;
    };
    if samples.len() < 2 {
        return 0.0;
    }
    let minutes = (*last - *first).num_milliseconds() as f64 / 60_000.0;
    if minutes <= 0.0 {
        return 0.0;
    }
    let rate = (samples.len() - 1) as f64 / minutes;
    (rate * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn single_sample_has_zero_rate() {
        let mut activity = DeviceActivity::new(Duration::from_secs(600));
        activity.record(1, at(0));
        assert_eq!(
            activity.rates(at(10)),
            vec![DeviceRate {
                id: 1,
                avg_posts_per_min: 0.0
            }]
        );
    }

    #[test]
    fn rate_counts_intervals_between_first_and_last() {
        let mut activity = DeviceActivity::new(Duration::from_secs(600));
        for secs in [0, 20, 40, 60] {
            activity.record(9, at(secs));
        }
        let rates = activity.rates(at(60));
        assert_eq!(rates[0].avg_posts_per_min, 3.0);

        activity.record(9, at(150));
        let rates = activity.rates(at(150));
        // 4 intervals over 2.5 minutes
        assert_eq!(rates[0].avg_posts_per_min, 1.6);
    }

    #[test]
    fn simultaneous_samples_have_zero_rate() {
        let mut activity = DeviceActivity::new(Duration::from_secs(600));
        activity.record(2, at(5));
        activity.record(2, at(5));
        assert_eq!(activity.rates(at(5))[0].avg_posts_per_min, 0.0);
    }

    #[test]
    fn quiet_devices_report_zero_rate() {
        let mut activity = DeviceActivity::new(Duration::from_secs(60));
        activity.record(1, at(0));
        activity.record(1, at(30));
        activity.record(2, at(100));
        activity.record(2, at(110));
        let rates = activity.rates(at(120));
        assert_eq!(
            rates,
            vec![
                DeviceRate {
                    id: 1,
                    avg_posts_per_min: 0.0
                },
                DeviceRate {
                    id: 2,
                    avg_posts_per_min: 6.0
                },
            ]
        );
        assert_eq!(rates.len(), activity.distinct());
        assert!(!activity.arrivals.contains_key(&1));
    }

    #[test]
    fn rates_round_to_two_decimals() {
        let mut activity = DeviceActivity::new(Duration::from_secs(600));
        activity.record(3, at(0));
        activity.record(3, at(45));
        activity.record(3, at(90));
        activity.record(3, at(180));
        // 3 intervals over 3 minutes
        assert_eq!(activity.rates(at(180))[0].avg_posts_per_min, 1.0);
        activity.record(3, at(250));
        // 4 intervals over 250s = 0.96 per minute
        assert_eq!(activity.rates(at(250))[0].avg_posts_per_min, 0.96);
    }
}
