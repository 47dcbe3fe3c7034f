//! Active speaker detection over the ssrc-audio-level extension.
//!
//! Each stream accumulates dBov readings into an [`AudioLevel`] window;
//! once per interval the session pump calls [`AudioObserver::calc`] and
//! broadcasts the streams whose last window was noisy, loudest first.
//! Levels are 0-127 where 0 is loudest, so comparisons are inverted
//! relative to intuition.

use std::collections::HashMap;
use std::sync::Mutex;

/// Length of one measurement window in milliseconds.
const WINDOW_MS: u32 = 500;
/// Level reported when a window carried no speech.
const SILENT_LEVEL: u8 = 127;

#[derive(Default)]
struct Window {
    total_ms: u32,
    loud_ms: u32,
    loud_weighted: u64,
}

/// Smoothed per-stream speech detector. A window is noisy when samples
/// louder than `active_level` cover at least `min_percentile` percent of
/// it; the reported level is the duration-weighted average of those
/// samples.
pub struct AudioLevel {
    active_level: u8,
    min_duration_ms: u32,
    window: Mutex<Window>,
    last: Mutex<(u8, bool)>,
}

impl AudioLevel {
    pub fn new(active_level: u8, min_percentile: u8) -> Self {
        Self {
            active_level,
            min_duration_ms: WINDOW_MS * u32::from(min_percentile) / 100,
            window: Mutex::new(Window::default()),
            last: Mutex::new((SILENT_LEVEL, false)),
        }
    }

    /// Records one reading covering `duration_ms` of audio (20 ms per
    /// packet at the usual ptime).
    pub fn observe(&self, level: u8, duration_ms: u32) {
        let mut window = self.window.lock().unwrap();
        window.total_ms += duration_ms;
        if level <= self.active_level {
            window.loud_ms += duration_ms;
            window.loud_weighted += u64::from(level) * u64::from(duration_ms);
        }
        if window.total_ms >= WINDOW_MS {
            let result = if window.loud_ms > 0 {
                (
                    (window.loud_weighted / u64::from(window.loud_ms)) as u8,
                    window.loud_ms >= self.min_duration_ms,
                )
            } else {
                (SILENT_LEVEL, false)
            };
            *self.last.lock().unwrap() = result;
            *window = Window::default();
        }
    }

    /// The smoothed level and noise flag of the last completed window.
    pub fn get_level(&self) -> (u8, bool) {
        *self.last.lock().unwrap()
    }

    /// Like [`AudioLevel::get_level`] but consumes the window result, so
    /// a stream that goes silent stops reporting as noisy.
    fn take_level(&self) -> (u8, bool) {
        std::mem::replace(&mut self.last.lock().unwrap(), (SILENT_LEVEL, false))
    }
}

pub struct AudioObserver {
    threshold: u8,
    filter_percent: u8,
    streams: Mutex<HashMap<String, AudioLevel>>,
    previous: Mutex<Vec<String>>,
}

impl AudioObserver {
    pub fn new(threshold: u8, filter_percent: u32) -> Self {
        Self {
            threshold,
            filter_percent: filter_percent.min(100) as u8,
            streams: Mutex::new(HashMap::new()),
            previous: Mutex::new(Vec::new()),
        }
    }

    pub fn add_stream(&self, stream_id: &str) {
        self.streams
            .lock()
            .unwrap()
            .entry(stream_id.to_owned())
            .or_insert_with(|| AudioLevel::new(self.threshold, self.filter_percent));
    }

    pub fn remove_stream(&self, stream_id: &str) {
        self.streams.lock().unwrap().remove(stream_id);
    }

    /// Records one dBov reading for a stream, assuming one packet per
    /// 20 ms.
    pub fn observe(&self, stream_id: &str, dbov: u8) {
        let streams = self.streams.lock().unwrap();
        if let Some(level) = streams.get(stream_id) {
            level.observe(dbov, 20);
        }
    }

    /// Closes the current interval. Returns the active stream ids sorted
    /// loudest first, or `None` when the set is unchanged since the last
    /// call.
    pub fn calc(&self) -> Option<Vec<String>> {
        let mut scored: Vec<(String, u8)> = Vec::new();
        {
            let streams = self.streams.lock().unwrap();
            for (id, level) in streams.iter() {
                let (value, noisy) = level.take_level();
                if noisy {
                    scored.push((id.clone(), value));
                }
            }
        }
        scored.sort_by_key(|(_, level)| *level);
        let active: Vec<String> = scored.into_iter().map(|(id, _)| id).collect();

        let mut previous = self.previous.lock().unwrap();
        if *previous == active {
            return None;
        }
        *previous = active.clone();
        Some(active)
    }
}

#[cfg(test)]
mod audio_level_tests {
    use super::*;

    const ACTIVE_LEVEL: u8 = 30;
    // Requires two noisy samples per window to count.
    const PERCENTILE: u8 = 10;
    const SAMPLES_PER_WINDOW: u32 = WINDOW_MS / 20;

    fn observe_samples(a: &AudioLevel, level: u8, count: u32) {
        for _ in 0..count {
            a.observe(level, 20);
        }
    }

    #[test]
    fn initially_not_noisy_within_a_few_samples() {
        let a = AudioLevel::new(ACTIVE_LEVEL, PERCENTILE);
        assert!(!a.get_level().1);

        observe_samples(&a, 28, 5);
        assert!(!a.get_level().1);
    }

    #[test]
    fn not_noisy_when_all_samples_below_threshold() {
        let a = AudioLevel::new(ACTIVE_LEVEL, PERCENTILE);
        observe_samples(&a, 35, 100);
        assert!(!a.get_level().1);
    }

    #[test]
    fn not_noisy_below_percentile() {
        let a = AudioLevel::new(ACTIVE_LEVEL, PERCENTILE);
        observe_samples(&a, 35, SAMPLES_PER_WINDOW - 2);
        observe_samples(&a, 25, 1);
        observe_samples(&a, 35, 1);
        assert!(!a.get_level().1);
    }

    #[test]
    fn noisy_above_percentile_with_weighted_level() {
        let a = AudioLevel::new(ACTIVE_LEVEL, PERCENTILE);
        observe_samples(&a, 35, SAMPLES_PER_WINDOW - 16);
        observe_samples(&a, 25, 8);
        observe_samples(&a, 29, 8);

        let (level, noisy) = a.get_level();
        assert!(noisy);
        assert!(level < ACTIVE_LEVEL);
        assert!(level > 25);
    }
}

#[cfg(test)]
mod observer_tests {
    use super::*;

    fn observer() -> AudioObserver {
        AudioObserver::new(40, 20)
    }

    fn observe_n(obs: &AudioObserver, id: &str, level: u8, n: u64) {
        for _ in 0..n {
            obs.observe(id, level);
        }
    }

    #[test]
    fn silent_interval_reports_nothing() {
        let obs = observer();
        obs.add_stream("a");
        assert_eq!(obs.calc(), None);
        assert_eq!(obs.calc(), None);
    }

    #[test]
    fn quiet_samples_do_not_count() {
        let obs = observer();
        obs.add_stream("a");
        observe_n(&obs, "a", 90, 200);
        assert_eq!(obs.calc(), None);
    }

    #[test]
    fn sustained_loud_stream_becomes_active() {
        let obs = observer();
        obs.add_stream("a");
        observe_n(&obs, "a", 20, 150);
        assert_eq!(obs.calc(), Some(vec!["a".to_owned()]));
    }

    #[test]
    fn active_streams_sorted_loudest_first() {
        let obs = observer();
        obs.add_stream("quiet");
        obs.add_stream("loud");
        observe_n(&obs, "quiet", 35, 150);
        observe_n(&obs, "loud", 5, 150);
        assert_eq!(
            obs.calc(),
            Some(vec!["loud".to_owned(), "quiet".to_owned()])
        );
    }

    #[test]
    fn unchanged_set_is_suppressed_until_it_changes() {
        let obs = observer();
        obs.add_stream("a");
        observe_n(&obs, "a", 20, 150);
        assert!(obs.calc().is_some());
        observe_n(&obs, "a", 20, 150);
        assert_eq!(obs.calc(), None);
        // Stream went quiet: the set changes back to empty.
        assert_eq!(obs.calc(), Some(vec![]));
    }

    #[test]
    fn removed_stream_stops_reporting() {
        let obs = observer();
        obs.add_stream("a");
        observe_n(&obs, "a", 20, 150);
        assert_eq!(obs.calc(), Some(vec!["a".to_owned()]));
        obs.remove_stream("a");
        assert_eq!(obs.calc(), Some(vec![]));
    }
}
