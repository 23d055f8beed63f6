//! Per-instance activity tracking

use dashmap::DashMap;
use idlesnap_common::InstanceId;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// An instance has seen no activity for longer than the idle threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleEvent {
    pub instance_id: InstanceId,
    pub idle_since: Instant,
    pub idle_duration: Duration,
}

#[derive(Debug)]
struct ActivityTrack {
    last_activity: Instant,
    window: VecDeque<Instant>,
    outstanding: bool,
    paused: bool,
}

impl ActivityTrack {
    fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            window: VecDeque::new(),
            outstanding: false,
            paused: false,
        }
    }

    fn prune(&mut self, now: Instant, rate_window: Duration) {
        while let Some(front) = self.window.front() {
            if now.saturating_duration_since(*front) > rate_window {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Emits idle events; deciding whether to checkpoint is left to the controller.
pub struct IdleMonitor {
    idle_threshold: Duration,
    rate_window: Duration,
    tracks: DashMap<InstanceId, ActivityTrack>,
}

impl IdleMonitor {
    pub fn new(idle_threshold: Duration, rate_window: Duration) -> Self {
        Self {
            idle_threshold,
            rate_window,
            tracks: DashMap::new(),
        }
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    /// Start tracking with the idle clock at `now`.
    pub fn track(&self, instance: &InstanceId, now: Instant) {
        self.tracks.insert(instance.clone(), ActivityTrack::new(now));
    }

    pub fn untrack(&self, instance: &InstanceId) {
        self.tracks.remove(instance);
    }

    pub fn record_activity(&self, instance: &InstanceId) {
        self.record_activity_at(instance, Instant::now());
    }

    /// A request completed: reset the idle clock and count it toward the rate.
    pub fn record_activity_at(&self, instance: &InstanceId, now: Instant) {
        let mut track = self
            .tracks
            .entry(instance.clone())
            .or_insert_with(|| ActivityTrack::new(now));
        track.last_activity = now;
        track.window.push_back(now);
        track.outstanding = false;
        track.paused = false;
        track.prune(now, self.rate_window);
    }

    /// Requests per second over the trailing rate window.
    pub fn request_rate(&self, instance: &InstanceId, now: Instant) -> f64 {
        let Some(mut track) = self.tracks.get_mut(instance) else {
            return 0.0;
        };
        track.prune(now, self.rate_window);
        track.window.len() as f64 / self.rate_window.as_secs_f64()
    }

    pub fn last_activity(&self, instance: &InstanceId) -> Option<Instant> {
        self.tracks.get(instance).map(|t| t.last_activity)
    }

    /// Idle events for every instance past the threshold with no event outstanding.
    pub fn poll(&self, now: Instant) -> Vec<IdleEvent> {
        let mut events = Vec::new();
        for mut entry in self.tracks.iter_mut() {
            let (instance_id, track) = entry.pair_mut();
            if track.paused || track.outstanding {
                continue;
            }
            let idle_duration = now.saturating_duration_since(track.last_activity);
            if idle_duration > self.idle_threshold {
                track.outstanding = true;
                events.push(IdleEvent {
                    instance_id: instance_id.clone(),
                    idle_since: track.last_activity,
                    idle_duration,
                });
            }
        }
        events
    }

    /// The outstanding event was handled; a still-idle instance may fire again.
    pub fn consume(&self, instance: &InstanceId) {
        if let Some(mut track) = self.tracks.get_mut(instance) {
            track.outstanding = false;
        }
    }

    /// Restart the idle clock without counting a request.
    pub fn rearm(&self, instance: &InstanceId) {
        self.rearm_at(instance, Instant::now());
    }

    pub fn rearm_at(&self, instance: &InstanceId, now: Instant) {
        if let Some(mut track) = self.tracks.get_mut(instance) {
            track.last_activity = now;
            track.outstanding = false;
            track.paused = false;
        }
    }

    /// Stop emitting events until the next activity or rearm.
    pub fn pause(&self, instance: &InstanceId) {
        if let Some(mut track) = self.tracks.get_mut(instance) {
            track.paused = true;
            track.outstanding = false;
        }
    }
}
