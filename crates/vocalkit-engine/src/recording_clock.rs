use std::{
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{Context, Result};
use vocalkit_core::{Event, EventBus, EventKind};

/// Splits elapsed seconds into hours, minutes and seconds.
pub fn split_hms(total_secs: u64) -> (u64, u64, u64) {
    (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60)
}

/// Publishes elapsed recording time as timer events, one second per tick.
/// Minute and hour events are only sent when those fields change.
pub struct RecordingClock {
    stop: Option<mpsc::Sender<()>>,
    join: Option<JoinHandle<u64>>,
}

impl RecordingClock {
    pub fn start(bus: Arc<EventBus>, tick: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name("recording_clock".to_string())
            .spawn(move || {
                let mut elapsed = 0u64;
                while let Err(mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(tick) {
                    let (h0, m0, _) = split_hms(elapsed);
                    elapsed += 1;
                    let (h, m, s) = split_hms(elapsed);
                    if h != h0 {
                        bus.publish(Event::timer(EventKind::TimerHour, h));
                    }
                    if m != m0 {
                        bus.publish(Event::timer(EventKind::TimerMinute, m));
                    }
                    bus.publish(Event::timer(EventKind::TimerSecond, s));
                }
                elapsed
            })
            .context("E_INTERNAL: failed to spawn recording clock thread")?;
        Ok(Self {
            stop: Some(stop),
            join: Some(join),
        })
    }

    /// Stops ticking and returns the elapsed seconds.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        drop(self.stop.take());
        self.join
            .take()
            .and_then(|j| j.join().ok())
            .unwrap_or(0)
    }
}

impl Drop for RecordingClock {
    fn drop(&mut self) {
        self.shutdown();
    }
}
