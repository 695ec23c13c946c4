/// Bounded execution of calls that may block
///
/// The call runs on a named worker thread and reports back over a bounded(1)
/// channel; the caller waits with `recv_timeout`. On expiry the caller gets
/// `RawSignal::TimedOut` and moves on. The worker is left to finish on its
/// own and its late result is dropped with the channel.
use crate::core::library::BlockingCall;
use crate::core::types::RawSignal;
use crossbeam_channel::RecvTimeoutError;
use log::{debug, warn};
use std::thread;
use std::time::Duration;

pub struct Watchdog {
    name: String,
}

impl Watchdog {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Run `call` with a deadline.
    pub fn run(&self, call: BlockingCall, timeout: Duration) -> RawSignal {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let spawned = thread::Builder::new()
            .name(format!("seqbox-watchdog-{}", self.name))
            .spawn(move || {
                let _ = tx.send(call());
            });
        if let Err(e) = spawned {
            warn!("failed to start watchdog worker for {}: {}", self.name, e);
            return RawSignal::Crashed {
                detail: format!("watchdog worker could not start: {}", e),
            };
        }

        match rx.recv_timeout(timeout) {
            Ok(signal) => signal,
            Err(RecvTimeoutError::Timeout) => {
                let after_ms = timeout.as_millis() as u64;
                warn!("{} did not return within {}ms", self.name, after_ms);
                RawSignal::TimedOut { after_ms }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("watchdog worker for {} exited without a result", self.name);
                RawSignal::Crashed {
                    detail: "worker exited without a result".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Value;
    use std::time::Instant;

    #[test]
    fn test_fast_call_returns_its_signal() {
        let watchdog = Watchdog::new("fast");
        let signal = watchdog.run(Box::new(|| RawSignal::Code(3)), Duration::from_secs(5));
        assert_eq!(signal, RawSignal::Code(3));
    }

    #[test]
    fn test_slow_call_times_out_promptly() {
        let watchdog = Watchdog::new("slow");
        let started = Instant::now();
        let signal = watchdog.run(
            Box::new(|| {
                thread::sleep(Duration::from_secs(2));
                RawSignal::Value(Value::Int(1))
            }),
            Duration::from_millis(50),
        );
        assert_eq!(signal, RawSignal::TimedOut { after_ms: 50 });
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_panicking_call_is_crashed() {
        let watchdog = Watchdog::new("panic");
        let signal = watchdog.run(Box::new(|| -> RawSignal { panic!("boom") }), Duration::from_secs(5));
        assert!(matches!(signal, RawSignal::Crashed { .. }));
    }
}
