use crossbeam_channel::{unbounded, Receiver, Sender};
use std::time::Duration;
use timer::{Guard, Timer as WallClockTimer};

/// Delivers a `()` on its channel once per `timeout` after the last renewal,
/// so the event loop can select over heartbeat ticks and inbound messages
/// uniformly. Renewing cancels the in-flight tick and drains any stale one.
pub struct Timer {
    timeout: Duration,
    timer: WallClockTimer,
    guard: Option<Guard>,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Timer {
    pub fn new(timeout: Duration) -> Timer {
        let (tx, rx) = unbounded();
        let mut timer = Timer {
            timeout,
            timer: WallClockTimer::new(),
            guard: None,
            tx,
            rx,
        };
        timer.renew();
        timer
    }

    pub fn renew(&mut self) {
        self.guard = None;
        for _ in self.rx.try_iter() {}
        let tx = self.tx.clone();
        self.guard = Some(self.timer.schedule_with_delay(
            time::Duration::milliseconds(self.timeout.as_millis() as i64),
            move || {
                let _ = tx.send(());
            },
        ));
    }

    pub fn get_rx(&self) -> &Receiver<()> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_timeout() {
        let timer = Timer::new(Duration::from_millis(5));
        assert!(timer
            .get_rx()
            .recv_timeout(Duration::from_millis(500))
            .is_ok());
    }

    #[test]
    fn renew_drains_stale_tick() {
        let mut timer = Timer::new(Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(50));
        timer.renew();
        // The pre-renewal tick must not be observable.
        assert!(timer.get_rx().try_recv().is_err());
    }
}
