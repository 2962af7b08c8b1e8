use parking_lot::{Condvar, Mutex};

/// Dynamic-party completion barrier for one tick.
///
/// The pool registers one party per worker before the tick signal goes
/// out; a worker that blocks servicing a foreign element registers an
/// extra party for the duration of the critical section. `wait` returns
/// once every registered party has arrived and deregistered.
pub(crate) struct Phaser {
    parties: Mutex<usize>,
    c: Condvar,
}

impl Phaser {
    pub(crate) fn new() -> Phaser {
        Phaser {
            parties: Mutex::new(0),
            c: Condvar::new(),
        }
    }

    pub(crate) fn register(&self) {
        *self.parties.lock() += 1;
    }

    pub(crate) fn bulk_register(&self, n: usize) {
        *self.parties.lock() += n;
    }

    pub(crate) fn arrive_and_deregister(&self) {
        let mut parties = self.parties.lock();
        debug_assert!(*parties > 0, "phaser arrival without registration");
        *parties = parties.saturating_sub(1);
        if *parties == 0 {
            // Notify while holding the lock: a concurrent register() between
            // the decrement and the notify would otherwise let wait() miss
            // the wakeup for the party that re-raised the count.
            self.c.notify_all();
        }
    }

    /// Blocks until the party count reaches zero. Callers must have
    /// finished registering before waiting, or the count can hit zero
    /// early.
    pub(crate) fn wait(&self) {
        let mut parties = self.parties.lock();
        while *parties > 0 {
            self.c.wait(&mut parties);
        }
    }

    #[cfg(test)]
    pub(crate) fn registered_parties(&self) -> usize {
        *self.parties.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn phaser_releases_after_all_arrivals() {
        let phaser = Arc::new(Phaser::new());
        phaser.bulk_register(3);

        let mut threads = vec![];
        for i in 0..3 {
            let phaser = phaser.clone();
            threads.push(std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10 * i));
                phaser.arrive_and_deregister();
            }));
        }
        phaser.wait();
        assert_eq!(phaser.registered_parties(), 0);
        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn late_registration_extends_the_wait() {
        let phaser = Arc::new(Phaser::new());
        phaser.bulk_register(1);
        // An extra party registered before the first arrival keeps the
        // barrier closed until it also arrives.
        phaser.register();
        phaser.arrive_and_deregister();
        assert_eq!(phaser.registered_parties(), 1);
        phaser.arrive_and_deregister();
        phaser.wait();
    }

    #[test]
    fn wait_with_no_parties_returns_immediately() {
        Phaser::new().wait();
    }
}
