#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    };
    use std::thread;
    use std::time::Duration;

    use crate::qsbr::Qsbr;

    #[test]
    fn test_wait_blocks_until_all_readers_advance() {
        let qsbr = Qsbr::new();
        let released = Arc::new(AtomicBool::new(false));

        let mut readers = Vec::new();
        for _ in 0..4 {
            let qsbr = qsbr.clone();
            let released = Arc::clone(&released);
            readers.push(thread::spawn(move || {
                let handle = qsbr.register().unwrap();
                handle.update(1);
                // Hold at version 1 long enough for the writer to start
                // waiting, then advance.
                thread::sleep(Duration::from_millis(50));
                handle.update(2);
                // Keep the registration alive until the writer finishes.
                while !released.load(Ordering::Acquire) {
                    thread::yield_now();
                }
            }));
        }

        // Give readers time to register and announce version 1.
        thread::sleep(Duration::from_millis(20));
        qsbr.wait(2);
        released.store(true, Ordering::Release);

        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[test]
    fn test_wait_observes_late_registrations_conservatively() {
        // A reader that registers during the wait starts at version 0 and
        // must either advance or unregister before wait(1) returns.
        let qsbr = Qsbr::new();
        let waited = Arc::new(AtomicU64::new(0));

        let late = {
            let qsbr = qsbr.clone();
            thread::spawn(move || {
                let handle = qsbr.register().unwrap();
                thread::sleep(Duration::from_millis(30));
                handle.update(1);
                thread::sleep(Duration::from_millis(30));
            })
        };

        thread::sleep(Duration::from_millis(10));
        qsbr.wait(1);
        waited.store(1, Ordering::Release);
        late.join().unwrap();
    }

    #[test]
    fn test_many_registrations_across_shards() {
        let qsbr = Qsbr::new();
        let handles: Vec<_> = (0..512).map(|_| qsbr.register().unwrap()).collect();

        for handle in &handles {
            handle.update(9);
        }
        qsbr.wait(9);

        drop(handles);
        qsbr.wait(10);
    }

    #[test]
    fn test_park_resume_cycles_under_waits() {
        let qsbr = Qsbr::new();
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let qsbr = qsbr.clone();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let handle = qsbr.register().unwrap();
                let mut version = 0u64;
                while !stop.load(Ordering::Acquire) {
                    version += 1;
                    handle.update(version);
                    handle.park();
                    handle.resume();
                }
                handle.park();
            })
        };

        for target in 1..=20u64 {
            qsbr.wait(target);
        }
        stop.store(true, Ordering::Release);
        reader.join().unwrap();
    }
}
