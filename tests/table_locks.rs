// tests/table_locks.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use batchdag::warehouse::TableLocks;

fn hammer(locks: Arc<TableLocks>, tables: &[&'static str]) -> usize {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(tables.len()));

    let handles: Vec<_> = tables
        .iter()
        .map(|&table| {
            let (locks, active, peak, barrier) = (
                Arc::clone(&locks),
                Arc::clone(&active),
                Arc::clone(&peak),
                Arc::clone(&barrier),
            );
            thread::spawn(move || {
                barrier.wait();
                locks.with_table(table, || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(30));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    peak.load(Ordering::SeqCst)
}

#[test]
fn writers_to_one_table_never_overlap() {
    let locks = Arc::new(TableLocks::new());
    // Names differing only in case refer to the same table.
    let peak = hammer(locks, &["songplays", "SONGPLAYS", "Songplays", "songplays"]);
    assert_eq!(peak, 1);
}

#[test]
fn writers_to_different_tables_run_in_parallel() {
    let locks = Arc::new(TableLocks::new());
    let peak = hammer(locks, &["users", "songs", "artists"]);
    assert!(peak >= 2, "expected overlap, peak was {peak}");
}

#[test]
fn panicking_writer_does_not_poison_the_table() {
    let locks = Arc::new(TableLocks::new());

    let l = Arc::clone(&locks);
    let panicked = thread::spawn(move || {
        l.with_table("time", || -> u32 { panic!("operator blew up") });
    })
    .join();
    assert!(panicked.is_err());

    assert_eq!(locks.with_table("time", || 42), 42);
}
