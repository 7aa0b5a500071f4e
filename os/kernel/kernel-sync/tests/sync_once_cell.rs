use kernel_sync::SyncOnceCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[test]
fn set_only_succeeds_once() {
    let cell = SyncOnceCell::new();
    assert!(cell.get().is_none());
    assert_eq!(cell.set(1_u32).copied(), Ok(1));
    assert_eq!(cell.set(2), Err(2));
    assert_eq!(cell.get(), Some(&1));
}

#[test]
fn get_or_init_runs_initializer_once_across_threads() {
    let cell = Arc::new(SyncOnceCell::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cell = Arc::clone(&cell);
            let calls = Arc::clone(&calls);
            thread::spawn(move || {
                *cell.get_or_init(|| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    i
                })
            })
        })
        .collect();

    let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|v| *v == values[0]));
}

#[test]
fn value_is_dropped_with_cell() {
    let marker = Arc::new(());
    {
        let cell = SyncOnceCell::new();
        cell.set(Arc::clone(&marker)).unwrap();
        assert_eq!(Arc::strong_count(&marker), 2);
    }
    assert_eq!(Arc::strong_count(&marker), 1);
}
