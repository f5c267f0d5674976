use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use crate::Feed;

#[test]
fn test_subscribers_see_same_order() {
    let feed: Feed<u64> = Feed::new("test");
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));

    let log = first.clone();
    feed.subscribe(move |v| log.lock().push(*v));
    let log = second.clone();
    feed.subscribe(move |v| log.lock().push(*v));

    for v in 1..=5 {
        feed.notify(&v);
    }

    assert_eq!(*first.lock(), vec![1, 2, 3, 4, 5]);
    assert_eq!(*first.lock(), *second.lock());
}

#[test]
fn test_ids_are_unique_and_unsubscribe_works() {
    let feed: Feed<u64> = Feed::new("test");
    let hits = Arc::new(Mutex::new(0u64));

    let counter = hits.clone();
    let a = feed.subscribe(move |_| *counter.lock() += 1);
    let b = feed.subscribe(|_| {});
    assert_ne!(a, b);
    assert_eq!(feed.len(), 2);

    feed.unsubscribe(a);
    feed.unsubscribe(a);
    feed.unsubscribe(999);
    feed.notify(&1);

    assert_eq!(*hits.lock(), 0);
    assert_eq!(feed.len(), 1);

    // Ids are not reused.
    let c = feed.subscribe(|_| {});
    assert!(c > b);
}

#[test]
fn test_panicking_subscriber_isolated() {
    let feed: Feed<u64> = Feed::new("test");
    let hits = Arc::new(Mutex::new(Vec::new()));

    feed.subscribe(|v| {
        if *v == 2 {
            panic!("subscriber failure");
        }
    });
    let log = hits.clone();
    feed.subscribe(move |v| log.lock().push(*v));

    feed.notify(&1);
    feed.notify(&2);
    feed.notify(&3);

    assert_eq!(*hits.lock(), vec![1, 2, 3]);
}

#[test]
fn test_subscriber_may_unsubscribe_itself() {
    let feed: Arc<Feed<u64>> = Arc::new(Feed::new("test"));
    let own_id = Arc::new(Mutex::new(None));

    let handle = feed.clone();
    let slot = own_id.clone();
    let id = feed.subscribe(move |_| {
        if let Some(id) = *slot.lock() {
            handle.unsubscribe(id);
        }
    });
    *own_id.lock() = Some(id);

    feed.notify(&1);
    assert!(feed.is_empty());
}
