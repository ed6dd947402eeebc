use super::*;

#[test]
fn cursor_round_trips_timestamp_and_id() {
    let cursor = encode_cursor(1_700_000_000_123, "m-42");
    assert_eq!(cursor, "1700000000123:m-42");
    assert_eq!(decode_cursor(&cursor), Ok((1_700_000_000_123, "m-42".to_owned())));
}

#[test]
fn cursor_id_may_contain_colons() {
    assert_eq!(decode_cursor("5:a:b"), Ok((5, "a:b".to_owned())));
}

#[test]
fn decode_cursor_rejects_garbage() {
    assert!(decode_cursor("no-separator").is_err());
    assert!(decode_cursor("soon:m1").is_err());
    assert!(decode_cursor("5:").is_err());
}

#[test]
fn feed_handle_cancels_once_on_drop() {
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handle = FeedHandle::new(move || {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    handle.unsubscribe();
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}
