//! End-to-end tests of the stream client against the mock transport.
//!
//! All tests run on a paused clock, so backoff delays are measured exactly
//! (modulo jitter and the timer's millisecond granularity) without wall-time
//! waits.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::Notify;
use tonic::{Code, Status};

use streamkeeper::{
    mock::{HandlerEvent, MockChunk, MockTransport, RecordingHandler},
    BackoffConfig, StreamClient, StreamClientConfig, StreamError,
};

/// Lets spawned tasks (drive loops, timer callbacks) run to quiescence
/// without advancing the paused clock.
async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

fn no_jitter_config(initial: Duration) -> StreamClientConfig {
    StreamClientConfig {
        name: "test-stream",
        backoff: BackoffConfig { initial_delay: initial, jitter: 0.0, ..BackoffConfig::default() },
    }
}

/// Timer granularity slack.
const SLACK: Duration = Duration::from_millis(2);

#[tokio::test(start_paused = true)]
async fn sends_path_and_request_on_start() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::with_request("/pkg.Watcher/Watch", b"watch-me".as_slice());
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    assert_eq!(call.sent_path().unwrap(), Bytes::from_static(b"/pkg.Watcher/Watch"));
    assert_eq!(call.sent_request().unwrap(), Bytes::from_static(b"watch-me"));
    assert!(call.has_pending_message());
    assert_eq!(handler.call_starts(), 1);

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn delivers_responses_in_order() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    call.deliver_headers();
    call.deliver_message(b"one".as_slice());
    settle().await;
    call.deliver_message(b"two".as_slice());
    settle().await;

    let responses: Vec<_> = handler
        .events()
        .into_iter()
        .filter_map(|e| match e {
            HandlerEvent::Response(payload) => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(responses, vec![b"one".to_vec(), b"two".to_vec()]);

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn assembles_chunked_message() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    call.deliver_body(
        11,
        vec![
            MockChunk::Data(Bytes::from_static(b"hello ")),
            MockChunk::Data(Bytes::from_static(b"wor")),
            MockChunk::Data(Bytes::from_static(b"ld")),
        ],
    );
    settle().await;

    assert!(handler.events().contains(&HandlerEvent::Response(b"hello world".to_vec())));

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn oversized_chunk_is_clipped_to_declared_length() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    call.deliver_body(4, vec![MockChunk::Data(Bytes::from_static(b"abcdef"))]);
    settle().await;

    assert!(handler.events().contains(&HandlerEvent::Response(b"abcd".to_vec())));

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn create_failure_retries_after_initial_backoff() {
    let transport = MockTransport::new();
    transport.fail_next_create(1);
    let handler = RecordingHandler::new();

    let start = tokio::time::Instant::now();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    // The failed creation arms the retry timer; the second attempt is the
    // first real call.
    let _call = transport.next_call().await;
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(800) && elapsed <= Duration::from_millis(1200) + SLACK,
        "elapsed {elapsed:?} outside 1s +/- 20%"
    );
    assert_eq!(transport.calls_created(), 1);
    assert_eq!(handler.call_starts(), 2);
    assert!(handler.events().contains(&HandlerEvent::RetryTimerStarted));

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn no_progress_failures_grow_backoff() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let mut call = transport.next_call().await;
    for expected_ms in [1000u64, 1600, 2560] {
        settle().await;
        let start = tokio::time::Instant::now();
        call.deliver_trailing(Status::unavailable("connection reset"));
        call.fire_teardown();
        call = transport.next_call().await;

        let elapsed = start.elapsed();
        let lo = Duration::from_millis(expected_ms * 8 / 10);
        let hi = Duration::from_millis(expected_ms * 12 / 10) + SLACK;
        assert!(
            elapsed >= lo && elapsed <= hi,
            "elapsed {elapsed:?} outside [{lo:?}, {hi:?}]"
        );
    }

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn progress_restarts_immediately_and_resets_backoff() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client =
        StreamClient::with_config(transport.transport(), handler.boxed(), no_jitter_config(Duration::from_secs(1)));

    // Two no-progress failures push the delay past the initial value.
    let mut call = transport.next_call().await;
    for _ in 0..2 {
        settle().await;
        call.deliver_trailing(Status::unavailable("connection reset"));
        call.fire_teardown();
        call = transport.next_call().await;
    }

    // This attempt makes progress before failing.
    call.deliver_message(b"tick".as_slice());
    settle().await;
    assert_eq!(handler.responses(), 1);

    let start = tokio::time::Instant::now();
    call.deliver_trailing(Status::unavailable("connection reset"));
    call.fire_teardown();
    call = transport.next_call().await;
    assert_eq!(start.elapsed(), Duration::ZERO, "restart after progress must be immediate");

    // And the backoff is back at the initial delay for the next failure.
    settle().await;
    let start = tokio::time::Instant::now();
    call.deliver_trailing(Status::unavailable("connection reset"));
    call.fire_teardown();
    let _call = transport.next_call().await;
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_secs(1) && elapsed <= Duration::from_secs(1) + SLACK,
        "elapsed {elapsed:?}, expected the initial delay again"
    );

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn graceful_end_counts_as_progress() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    call.deliver_message(b"only".as_slice());
    settle().await;
    call.end_messages();
    settle().await;
    call.deliver_trailing(Status::new(Code::Ok, ""));
    call.fire_teardown();

    // Even a clean end restarts the watch, immediately.
    let _next = transport.next_call().await;
    assert!(handler.events().contains(&HandlerEvent::CallEnded(Code::Ok)));
    assert_eq!(transport.calls_created(), 2);

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn unimplemented_stops_retries_for_good() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    settle().await;
    call.deliver_trailing(Status::unimplemented("unknown method"));
    call.fire_teardown();
    settle().await;

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.calls_created(), 1);
    assert!(handler.events().contains(&HandlerEvent::CallEnded(Code::Unimplemented)));
    // Dormant, not shut down.
    assert!(!client.is_shut_down());

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn rejected_response_cancels_then_restarts_immediately() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    handler.reject_next_responses(1);
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    call.deliver_message(b"garbage".as_slice());
    settle().await;

    assert_eq!(call.cancel_count(), 1);
    assert_eq!(handler.responses(), 0);

    // The mock fires a Cancelled trailing status on its own; a rejected
    // message still counts as progress, so the restart is immediate.
    let _next = transport.next_call().await;
    assert!(handler.events().contains(&HandlerEvent::CallEnded(Code::Cancelled)));
    assert_eq!(transport.calls_created(), 2);

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn read_failure_cancels_the_attempt() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    call.deliver_body(
        8,
        vec![
            MockChunk::Data(Bytes::from_static(b"half")),
            MockChunk::Fail(StreamError::Read { message: "stream reset".to_owned() }),
        ],
    );
    settle().await;

    assert_eq!(call.cancel_count(), 1);
    assert_eq!(handler.responses(), 0);

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_exactly_once() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    client.shutdown();
    settle().await;
    assert_eq!(call.cancel_count(), 1);

    client.shutdown();
    settle().await;
    assert_eq!(call.cancel_count(), 1);

    // The trailing status after shutdown reaches nobody and restarts nothing.
    call.fire_teardown();
    settle().await;
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.calls_created(), 1);
    assert!(!handler.events().contains(&HandlerEvent::CallEnded(Code::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_retry_timer() {
    let transport = MockTransport::new();
    transport.fail_next_create(1);
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    // Timer armed by the failed creation; shut down before it fires.
    settle().await;
    client.shutdown();
    settle().await;

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(transport.calls_created(), 0);
}

#[tokio::test(start_paused = true)]
async fn no_delivery_after_shutdown_mid_read() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    let gate = Arc::new(Notify::new());
    call.deliver_body(
        8,
        vec![
            MockChunk::Data(Bytes::from_static(b"abcd")),
            MockChunk::Pause(Arc::clone(&gate)),
            MockChunk::Data(Bytes::from_static(b"efgh")),
        ],
    );
    settle().await;

    // The read is parked mid-message; shut down, then let it finish.
    client.shutdown();
    settle().await;
    gate.notify_one();
    settle().await;

    assert_eq!(handler.responses(), 0);
    assert_eq!(transport.calls_created(), 1);
}

#[tokio::test(start_paused = true)]
async fn attempt_survives_until_teardown() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    settle().await;
    call.deliver_trailing(Status::unavailable("connection reset"));
    settle().await;

    // Terminal status reported, but the transport has not torn the call
    // down yet; the attempt still holds its reference.
    assert!(handler.events().contains(&HandlerEvent::CallEnded(Code::Unavailable)));
    let before = Arc::strong_count(&call);

    call.fire_teardown();
    settle().await;
    assert!(
        Arc::strong_count(&call) < before,
        "attempt must release the call after teardown"
    );

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn teardown_before_trailing_status_also_completes() {
    let transport = MockTransport::new();
    let handler = RecordingHandler::new();
    let client = StreamClient::new(transport.transport(), handler.boxed());

    let call = transport.next_call().await;
    settle().await;

    // Teardown notification arrives first, terminal status second.
    call.fire_teardown();
    settle().await;
    call.deliver_trailing(Status::unavailable("connection reset"));

    // The retry still happens after the backoff delay.
    let start = tokio::time::Instant::now();
    let _next = transport.next_call().await;
    assert!(start.elapsed() >= Duration::from_millis(800));
    assert!(handler.events().contains(&HandlerEvent::CallEnded(Code::Unavailable)));

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn custom_backoff_config_is_honored() {
    let transport = MockTransport::new();
    transport.fail_next_create(1);
    let handler = RecordingHandler::new();

    let start = tokio::time::Instant::now();
    let client = StreamClient::with_config(
        transport.transport(),
        handler.boxed(),
        no_jitter_config(Duration::from_secs(5)),
    );

    let _call = transport.next_call().await;
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_secs(5) && elapsed <= Duration::from_secs(5) + SLACK,
        "elapsed {elapsed:?}, expected the configured 5s delay"
    );

    client.shutdown();
}
