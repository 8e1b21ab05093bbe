mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use strand::{CallOptions, Client, Event, EventKind};
use support::{DummyServer, Reply, SeenRequest};

fn slow_first() -> support::Handler {
    Arc::new(|req: &SeenRequest| {
        let reply = Reply::ok(req.path().as_bytes().to_vec());
        if req.path() == "/slow" {
            reply.delayed(Duration::from_millis(800))
        } else {
            reply
        }
    })
}

#[test]
fn sync_call_gives_up_after_timeout() {
    let server = DummyServer::start(Arc::new(|_: &SeenRequest| {
        Reply::ok("zzz").delayed(Duration::from_secs(3))
    }));
    let client = Client::new(&server.url()).unwrap();

    let start = Instant::now();
    let response = client
        .get("/", CallOptions::new().timeout(Duration::from_millis(300)))
        .unwrap();
    let elapsed = start.elapsed();
    assert!(response.is_none());
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");

    // Sync calls are never waited on by join.
    let start = Instant::now();
    client.join(Some(Duration::from_secs(1))).unwrap();
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn client_wide_request_timeout() {
    let server = DummyServer::start(slow_first());
    let client = Client::builder()
        .request_timeout(Duration::from_millis(200))
        .build(&server.url())
        .unwrap();

    assert!(client.get("/slow", CallOptions::new()).unwrap().is_none());
    let response = client.get("/fast", CallOptions::new()).unwrap().unwrap();
    assert_eq!(response.text(), "/fast");
}

#[test]
fn late_response_is_discarded() {
    let server = DummyServer::start(slow_first());
    let client = Client::new(&server.url()).unwrap();

    let timed_out = client
        .get("/slow", CallOptions::new().timeout(Duration::from_millis(100)))
        .unwrap();
    assert!(timed_out.is_none());

    let response = client.get("/second", CallOptions::new()).unwrap().unwrap();
    assert_eq!(response.text(), "/second");

    // Let the slow reply land on the forgotten stream.
    std::thread::sleep(Duration::from_secs(1));
    let response = client.get("/third", CallOptions::new()).unwrap().unwrap();
    assert_eq!(response.text(), "/third");
    assert!(client.is_open());
    assert_eq!(server.connections(), 1);
}

#[test]
fn async_deadlines_fire_independently() {
    let server = DummyServer::start(slow_first());
    let client = Client::new(&server.url()).unwrap();

    let results = Arc::new(std::sync::Mutex::new(Vec::new()));
    for (path, timeout) in [("/slow", 150), ("/fast", 5_000)] {
        let results = results.clone();
        client
            .get_async(
                path,
                CallOptions::new().timeout(Duration::from_millis(timeout)),
                move |response| {
                    results
                        .lock()
                        .unwrap()
                        .push((path, response.map(|r| r.text().into_owned())));
                },
            )
            .unwrap();
    }
    client.join(Some(Duration::from_secs(5))).unwrap();

    let mut results = results.lock().unwrap().clone();
    results.sort();
    assert_eq!(
        results,
        vec![("/fast", Some("/fast".to_string())), ("/slow", None)]
    );
}

#[test]
fn sync_timeout_fires_close_once() {
    let server = DummyServer::start(slow_first());
    let client = Client::new(&server.url()).unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    let chunks = Arc::new(AtomicUsize::new(0));
    let (c, k) = (closes.clone(), chunks.clone());
    let options = CallOptions::new()
        .timeout(Duration::from_millis(100))
        .on(EventKind::Close, move |event| {
            if let Event::Close(None) = event {
                c.fetch_add(1, Ordering::SeqCst);
            }
        })
        .on(EventKind::BodyChunk, move |_| {
            k.fetch_add(1, Ordering::SeqCst);
        });

    assert!(client.get("/slow", options).unwrap().is_none());
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // The late response reaches no handler.
    std::thread::sleep(Duration::from_millis(1200));
    client.get("/ping", CallOptions::new()).unwrap().unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(chunks.load(Ordering::SeqCst), 0);
}
