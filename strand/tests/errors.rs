//! Connection failures and how they reach callers.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use strand::{CallOptions, Client, Error, ErrorCode};
use support::{DummyServer, Reply, SeenRequest};

/// Hangs up on `/drop`, echoes everything else.
fn drop_on_request() -> support::Handler {
    Arc::new(|req: &SeenRequest| match req.path() {
        "/drop" => Reply::Hangup,
        path => Reply::ok(path.as_bytes().to_vec()),
    })
}

fn is_connection_loss(err: &Error) -> bool {
    matches!(err, Error::ConnectionClosed | Error::Io(_))
}

#[test]
fn refused_connect_fails_the_call() {
    let client = Client::builder()
        .connect_timeout(Duration::from_secs(1))
        .build(&format!("http://127.0.0.1:{}", support::closed_port()))
        .unwrap();

    let err = client.get("/", CallOptions::new()).unwrap_err();
    assert!(matches!(err, Error::Connect { .. }), "{err:?}");
    assert!(!client.is_open());

    let err = client
        .get_async("/", CallOptions::new(), |_| panic!("never sent"))
        .unwrap_err();
    assert!(matches!(err, Error::Connect { .. }), "{err:?}");
    assert_eq!(client.in_flight(), 0);
}

#[test]
fn blocked_caller_gets_the_error_and_the_next_call_reconnects() {
    let server = DummyServer::start(drop_on_request());
    let client = Client::new(&server.url()).unwrap();

    let err = client.get("/drop", CallOptions::new()).unwrap_err();
    assert!(is_connection_loss(&err), "{err:?}");
    // The blocked caller took the error; join has nothing to report.
    client.join(Some(Duration::ZERO)).unwrap();

    let response = client.get("/ok", CallOptions::new()).unwrap().unwrap();
    assert_eq!(response.text(), "/ok");
    assert_eq!(server.connections(), 2);
}

#[test]
fn error_handler_takes_the_failure() {
    let server = DummyServer::start(drop_on_request());
    let client = Client::new(&server.url()).unwrap();

    let reported = Arc::new(Mutex::new(Vec::new()));
    let r = reported.clone();
    client.on_error(move |err| r.lock().unwrap().push(err.to_string()));

    let err = client.get("/drop", CallOptions::new()).unwrap_err();
    assert!(matches!(err, Error::Disconnected), "{err:?}");
    assert_eq!(reported.lock().unwrap().len(), 1);
    client.join(Some(Duration::ZERO)).unwrap();
}

#[test]
fn callbacks_get_none_and_join_reports_the_failure() {
    let server = DummyServer::start(drop_on_request());
    let client = Client::new(&server.url()).unwrap();

    let nones = Arc::new(AtomicUsize::new(0));
    let n = nones.clone();
    client
        .get_async("/drop", CallOptions::new(), move |response| {
            if response.is_none() {
                n.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    let err = client.join(Some(Duration::from_secs(5))).unwrap_err();
    assert!(is_connection_loss(&err), "{err:?}");
    assert_eq!(nones.load(Ordering::SeqCst), 1);
    assert_eq!(client.in_flight(), 0);

    // Reported once.
    client.join(Some(Duration::ZERO)).unwrap();
}

#[test]
fn stream_reset_fails_only_that_call() {
    let server = DummyServer::start(Arc::new(|req: &SeenRequest| match req.path() {
        "/cancel" => Reply::Reset(ErrorCode::Cancel),
        path => Reply::ok(path.as_bytes().to_vec()),
    }));
    let client = Client::new(&server.url()).unwrap();

    let err = client.get("/cancel", CallOptions::new()).unwrap_err();
    assert!(matches!(err, Error::Reset(ErrorCode::Cancel)), "{err:?}");

    let response = client.get("/fine", CallOptions::new()).unwrap().unwrap();
    assert_eq!(response.text(), "/fine");
    assert_eq!(server.connections(), 1);
}

#[test]
fn close_wakes_blocked_callers() {
    let server = DummyServer::start(Arc::new(|_: &SeenRequest| Reply::Ignore));
    let client = Arc::new(Client::new(&server.url()).unwrap());

    let caller = {
        let client = client.clone();
        thread::spawn(move || {
            client.get("/", CallOptions::new().timeout(Duration::from_secs(10)))
        })
    };
    assert!(support::eventually(|| server.seen().len() == 1));
    client.close();

    let result = caller.join().unwrap();
    assert!(matches!(result, Err(Error::Closed)), "{result:?}");
    assert!(!client.is_open());
}
