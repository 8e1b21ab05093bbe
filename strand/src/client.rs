use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ClientBuilder, Config};
use crate::connection::{Connection, ErrorSink};
use crate::error::{Error, Result};
use crate::metrics;
use crate::registry::InFlight;
use crate::request::{CallOptions, Request};
use crate::response::Response;
use crate::stream::{Completion, Stream};

/// HTTP/2 client multiplexing every call over one connection.
///
/// The connection is opened lazily by the first call and re-opened by the
/// first call after it dies, so a dropped socket never breaks the client
/// for good. Calls may be issued from any number of threads.
///
/// ```rust,no_run
/// use strand::{CallOptions, Client};
///
/// let client = Client::new("https://example.com")?;
/// if let Some(response) = client.get("/", CallOptions::new())? {
///     println!("{} {}", response.status().unwrap_or("?"), response.text());
/// }
///
/// client.get_async("/slow", CallOptions::new(), |response| {
///     println!("done: {:?}", response.map(|r| r.is_ok()));
/// })?;
/// client.join(None)?;
/// # Ok::<(), strand::Error>(())
/// ```
pub struct Client {
    config: Config,
    uri: Url,
    connection: Mutex<Option<Connection>>,
    /// Replaced connections still finishing their streams after GOAWAY.
    draining: Mutex<Vec<Connection>>,
    in_flight: Arc<InFlight>,
    errors: Arc<ErrorSink>,
    generation: AtomicU64,
}

impl Client {
    /// A client for `uri` (`http://` or `https://`) with default settings.
    /// Nothing is connected until the first call.
    pub fn new(uri: &str) -> Result<Self> {
        Self::with_config(uri, Config::default())
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn with_config(uri: &str, config: Config) -> Result<Self> {
        config.validate()?;
        let uri = Url::parse(uri)?;
        match uri.scheme() {
            "http" | "https" => {}
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        }
        if uri.host_str().is_none_or(str::is_empty) {
            return Err(Error::InvalidUri(format!("{uri}: no host")));
        }
        Ok(Self {
            config,
            uri,
            connection: Mutex::new(None),
            draining: Mutex::new(Vec::new()),
            in_flight: Arc::new(InFlight::new()),
            errors: Arc::new(ErrorSink::default()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn is_tls(&self) -> bool {
        self.uri.scheme() == "https"
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A connection is up and its I/O thread running.
    pub fn is_open(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(Connection::is_alive)
    }

    /// Async requests whose callback has not run yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Route connection failures to `handler` instead of the blocked
    /// callers. It runs on the I/O thread; callers blocked on the failed
    /// connection then get [`Error::Disconnected`].
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.errors.set_handler(Arc::new(handler));
    }

    /// Build the request `call` would send, for inspection or reuse.
    pub fn prepare_request(&self, method: &str, path: &str, options: CallOptions) -> Request {
        let mut request = Request::new(method, &self.uri, path);
        request.set_timeout(self.config.request_timeout);
        options.apply(&mut request);
        request
    }

    /// Send a request and block until its response arrives.
    ///
    /// `Ok(None)` means the request timeout elapsed first. That is not an
    /// error and nothing is cancelled: a late response is discarded.
    pub fn call(
        &self,
        method: &str,
        path: &str,
        options: CallOptions,
    ) -> Result<Option<Response>> {
        self.send(self.prepare_request(method, path, options))
    }

    /// [`call`](Self::call) with a prepared request.
    pub fn send(&self, mut request: Request) -> Result<Option<Response>> {
        let timeout = request.timeout();
        let (connection, stream) = self.start(&mut request, None)?;
        let result = stream.wait(timeout);
        if let Ok(None) = result {
            debug!(
                stream_id = stream.id(),
                ?timeout,
                "gave up waiting for response"
            );
            stream.expire();
            connection.forget(stream.id());
            // The response may have landed between the wait and the expiry.
            return stream.wait(Duration::ZERO);
        }
        result
    }

    /// Send a request and return at once. `on_complete` runs on the I/O
    /// thread with the response, or `None` when the request timed out, was
    /// reset, or its connection died. It must not block.
    pub fn call_async<F>(
        &self,
        method: &str,
        path: &str,
        options: CallOptions,
        on_complete: F,
    ) -> Result<()>
    where
        F: FnOnce(Option<Response>) + Send + 'static,
    {
        self.send_async(self.prepare_request(method, path, options), on_complete)
    }

    /// [`call_async`](Self::call_async) with a prepared request.
    pub fn send_async<F>(&self, mut request: Request, on_complete: F) -> Result<()>
    where
        F: FnOnce(Option<Response>) + Send + 'static,
    {
        self.start(&mut request, Some(Box::new(on_complete)))?;
        Ok(())
    }

    pub fn get(&self, path: &str, options: CallOptions) -> Result<Option<Response>> {
        self.call("GET", path, options)
    }

    pub fn post(&self, path: &str, options: CallOptions) -> Result<Option<Response>> {
        self.call("POST", path, options)
    }

    pub fn put(&self, path: &str, options: CallOptions) -> Result<Option<Response>> {
        self.call("PUT", path, options)
    }

    pub fn delete(&self, path: &str, options: CallOptions) -> Result<Option<Response>> {
        self.call("DELETE", path, options)
    }

    pub fn get_async<F>(&self, path: &str, options: CallOptions, on_complete: F) -> Result<()>
    where
        F: FnOnce(Option<Response>) + Send + 'static,
    {
        self.call_async("GET", path, options, on_complete)
    }

    pub fn post_async<F>(&self, path: &str, options: CallOptions, on_complete: F) -> Result<()>
    where
        F: FnOnce(Option<Response>) + Send + 'static,
    {
        self.call_async("POST", path, options, on_complete)
    }

    pub fn put_async<F>(&self, path: &str, options: CallOptions, on_complete: F) -> Result<()>
    where
        F: FnOnce(Option<Response>) + Send + 'static,
    {
        self.call_async("PUT", path, options, on_complete)
    }

    pub fn delete_async<F>(&self, path: &str, options: CallOptions, on_complete: F) -> Result<()>
    where
        F: FnOnce(Option<Response>) + Send + 'static,
    {
        self.call_async("DELETE", path, options, on_complete)
    }

    /// Wait for every async request to finish, or until `timeout`.
    ///
    /// On timeout returns [`Error::JoinTimeout`]; the outstanding requests
    /// keep running and their callbacks still fire later. A connection
    /// failure nobody else was told about is returned first.
    pub fn join(&self, timeout: Option<Duration>) -> Result<()> {
        if let Some(err) = self.errors.take() {
            return Err(err);
        }
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        self.in_flight
            .wait_empty(deadline)
            .map_err(Error::JoinTimeout)?;
        match self.errors.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Tear the connection down now. In-flight requests are discarded
    /// without running their callbacks; blocked callers get
    /// [`Error::Closed`]. The next call connects again.
    pub fn close(&self) {
        // Shut down outside the lock: a callback on the I/O thread may be
        // waiting for it.
        let connection = self.connection.lock().take();
        let draining = std::mem::take(&mut *self.draining.lock());
        for connection in connection.into_iter().chain(draining) {
            debug!(generation = connection.generation(), "closing connection");
            connection.shutdown();
        }
    }

    /// The live connection, opening one when there is none.
    fn ensure_open(&self) -> Result<Connection> {
        let mut current = self.connection.lock();
        if let Some(connection) = current.as_ref()
            && connection.is_alive()
        {
            return Ok(connection.clone());
        }
        // A dead connection's thread is finishing its teardown; let it. One
        // that is going away keeps serving its open streams until they end.
        if let Some(old) = current.take()
            && old.is_running()
        {
            let mut draining = self.draining.lock();
            draining.retain(Connection::is_running);
            draining.push(old);
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let connection = Connection::open(
            &self.uri,
            &self.config,
            generation,
            self.in_flight.clone(),
            self.errors.clone(),
        )
        .inspect_err(|e| {
            metrics::CONNECTIONS_FAILED.increment();
            warn!(uri = %self.uri, error = %e, "connect failed");
        })?;
        *current = Some(connection.clone());
        Ok(connection)
    }

    /// Send on the live connection, retrying once on a fresh one when the
    /// current connection died or started going away before the request
    /// left.
    fn start(
        &self,
        request: &mut Request,
        on_complete: Option<Completion>,
    ) -> Result<(Connection, Arc<Stream>)> {
        let mut on_complete = on_complete;
        let connection = self.ensure_open()?;
        match connection.start(request, &mut on_complete) {
            Ok(stream) => Ok((connection, stream)),
            Err(Error::Disconnected) => {
                debug!("connection unusable before send, reconnecting");
                let connection = self.ensure_open()?;
                let stream = connection.start(request, &mut on_complete)?;
                Ok((connection, stream))
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("uri", &self.uri.as_str())
            .field("open", &self.is_open())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_scheme() {
        assert!(matches!(
            Client::new("ftp://example.com"),
            Err(Error::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(Client::new("not a url"), Err(Error::InvalidUri(_))));
    }

    #[test]
    fn nothing_connects_until_first_call() {
        let client = Client::new("https://example.com:8443").unwrap();
        assert!(client.is_tls());
        assert!(!client.is_open());
        assert_eq!(client.in_flight(), 0);
        assert_eq!(client.uri().port(), Some(8443));
    }

    #[test]
    fn prepare_request_uses_client_defaults() {
        let client = Client::builder()
            .request_timeout(Duration::from_secs(3))
            .build("http://localhost:9000")
            .unwrap();
        let request = client.prepare_request("get", "/x", CallOptions::new().param("a", 1));
        assert_eq!(request.method(), "GET");
        assert_eq!(request.timeout(), Duration::from_secs(3));
        assert_eq!(request.headers()[":authority"], "localhost:9000");
        assert_eq!(request.full_path(), "/x?a=1");
    }

    #[test]
    fn join_with_nothing_in_flight_returns_immediately() {
        let client = Client::new("http://localhost:9").unwrap();
        assert!(client.join(Some(Duration::ZERO)).is_ok());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = Client::builder()
            .read_buffer_size(0)
            .build("http://localhost")
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
