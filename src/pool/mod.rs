/**
 * Copyright (c) 2024-2025 ArcX, Inc.
 *
 * This file is part of ArcX Gateway
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 */

pub mod tracked;

use std::collections::{HashMap, VecDeque};
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::{Mutex, RwLock};
use scc::HashMap as SccHashMap;
use thiserror::Error;
use tracing::{debug, error, warn};
use uuid::Uuid;

use self::tracked::TrackedConnection;
use crate::resolver::Destination;

pub type PoolBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("could not resolve upstream address {0}:{1}")]
    Resolve(String, u16),
    #[error("dial failed after {0} attempts: {1}")]
    DialFailed(u32, std::io::Error),
    #[error("upstream handshake failed: {0}")]
    Handshake(hyper::Error),
    #[error("upstream request failed: {0}")]
    Request(hyper::Error),
}

/// Transport settings shared by every `UpstreamClient` in the pool (§4.6).
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    pub dial_timeout: Duration,
    pub max_connection_attempts: u32,
}

impl UpstreamSettings {
    pub fn new(max_idle_conns: usize, idle_conn_timeout: Duration, dial_timeout: Duration) -> Self {
        let max_idle_conns_per_host = if max_idle_conns <= 4 {
            max_idle_conns
        } else {
            max_idle_conns / 4
        };
        UpstreamSettings {
            max_idle_conns,
            max_idle_conns_per_host,
            idle_conn_timeout,
            dial_timeout,
            max_connection_attempts: 3,
        }
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        UpstreamSettings::new(8192, Duration::from_secs(90), Duration::from_secs(30))
    }
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    total_connections_opened: AtomicU64,
    current_open_connections: AtomicI64,
}

impl PoolCounters {
    pub fn total_connections_opened(&self) -> u64 {
        self.total_connections_opened.load(Ordering::Relaxed)
    }

    pub fn current_open_connections(&self) -> i64 {
        self.current_open_connections.load(Ordering::Relaxed)
    }
}

struct IdleConn {
    tracked: Arc<TrackedConnection>,
    send_request: SendRequest<PoolBody>,
}

/// Owns the HTTP transport for one `connection_key`: a dialer, a per-host
/// idle-connection cache, and the live set of tracked connections used for
/// forced reset on `Close` (§4.6, §3 "Upstream Client").
pub struct UpstreamClient {
    settings: UpstreamSettings,
    idle: SccHashMap<(String, u16), Mutex<VecDeque<IdleConn>>, RandomState>,
    tracked: SccHashMap<Uuid, Arc<TrackedConnection>, RandomState>,
    counters: Arc<PoolCounters>,
}

impl UpstreamClient {
    fn new(settings: UpstreamSettings, counters: Arc<PoolCounters>) -> Self {
        UpstreamClient {
            settings,
            idle: SccHashMap::with_hasher(RandomState::new()),
            tracked: SccHashMap::with_hasher(RandomState::new()),
            counters,
        }
    }

    /// Sends one request to `destination`, reusing an idle connection for
    /// its host when one is available, otherwise dialing a new one.
    pub async fn send(
        &self,
        destination: &Destination,
        req: Request<PoolBody>,
    ) -> Result<Response<Incoming>, PoolError> {
        let host_key = (destination.url_host.clone(), destination.url_port);

        let mut send_request = match self.take_idle(&host_key) {
            Some(conn) => conn,
            None => self.dial(&destination.url_host, destination.url_port).await?,
        };

        match send_request.send_request.send_request(req).await {
            Ok(response) => {
                if !send_request.send_request.is_closed() {
                    self.return_idle(host_key, send_request);
                } else {
                    self.drop_tracked(&send_request.tracked.id);
                }
                Ok(response)
            }
            Err(e) => {
                self.drop_tracked(&send_request.tracked.id);
                Err(PoolError::Request(e))
            }
        }
    }

    fn take_idle(&self, host_key: &(String, u16)) -> Option<IdleConn> {
        self.idle.read(host_key, |_, queue| {
            let mut queue = queue.lock();
            queue.pop_front()
        })?
    }

    fn return_idle(&self, host_key: (String, u16), conn: IdleConn) {
        let cap = self.settings.max_idle_conns_per_host;
        self.idle
            .entry(host_key.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        self.idle.read(&host_key, |_, queue| {
            let mut queue = queue.lock();
            if queue.len() < cap {
                queue.push_back(conn);
            } else {
                debug!("idle cap reached for host, letting connection close");
            }
        });
    }

    async fn dial(&self, host: &str, port: u16) -> Result<IdleConn, PoolError> {
        let addr = format!("{host}:{port}")
            .to_socket_addrs()
            .map_err(|_| PoolError::Resolve(host.to_string(), port))?
            .next()
            .ok_or_else(|| PoolError::Resolve(host.to_string(), port))?;

        let mut last_err = None;
        for attempt in 1..=self.settings.max_connection_attempts {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 - 1))).await;
            }
            match tokio::time::timeout(self.settings.dial_timeout, TrackedConnection::dial(addr)).await {
                Ok(Ok((stream, tracked))) => {
                    let tracked = Arc::new(tracked);
                    let io = TokioIo::new(stream);
                    let (send_request, conn) = hyper::client::conn::http1::handshake(io)
                        .await
                        .map_err(PoolError::Handshake)?;

                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            warn!(error = %e, "upstream connection task ended");
                        }
                    });

                    self.tracked.upsert(tracked.id, tracked.clone());
                    self.counters.total_connections_opened.fetch_add(1, Ordering::Relaxed);
                    self.counters.current_open_connections.fetch_add(1, Ordering::Relaxed);

                    return Ok(IdleConn {
                        tracked,
                        send_request,
                    });
                }
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => {
                    last_err = Some(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "dial deadline exceeded",
                    ))
                }
            }
        }
        Err(PoolError::DialFailed(
            self.settings.max_connection_attempts,
            last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "dial failed")),
        ))
    }

    fn drop_tracked(&self, id: &Uuid) {
        if self.tracked.remove(id).is_some() {
            self.counters.current_open_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Closes every idle connection and force-resets every live one (§4.6).
    fn close_all(&self) {
        self.idle.clear();
        let mut reset_count = 0i64;
        self.tracked.retain(|_, tracked| {
            if let Err(e) = tracked.reset() {
                error!(error = %e, "failed to force-reset tracked connection");
            }
            reset_count += 1;
            false
        });
        self.counters
            .current_open_connections
            .fetch_sub(reset_count, Ordering::Relaxed);
    }
}

/// Keyed map `connection_key -> UpstreamClient` (§4.6). Creation under
/// concurrent callers is exactly-once per key, following the
/// read-then-upgrade-to-write discipline of `ConnectionPool::get_connection_node`
/// in the predecessor hand-rolled pool.
pub struct ConnectionPool {
    clients: RwLock<HashMap<String, Arc<UpstreamClient>>>,
    settings: UpstreamSettings,
    counters: Arc<PoolCounters>,
}

impl ConnectionPool {
    pub fn new(settings: UpstreamSettings) -> Self {
        ConnectionPool {
            clients: RwLock::new(HashMap::new()),
            settings,
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// Returns the client for `connection_key`, creating one if absent.
    pub fn get(&self, connection_key: &str) -> Arc<UpstreamClient> {
        {
            let clients = self.clients.read();
            if let Some(client) = clients.get(connection_key) {
                return client.clone();
            }
        }
        let mut clients = self.clients.write();
        if let Some(client) = clients.get(connection_key) {
            return client.clone();
        }
        let client = Arc::new(UpstreamClient::new(self.settings.clone(), self.counters.clone()));
        clients.insert(connection_key.to_string(), client.clone());
        client
    }

    /// Atomically removes `connection_key`, closing its idle connections and
    /// force-resetting every live one (§4.6).
    pub fn close(&self, connection_key: &str) {
        let removed = self.clients.write().remove(connection_key);
        if let Some(client) = removed {
            client.close_all();
        }
    }

    pub fn size(&self) -> usize {
        self.clients.read().len()
    }

    /// Force-resets every client's connections and empties the pool (§4.9,
    /// used by the Shutdown Coordinator's closer list).
    pub fn close_all(&self) {
        let removed: Vec<Arc<UpstreamClient>> = self.clients.write().drain().map(|(_, v)| v).collect();
        for client in removed {
            client.close_all();
        }
    }

    pub fn counters(&self) -> Arc<PoolCounters> {
        self.counters.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn destination(port: u16, connection_key: &str) -> Destination {
        Destination {
            url_host: "127.0.0.1".to_string(),
            url_port: port,
            sandbox_id: "sbxTEST".to_string(),
            sandbox_port: 3000,
            connection_key: connection_key.to_string(),
            default_to_port_error: false,
            mask_request_host: None,
        }
    }

    fn get_request() -> Request<PoolBody> {
        Request::builder()
            .method("GET")
            .uri("/")
            .header("host", "test")
            .body(Empty::<Bytes>::new().map_err(|never: std::convert::Infallible| match never {}).boxed())
            .unwrap()
    }

    #[test]
    fn max_idle_conns_per_host_is_a_quarter_with_a_floor_of_max_idle_conns() {
        assert_eq!(UpstreamSettings::new(8192, Duration::from_secs(1), Duration::from_secs(1)).max_idle_conns_per_host, 2048);
        assert_eq!(UpstreamSettings::new(4, Duration::from_secs(1), Duration::from_secs(1)).max_idle_conns_per_host, 4);
        assert_eq!(UpstreamSettings::new(1, Duration::from_secs(1), Duration::from_secs(1)).max_idle_conns_per_host, 1);
    }

    #[test]
    fn get_returns_the_same_client_for_the_same_key_and_distinct_clients_otherwise() {
        let pool = ConnectionPool::new(UpstreamSettings::default());
        let a1 = pool.get("key-a");
        let a2 = pool.get("key-a");
        let b = pool.get("key-b");
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn close_removes_the_entry_without_touching_other_keys() {
        let pool = ConnectionPool::new(UpstreamSettings::default());
        pool.get("client-proxy");
        pool.get("other-key");
        pool.close("client-proxy");
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn send_dials_the_backend_and_returns_its_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                .await
                .unwrap();
        });

        let pool = ConnectionPool::new(UpstreamSettings::default());
        let destination = destination(port, "client-proxy");
        let client = pool.get(&destination.connection_key);

        let response = client.send(&destination, get_request()).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(pool.counters().total_connections_opened(), 1);
    }

    #[tokio::test]
    async fn two_destinations_sharing_a_url_but_different_keys_get_distinct_clients() {
        let pool = ConnectionPool::new(UpstreamSettings::default());
        let a = destination(5007, "client-proxy");
        let b = destination(5007, "exec-zzz");

        let client_a = pool.get(&a.connection_key);
        let client_b = pool.get(&b.connection_key);
        assert!(!Arc::ptr_eq(&client_a, &client_b));

        pool.close(&a.connection_key);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn close_force_resets_a_live_connection_instead_of_a_clean_fin() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accepted = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            // Hold the response back so the client's connection stays "live"
            // (no response yet, not returned to the idle queue) until the
            // pool force-closes it from under us.
            let mut rest = Vec::new();
            let result = stream.read_to_end(&mut rest).await;
            result
        });

        let pool = Arc::new(ConnectionPool::new(UpstreamSettings::default()));
        let destination = destination(port, "client-proxy");
        let client = pool.get(&destination.connection_key);

        let send_pool = pool.clone();
        let send_destination = destination.clone();
        let send_task = tokio::spawn(async move {
            let _ = client.send(&send_destination, get_request()).await;
        });

        // Give the dial/handshake a moment to land before we yank the rug.
        tokio::time::sleep(Duration::from_millis(50)).await;
        send_pool.close(&destination.connection_key);

        let backend_result = accepted.await.unwrap();
        // A forced reset (SO_LINGER 0 + shutdown) surfaces to the backend as
        // a read error, never as a clean end-of-stream.
        assert!(backend_result.is_err());

        let _ = send_task.await;
    }
}
