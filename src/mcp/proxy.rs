//! Domain-filtering HTTP-CONNECT proxy.
//!
//! MCP containers with declared `allowed_domains` get no direct egress;
//! their only route out is this proxy.  Each container is registered by
//! its source IP with a per-container hostname allow-list.  The proxy
//! accepts only the `CONNECT host:port` verb, checks the caller and the
//! target, resolves the hostname (private ranges rejected), tunnels the
//! bytes, and audits every request — allowed or denied.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
};

use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::audit::{AuditEventType, AuditLogger};
use crate::executor::network;

struct Registration {
    server_name: String,
    allowed_domains: HashSet<String>,
}

/// The running proxy: a TCP listener plus the registration table.
pub struct DomainProxy {
    local_addr: SocketAddr,
    registrations: Arc<Mutex<HashMap<IpAddr, Registration>>>,
    audit: Arc<AuditLogger>,
    /// Test seam: permit tunnels to private addresses.
    allow_private: bool,
}

impl DomainProxy {
    /// Bind on an OS-chosen port and start accepting.
    pub async fn start(audit: Arc<AuditLogger>) -> Result<Arc<Self>, String> {
        Self::start_with_options(audit, false).await
    }

    pub async fn start_with_options(
        audit: Arc<AuditLogger>,
        allow_private: bool,
    ) -> Result<Arc<Self>, String> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| format!("proxy bind error: {e}"))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("proxy addr error: {e}"))?;

        let proxy = Arc::new(Self {
            local_addr,
            registrations: Arc::new(Mutex::new(HashMap::new())),
            audit,
            allow_private,
        });

        let accept_proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let proxy = Arc::clone(&accept_proxy);
                        tokio::spawn(async move {
                            if let Err(e) = proxy.handle_connection(stream, peer).await {
                                log::debug!("proxy: connection from {peer} ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("proxy: accept error: {e}");
                        break;
                    }
                }
            }
        });

        log::info!("proxy: listening on {local_addr}");
        Ok(proxy)
    }

    /// Address containers are pointed at.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a container's source IP with its hostname allow-list.
    pub fn register(&self, ip: IpAddr, server_name: &str, allowed_domains: &[String]) {
        self.registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                ip,
                Registration {
                    server_name: server_name.to_string(),
                    allowed_domains: allowed_domains.iter().cloned().collect(),
                },
            );
    }

    /// Remove a container's registration.
    pub fn unregister(&self, ip: &IpAddr) {
        self.registrations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(ip);
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), String> {
        // Read the request head (up to the blank line).
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream
                .read(&mut buf)
                .await
                .map_err(|e| format!("read error: {e}"))?;
            if n == 0 {
                return Err("client closed before sending a request".to_string());
            }
            head.extend_from_slice(&buf[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") || head.len() > 8192 {
                break;
            }
        }
        let head_text = String::from_utf8_lossy(&head);
        let request_line = head_text.lines().next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default();
        let target = parts.next().unwrap_or_default();

        if method != "CONNECT" {
            self.audit_request(&peer, "unknown", target, false, "method not allowed");
            return respond(&mut stream, "HTTP/1.1 405 Method Not Allowed\r\n\r\n").await;
        }

        let (host, port) = match target.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(port) => (h.to_string(), port),
                Err(_) => {
                    self.audit_request(&peer, "unknown", target, false, "bad target");
                    return respond(&mut stream, "HTTP/1.1 400 Bad Request\r\n\r\n").await;
                }
            },
            None => {
                self.audit_request(&peer, "unknown", target, false, "bad target");
                return respond(&mut stream, "HTTP/1.1 400 Bad Request\r\n\r\n").await;
            }
        };

        // Caller must be a registered container.
        let lookup = {
            let registrations = self.registrations.lock().unwrap_or_else(|e| e.into_inner());
            registrations
                .get(&peer.ip())
                .map(|reg| (reg.server_name.clone(), reg.allowed_domains.contains(&host)))
        };
        let Some((server_name, host_allowed)) = lookup else {
            self.audit_request(&peer, "unregistered", &host, false, "caller not registered");
            return respond(&mut stream, "HTTP/1.1 403 Forbidden\r\n\r\n").await;
        };

        if !host_allowed {
            self.audit_request(&peer, &server_name, &host, false, "domain not allowed");
            return respond(&mut stream, "HTTP/1.1 403 Forbidden\r\n\r\n").await;
        }

        // Resolve; private ranges stay blocked.
        let upstream_addr = if self.allow_private {
            tokio::net::lookup_host((host.as_str(), port))
                .await
                .ok()
                .and_then(|mut addrs| addrs.next())
        } else {
            network::resolve_public(&host, port).await.ok().and_then(|a| a.into_iter().next())
        };
        let Some(upstream_addr) = upstream_addr else {
            self.audit_request(&peer, &server_name, &host, false, "resolution failed");
            return respond(&mut stream, "HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
        };

        let mut upstream = match TcpStream::connect(upstream_addr).await {
            Ok(s) => s,
            Err(e) => {
                self.audit_request(&peer, &server_name, &host, false, "connect failed");
                log::debug!("proxy: connect to {host}:{port} failed: {e}");
                return respond(&mut stream, "HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            }
        };

        self.audit_request(&peer, &server_name, &host, true, "tunnel established");
        respond(&mut stream, "HTTP/1.1 200 Connection Established\r\n\r\n").await?;

        let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        Ok(())
    }

    fn audit_request(
        &self,
        peer: &SocketAddr,
        server_name: &str,
        target_domain: &str,
        allowed: bool,
        detail: &str,
    ) {
        self.audit.log(
            AuditEventType::McpProxy,
            server_name,
            json!({
                "caller": peer.ip().to_string(),
                "target_domain": target_domain,
                "allowed": allowed,
                "detail": detail,
            }),
        );
    }
}

async fn respond(stream: &mut TcpStream, response: &str) -> Result<(), String> {
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| format!("write error: {e}"))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
