//! Ephemeral TCP tunnels from host ports to VM ports.
//!
//! Each tunnel owns a listener bound to a kernel-assigned port and an
//! accept loop. Connections are spliced byte-for-byte in both directions;
//! EOF on one side half-closes the other so protocols that watch for FIN
//! finish cleanly. Deleting a tunnel closes the listener immediately but
//! lets in-flight connections drain.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::multipass::{Client, VmState};

/// Public description of an active tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub host_port: u16,
    pub vm_name: String,
    pub vm_port: u16,
    /// The VM's address when the tunnel was created; connections dial this
    /// even if the VM later changes address.
    pub vm_ip: String,
}

struct TunnelRecord {
    info: TunnelInfo,
    cancel: CancellationToken,
}

/// Manages the set of active tunnels.
///
/// The record map is the only shared state; tunnels never serialize
/// through the manager after creation.
#[derive(Clone)]
pub struct Manager {
    mp: Client,
    tunnels: Arc<RwLock<HashMap<u16, TunnelRecord>>>,
}

impl Manager {
    pub fn new(mp: Client) -> Self {
        Self {
            mp,
            tunnels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Open a tunnel to `vm_name:vm_port` on a kernel-assigned host port.
    ///
    /// The VM must be running with at least one IPv4 address; the errors
    /// for "not found", "not running", and "no ip" stay distinguishable.
    pub async fn create(&self, vm_name: &str, vm_port: u16) -> Result<TunnelInfo> {
        let vm = self.mp.info(vm_name).await?;

        if vm.state != VmState::Running {
            return Err(Error::invalid_state("Running", vm.state.as_str()));
        }
        let vm_ip = vm
            .primary_ip()
            .ok_or_else(|| Error::NoIpAddress {
                name: vm_name.to_string(),
            })?
            .to_string();

        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let host_port = listener.local_addr()?.port();

        let info = TunnelInfo {
            host_port,
            vm_name: vm_name.to_string(),
            vm_port,
            vm_ip: vm_ip.clone(),
        };

        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, format!("{}:{}", vm_ip, vm_port), cancel.clone()));

        self.tunnels
            .write()
            .insert(host_port, TunnelRecord { info: info.clone(), cancel });

        info!(vm = %vm_name, host_port, vm_port, "tunnel created");
        Ok(info)
    }

    /// Close a tunnel. In-flight connections drain via half-close.
    pub fn delete(&self, host_port: u16) -> Result<()> {
        let record = self
            .tunnels
            .write()
            .remove(&host_port)
            .ok_or(Error::TunnelNotFound { port: host_port })?;
        record.cancel.cancel();
        info!(host_port, "tunnel closed");
        Ok(())
    }

    /// Snapshot of all active tunnels.
    pub fn list(&self) -> Vec<TunnelInfo> {
        self.tunnels.read().values().map(|r| r.info.clone()).collect()
    }

    /// Close every tunnel (daemon shutdown).
    pub fn shutdown(&self) {
        let mut tunnels = self.tunnels.write();
        for (_, record) in tunnels.drain() {
            record.cancel.cancel();
        }
    }
}

/// Accept loop. Cancellation closes the listener promptly; each accepted
/// connection runs detached so teardown never cuts an active splice.
async fn serve(listener: TcpListener, target: String, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(target = %target, "tunnel accept loop exiting");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((conn, peer)) => {
                        debug!(%peer, target = %target, "tunnel connection accepted");
                        tokio::spawn(splice(conn, target.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "tunnel accept failed");
                    }
                }
            }
        }
    }
}

/// Bidirectional, order-preserving copy with half-close on EOF.
async fn splice(client: TcpStream, target: String) {
    let server = match TcpStream::connect(&target).await {
        Ok(server) => server,
        Err(e) => {
            debug!(target = %target, error = %e, "tunnel dial failed");
            return;
        }
    };

    let (mut client_read, mut client_write) = client.into_split();
    let (mut server_read, mut server_write) = server.into_split();

    let to_server = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut client_read, &mut server_write).await;
        // Propagate the client's FIN so the VM side sees EOF.
        let _ = server_write.shutdown().await;
    });
    let to_client = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut server_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
    });

    let _ = to_server.await;
    let _ = to_client.await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::multipass::testing::MockExecutor;

    fn running_vm_info(name: &str, ip: &str) -> String {
        format!(
            r#"{{"info": {{"{}": {{"state": "Running", "ipv4": ["{}"]}}}}}}"#,
            name, ip
        )
    }

    fn manager_with(mock: Arc<MockExecutor>) -> Manager {
        Manager::new(Client::with_executor(mock))
    }

    /// Echo server on an ephemeral port; returns the port.
    async fn spawn_echo_server() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn splice_echoes_bytes_in_order() {
        let echo_port = spawn_echo_server().await;
        let mock = Arc::new(MockExecutor::new());
        mock.set_response(
            "multipass info alpha --format json",
            running_vm_info("alpha", "127.0.0.1"),
        );

        let manager = manager_with(mock);
        let tunnel = manager.create("alpha", echo_port).await.unwrap();
        assert!(tunnel.host_port > 0);

        let conn = TcpStream::connect(("127.0.0.1", tunnel.host_port))
            .await
            .unwrap();
        let (mut read_half, mut write_half) = conn.into_split();

        // 1 MiB of patterned bytes, round-tripped byte for byte.
        let payload: Vec<u8> = (0..(1 << 20)).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = async move {
            write_half.write_all(&payload).await.unwrap();
            write_half.shutdown().await.unwrap();
        };
        let mut received = Vec::with_capacity(expected.len());
        let reader = async {
            read_half.read_to_end(&mut received).await.unwrap();
        };
        tokio::join!(writer, reader);
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn fin_propagates_to_the_other_side() {
        // Server reads to EOF, then answers: only reachable if the client's
        // shutdown crossed the splice as a half-close.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let server_port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            conn.read_to_end(&mut buf).await.unwrap();
            conn.write_all(b"done").await.unwrap();
        });

        let mock = Arc::new(MockExecutor::new());
        mock.set_response(
            "multipass info alpha --format json",
            running_vm_info("alpha", "127.0.0.1"),
        );
        let manager = manager_with(mock);
        let tunnel = manager.create("alpha", server_port).await.unwrap();

        let mut conn = TcpStream::connect(("127.0.0.1", tunnel.host_port))
            .await
            .unwrap();
        conn.write_all(b"request").await.unwrap();
        conn.shutdown().await.unwrap();

        let mut reply = Vec::new();
        conn.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"done");
    }

    #[tokio::test]
    async fn create_requires_running_vm() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_response(
            "multipass info alpha --format json",
            r#"{"info": {"alpha": {"state": "Stopped", "ipv4": []}}}"#,
        );
        let err = manager_with(mock).create("alpha", 80).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
    }

    #[tokio::test]
    async fn create_requires_an_ip() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_response(
            "multipass info alpha --format json",
            r#"{"info": {"alpha": {"state": "Running", "ipv4": []}}}"#,
        );
        let err = manager_with(mock).create("alpha", 80).await.unwrap_err();
        assert!(matches!(err, Error::NoIpAddress { .. }));
    }

    #[tokio::test]
    async fn create_unknown_vm_is_not_found() {
        let mock = Arc::new(MockExecutor::new());
        mock.set_error(
            "multipass info ghost --format json",
            "info failed: instance \"ghost\" does not exist",
        );
        let err = manager_with(mock).create("ghost", 80).await.unwrap_err();
        assert!(matches!(err, Error::VmNotFound { .. }));
    }

    #[tokio::test]
    async fn delete_closes_listener_and_frees_record() {
        let echo_port = spawn_echo_server().await;
        let mock = Arc::new(MockExecutor::new());
        mock.set_response(
            "multipass info alpha --format json",
            running_vm_info("alpha", "127.0.0.1"),
        );
        let manager = manager_with(mock);

        let first = manager.create("alpha", echo_port).await.unwrap();
        assert_eq!(manager.list().len(), 1);

        manager.delete(first.host_port).unwrap();
        assert!(manager.list().is_empty());

        // Deleting again reports not-found.
        let err = manager.delete(first.host_port).unwrap_err();
        assert!(matches!(err, Error::TunnelNotFound { .. }));

        // A fresh tunnel comes up on a different kernel-assigned port.
        let second = manager.create("alpha", echo_port).await.unwrap();
        assert_ne!(second.host_port, first.host_port);

        // The old port no longer accepts within a short window.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let old = TcpStream::connect(("127.0.0.1", first.host_port)).await;
        assert!(old.is_err(), "old listener should be closed");
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let echo_port = spawn_echo_server().await;
        let mock = Arc::new(MockExecutor::new());
        mock.set_response(
            "multipass info alpha --format json",
            running_vm_info("alpha", "127.0.0.1"),
        );
        let manager = manager_with(mock);
        manager.create("alpha", echo_port).await.unwrap();
        manager.create("alpha", echo_port).await.unwrap();
        assert_eq!(manager.list().len(), 2);

        manager.shutdown();
        assert!(manager.list().is_empty());
    }
}
