//! JSON-RPC-over-TCP client used to invoke plugin handlers
//!
//! The wire format is the classic line-delimited JSON RPC shape:
//! `{"method":"<plugin>.<method>","params":[<request>],"id":N}` answered by
//! `{"id":N,"result":{...},"error":null}`. The format is language-neutral,
//! so plugins can be written in anything that speaks TCP and JSON.
//!
//! One connection is dialed per registered plugin and shared by its
//! handlers; calls are serialized on that connection.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use crate::errors::{PluginError, PluginResult};

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Serialize)]
struct RpcRequest<'a, P> {
    method: &'a str,
    params: [&'a P; 1],
    id: u64,
}

#[derive(serde::Deserialize)]
struct RpcResponse<R> {
    #[allow(dead_code)]
    id: u64,
    result: Option<R>,
    error: Option<serde_json::Value>,
}

struct RpcConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct RpcClient {
    conn: Mutex<RpcConn>,
    seq: AtomicU64,
}

impl RpcClient {
    pub async fn connect(address: &str) -> PluginResult<Self> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| PluginError::DialFailed {
                address: address.to_string(),
                message: "dial timeout".to_string(),
            })?
            .map_err(|e| PluginError::DialFailed {
                address: address.to_string(),
                message: e.to_string(),
            })?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            conn: Mutex::new(RpcConn {
                reader: BufReader::new(read),
                writer,
            }),
            seq: AtomicU64::new(0),
        })
    }

    /// One synchronous call; blocks until the plugin replies.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> PluginResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            method,
            params: [params],
            id,
        };
        let mut payload = serde_json::to_vec(&request).map_err(|e| PluginError::Transport {
            method: method.to_string(),
            message: format!("encode: {e}"),
        })?;
        payload.push(b'\n');

        let transport_err = |e: std::io::Error| PluginError::Transport {
            method: method.to_string(),
            message: e.to_string(),
        };

        let mut conn = self.conn.lock().await;
        conn.writer.write_all(&payload).await.map_err(transport_err)?;
        conn.writer.flush().await.map_err(transport_err)?;

        let mut line = String::new();
        let n = conn.reader.read_line(&mut line).await.map_err(transport_err)?;
        drop(conn);
        if n == 0 {
            return Err(PluginError::Transport {
                method: method.to_string(),
                message: "connection closed by plugin".to_string(),
            });
        }

        let response: RpcResponse<R> =
            serde_json::from_str(&line).map_err(|e| PluginError::Transport {
                method: method.to_string(),
                message: format!("decode: {e}"),
            })?;

        if let Some(error) = response.error {
            if !error.is_null() {
                return Err(PluginError::Rpc {
                    method: method.to_string(),
                    message: error.to_string(),
                });
            }
        }
        response.result.ok_or_else(|| PluginError::Rpc {
            method: method.to_string(),
            message: "empty result".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Minimal single-connection echo plugin: replies with the request's
    /// params wrapped in a result.
    async fn spawn_echo_plugin() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            loop {
                let mut chunk = [0u8; 4096];
                let n = match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let req: Value = serde_json::from_slice(&line).unwrap();
                    let reply = serde_json::json!({
                        "id": req["id"],
                        "result": { "echo": req["params"][0], "method": req["method"] },
                        "error": null,
                    });
                    let mut out = serde_json::to_vec(&reply).unwrap();
                    out.push(b'\n');
                    socket.write_all(&out).await.unwrap();
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn round_trips_a_call() {
        let addr = spawn_echo_plugin().await;
        let client = RpcClient::connect(&addr).await.unwrap();

        let reply: Value = client
            .call("auth.Check", &serde_json::json!({"URL": "/x"}))
            .await
            .unwrap();
        assert_eq!(reply["method"], "auth.Check");
        assert_eq!(reply["echo"]["URL"], "/x");

        // ids advance per call on the shared connection
        let again: Value = client
            .call("auth.Check", &serde_json::json!({"URL": "/y"}))
            .await
            .unwrap();
        assert_eq!(again["echo"]["URL"], "/y");
    }

    #[tokio::test]
    async fn dial_failure_is_reported() {
        let err = RpcClient::connect("127.0.0.1:1").await;
        assert!(matches!(err, Err(PluginError::DialFailed { .. })));
    }

    #[tokio::test]
    async fn closed_connection_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // accept and immediately drop the connection
            let _ = listener.accept().await;
        });

        let client = RpcClient::connect(&addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result: PluginResult<Value> = client.call("x.Y", &serde_json::json!({})).await;
        assert!(matches!(result, Err(PluginError::Transport { .. })));
    }
}
