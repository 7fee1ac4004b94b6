//! Loopback test harness (spec SPEC_FULL.md component K): an echo server
//! standing in for the final destination, plus minimal SOCKS4/5 upstream
//! stubs, following the bind-listener/spawn-task/connect-client shape this
//! codebase's own protocol tests use.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use socks5_impl::protocol::{
    handshake::Request as HandshakeRequest, handshake::Response as HandshakeResponse, Address,
    AsyncStreamOperation, AuthMethod, Reply, Request, Response,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::addr::Host;
use crate::socks::wire;

pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A SOCKS5 upstream that really forwards: negotiates no-auth, accepts any
/// CONNECT, and splices to `target` regardless of what the client asked
/// for. Good enough to stand in for "a working upstream proxy" in an
/// end-to-end test.
pub async fn spawn_socks5_upstream_to(target: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let _req = HandshakeRequest::retrieve_from_async_stream(&mut stream)
                .await
                .unwrap();
            HandshakeResponse::new(AuthMethod::NoAuth)
                .write_to_async_stream(&mut stream)
                .await
                .unwrap();
            let _req = Request::retrieve_from_async_stream(&mut stream)
                .await
                .unwrap();
            Response::new(Reply::Succeeded, Address::unspecified())
                .write_to_async_stream(&mut stream)
                .await
                .unwrap();

            if let Ok(mut upstream) = TcpStream::connect(target).await {
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
            }
        }
    });
    addr
}

/// A SOCKS5 upstream that accepts a single CONNECT and immediately replies
/// success without forwarding anywhere, capturing whatever name it was
/// asked to resolve (or `None` for an IP-literal request) for the
/// SOCKS5h-sends-the-name-verbatim assertion.
pub async fn spawn_echo_socks5_upstream() -> (SocketAddr, Arc<Mutex<Option<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let captured = Arc::new(Mutex::new(None));
    let captured_clone = captured.clone();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let _req = HandshakeRequest::retrieve_from_async_stream(&mut stream)
                .await
                .unwrap();
            HandshakeResponse::new(AuthMethod::NoAuth)
                .write_to_async_stream(&mut stream)
                .await
                .unwrap();
            let req = Request::retrieve_from_async_stream(&mut stream).await.unwrap();
            let (host, _port) = wire::from_impl_address(req.address);
            if let Host::Name(name) = &host {
                *captured_clone.lock() = Some(name.clone());
            }
            Response::new(Reply::Succeeded, Address::unspecified())
                .write_to_async_stream(&mut stream)
                .await
                .unwrap();
        }
    });
    (addr, captured)
}

/// A SOCKS4 upstream that always replies `cd` to any CONNECT request.
pub async fn spawn_stub_socks4_upstream(cd: u8) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            let _vn = stream.read_u8().await.unwrap();
            let _req = wire::read_socks4_request(&mut stream).await.unwrap();
            wire::write_socks4_reply(&mut stream, cd, [0; 4], 0)
                .await
                .unwrap();
        }
    });
    addr
}
