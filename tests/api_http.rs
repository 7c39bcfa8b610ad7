//! The HTTP API served over a real socket

use std::sync::Arc;

use pig_arena_server::lobby::{DirectorySettings, SessionDirectory};
use pig_arena_server::metrics::Metrics;
use pig_arena_server::net::api::{router, ApiSettings};
use pig_arena_server::net::protocol::MatchResponse;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn serve() -> (Arc<SessionDirectory>, std::net::SocketAddr) {
    let directory = Arc::new(SessionDirectory::new(
        DirectorySettings::default(),
        Arc::new(Metrics::new()),
    ));
    let app = router(
        directory.clone(),
        ApiSettings {
            public_join_url: "https://localhost:4433".to_string(),
        },
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (directory, addr)
}

/// Send a raw request and split the reply into status line and body
async fn exchange(addr: std::net::SocketAddr, request: &str) -> (String, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let raw = String::from_utf8(raw).unwrap();

    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let status = head.lines().next().unwrap().to_string();
    (status, body.to_string())
}

#[tokio::test]
async fn test_chunked_create_keeps_body() {
    let (directory, addr) = serve().await;

    let body = r#"{"participant_name":"Alice","target":20}"#;
    let (first, second) = body.split_at(17);
    let request = format!(
        "POST /api/match/create HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Transfer-Encoding: chunked\r\n\
         Connection: close\r\n\r\n\
         {:x}\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
        first.len(),
        first,
        second.len(),
        second
    );

    let (status, body) = exchange(addr, &request).await;
    assert!(status.contains("201"), "unexpected status {}", status);

    let created: MatchResponse = serde_json::from_str(&body).unwrap();
    assert!(created.join_endpoint.contains("participantName=Alice"));
    assert_eq!(directory.detail(created.session_id).unwrap().target, 20);
}

#[tokio::test]
async fn test_content_length_join() {
    let (directory, addr) = serve().await;

    let body = r#"{"participant_name":"Bob"}"#;
    let request = format!(
        "POST /api/match/join HTTP/1.1\r\n\
         Host: localhost\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    );

    let (status, body) = exchange(addr, &request).await;
    assert!(status.contains("200"), "unexpected status {}", status);

    let joined: MatchResponse = serde_json::from_str(&body).unwrap();
    assert_eq!(directory.open_session_id(), Some(joined.session_id));
    assert_eq!(directory.detail(joined.session_id).unwrap().target, 100);
}

#[tokio::test]
async fn test_get_on_create_is_method_not_allowed() {
    let (directory, addr) = serve().await;

    let (status, _) = exchange(
        addr,
        "GET /api/match/create HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(status.contains("405"), "unexpected status {}", status);
    assert!(directory.is_empty());
}
