use raftkv::mux::{Mux, SUB_LISTENER_BACKLOG};
use raftkv::StoreError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[tokio::test]
async fn test_routes_by_first_byte() {
    let mut mux = Mux::bind("127.0.0.1:0").await.unwrap();
    let addr = mux.local_addr();
    let ones = mux.match_first_byte(1);
    let twos = mux.match_first_byte(2);
    let rest = mux.any();
    mux.serve().unwrap();

    let mut a = TcpStream::connect(addr).await.unwrap();
    a.write_all(&[2, 42]).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();
    b.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
    let mut c = TcpStream::connect(addr).await.unwrap();
    c.write_all(&[1, 7]).await.unwrap();

    // The routing byte is still readable by the consumer.
    let (mut conn, _) = twos.accept().await.unwrap();
    let mut buf = [0u8; 2];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [2, 42]);

    let (mut conn, _) = rest.accept().await.unwrap();
    let mut buf = [0u8; 3];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET");

    let (mut conn, _) = ones.accept().await.unwrap();
    let mut buf = [0u8; 2];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [1, 7]);

    mux.close();
}

#[tokio::test]
async fn test_unmatched_connection_without_fallback_is_dropped() {
    let mut mux = Mux::bind("127.0.0.1:0").await.unwrap();
    let addr = mux.local_addr();
    let ones = mux.match_first_byte(1);
    mux.serve().unwrap();

    let mut stray = TcpStream::connect(addr).await.unwrap();
    stray.write_all(&[9]).await.unwrap();

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), stray.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let accepted = tokio::time::timeout(Duration::from_millis(200), ones.accept()).await;
    assert!(accepted.is_err());

    mux.close();
}

#[tokio::test]
async fn test_silent_connection_times_out() {
    let mux = Mux::bind("127.0.0.1:0").await.unwrap();
    let mut mux = mux.with_read_timeout(Duration::from_millis(100));
    let addr = mux.local_addr();
    let rest = mux.any();
    mux.serve().unwrap();

    let mut silent = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), silent.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    let accepted = tokio::time::timeout(Duration::from_millis(100), rest.accept()).await;
    assert!(accepted.is_err());

    mux.close();
}

#[tokio::test]
async fn test_serve_twice_fails() {
    let mut mux = Mux::bind("127.0.0.1:0").await.unwrap();
    mux.serve().unwrap();
    assert!(matches!(mux.serve(), Err(StoreError::Config(_))));
    mux.close();
}

#[tokio::test]
async fn test_closed_sub_listener_returns_closed() {
    let mut mux = Mux::bind("127.0.0.1:0").await.unwrap();
    let rest = mux.any();
    mux.serve().unwrap();

    rest.close();
    assert!(matches!(rest.accept().await, Err(StoreError::Closed)));

    mux.close();
}

#[tokio::test]
async fn test_close_unblocks_pending_accept() {
    let mut mux = Mux::bind("127.0.0.1:0").await.unwrap();
    let rest = std::sync::Arc::new(mux.any());
    mux.serve().unwrap();

    let waiter = {
        let rest = rest.clone();
        tokio::spawn(async move { rest.accept().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    rest.close();

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(StoreError::Closed)));

    mux.close();
}

async fn dropped_by_server(mut stream: TcpStream, wait: Duration) -> bool {
    let mut buf = [0u8; 1];
    matches!(
        tokio::time::timeout(wait, stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

#[tokio::test]
async fn test_connections_to_closed_sub_listener_are_dropped() {
    let mut mux = Mux::bind("127.0.0.1:0").await.unwrap();
    let addr = mux.local_addr();
    let ones = mux.match_first_byte(1);
    let rest = mux.any();
    mux.serve().unwrap();

    // Closed but still alive: nothing will ever accept from it again.
    ones.close();

    for _ in 0..SUB_LISTENER_BACKLOG + 4 {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&[1]).await.unwrap();
        assert!(dropped_by_server(conn, Duration::from_secs(2)).await);
    }

    // Other routes keep working.
    let mut http = TcpStream::connect(addr).await.unwrap();
    http.write_all(b"GET").await.unwrap();
    let accepted = tokio::time::timeout(Duration::from_secs(2), rest.accept()).await;
    assert!(matches!(accepted, Ok(Ok(_))));

    drop(ones);
    mux.close();
}

#[tokio::test]
async fn test_full_backlog_drops_new_connections() {
    let mut mux = Mux::bind("127.0.0.1:0").await.unwrap();
    let addr = mux.local_addr();
    let ones = mux.match_first_byte(1);
    let rest = mux.any();
    mux.serve().unwrap();

    let mut queued = Vec::new();
    for _ in 0..SUB_LISTENER_BACKLOG {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(&[1]).await.unwrap();
        queued.push(conn);
    }
    // Let the mux route everything into the backlog.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut overflow = TcpStream::connect(addr).await.unwrap();
    overflow.write_all(&[1]).await.unwrap();
    assert!(dropped_by_server(overflow, Duration::from_secs(2)).await);

    let mut http = TcpStream::connect(addr).await.unwrap();
    http.write_all(b"GET").await.unwrap();
    let accepted = tokio::time::timeout(Duration::from_secs(2), rest.accept()).await;
    assert!(matches!(accepted, Ok(Ok(_))));

    // The queued connections are still there for the consumer.
    let (mut conn, _) = ones.accept().await.unwrap();
    let mut buf = [0u8; 1];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [1]);

    drop(queued);
    mux.close();
}
