use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use meshgate::pool::MsgConnPoolBuilder;

/// The endpoint refuses the first two connects and accepts the third.
/// The pool must attempt three times with waits of 0s, 1s and 2s, then
/// reset its try counter.
#[tokio::test]
async fn test_reconnect_backoff_and_counter_reset() {
    // bind then drop so the port refuses connections for a while
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let started = Instant::now();
    let pool = MsgConnPoolBuilder::new(addr.clone())
        .auto_reconnect(true)
        .max_tries(3)
        .connect_timeout(Duration::from_millis(500))
        .build();

    // attempts one (t=0s) and two (t=1s) have failed by now, the third
    // is sleeping its 2s backoff
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!pool.available());
    assert!(
        pool.try_count() >= 2,
        "two attempts recorded, got {}",
        pool.try_count()
    );

    // bring the endpoint up before the third attempt lands at t=3s
    let listener = TcpListener::bind(&addr).await.unwrap();
    let _accepted = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut sink = vec![0u8; 1024];
        loop {
            match socket.read(&mut sink).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(pool.available(), "third attempt connects");
    assert_eq!(pool.try_count(), 0, "counter resets after success");
    assert!(
        started.elapsed() >= Duration::from_secs(3),
        "cumulative waits of 0s+1s+2s precede the successful attempt"
    );

    pool.write(b"hello").await.unwrap();
    pool.destroy();
}

/// With the retry bound exhausted the pool stays down and stops
/// attempting.
#[tokio::test]
async fn test_reconnect_stops_at_max_tries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let pool = MsgConnPoolBuilder::new(addr)
        .auto_reconnect(true)
        .max_tries(2)
        .connect_timeout(Duration::from_millis(500))
        .build();

    // attempts run at t=0s and t=1s, then the bound is hit
    tokio::time::sleep(Duration::from_millis(1800)).await;
    assert_eq!(pool.try_count(), 2);
    assert!(!pool.available());

    // no further attempts change the counter
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(pool.try_count(), 2);
    pool.destroy();
}

/// `auto_reconnect(false)` gives up after the first failure.
#[tokio::test]
async fn test_no_auto_reconnect_stays_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let pool = MsgConnPoolBuilder::new(addr)
        .auto_reconnect(false)
        .max_tries(10)
        .build();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(pool.try_count(), 1, "exactly one attempt");
    assert!(!pool.available());
    pool.destroy();
}
