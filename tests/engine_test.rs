//! End-to-end engine tests over scripted HTTP/1.1 servers.

mod common;

use common::H1Connector;
use std::time::Duration;
use wirenet::engine::EngineBuilder;
use wirenet::{LoadState, NetError, RequestEngine};

const CACHEABLE: &str = "HTTP/1.1 200 OK\r\n\
    Cache-Control: max-age=60\r\n\
    ETag: \"v1\"\r\n\
    Content-Length: 5\r\n\r\nhello";

const NOT_MODIFIED: &str = "HTTP/1.1 304 Not Modified\r\n\
    Cache-Control: max-age=60\r\n\
    ETag: \"v1\"\r\n\r\n";

fn engine(connector: &H1Connector) -> RequestEngine<H1Connector> {
    EngineBuilder::new(connector.clone()).build()
}

#[tokio::test(start_paused = true)]
async fn test_cache_hit_then_conditional_revalidation() {
    let server = H1Connector::new();
    server.reply(CACHEABLE);
    server.reply(NOT_MODIFIED);
    let engine = engine(&server);

    let first = engine.get("http://h/x").send().await.unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.text().unwrap(), "hello");
    assert!(!first.is_from_cache());
    assert_eq!(server.requests().len(), 1);

    // Within max-age: no network at all.
    tokio::time::advance(Duration::from_secs(30)).await;
    let second = engine.get("http://h/x").send().await.unwrap();
    assert!(second.is_from_cache());
    assert_eq!(second.text().unwrap(), "hello");
    assert_eq!(server.requests().len(), 1);

    // Past max-age: a conditional request, answered with 304.
    tokio::time::advance(Duration::from_secs(31)).await;
    let third = engine.get("http://h/x").send().await.unwrap();
    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].contains("if-none-match: \"v1\"\r\n"));
    assert_eq!(third.status(), 200);
    assert!(third.is_from_cache());
    assert_eq!(third.text().unwrap(), "hello");

    // The 304 extended freshness.
    tokio::time::advance(Duration::from_secs(30)).await;
    let fourth = engine.get("http://h/x").send().await.unwrap();
    assert!(fourth.is_from_cache());
    assert_eq!(server.requests().len(), 2);

    // Both network exchanges shared one kept-alive connection.
    assert_eq!(server.connects(), 1);
}

#[tokio::test]
async fn test_keep_alive_connection_is_reused() {
    let server = H1Connector::new();
    for body in ["one", "two"] {
        server.reply(&format!(
            "HTTP/1.1 200 OK\r\nCache-Control: no-store\r\nContent-Length: 3\r\n\r\n{body}"
        ));
    }
    let engine = engine(&server);

    let a = engine.get("http://h/a").send().await.unwrap();
    let b = engine.get("http://h/b").send().await.unwrap();
    assert_eq!(a.text().unwrap(), "one");
    assert_eq!(b.text().unwrap(), "two");
    assert_eq!(server.connects(), 1);
    assert_eq!(engine.pool().idle_count(), 1);
    assert!(engine.cache().is_empty());
}

#[tokio::test]
async fn test_connection_close_is_not_pooled() {
    let server = H1Connector::new();
    server.reply_and_close("HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok");
    server.reply_and_close("HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok");
    let engine = engine(&server);

    engine.get("http://h/a").send().await.unwrap();
    engine.get("http://h/b").send().await.unwrap();
    assert_eq!(server.connects(), 2);
    assert_eq!(engine.pool().idle_count(), 0);
}

#[tokio::test]
async fn test_set_cookie_sent_back() {
    let server = H1Connector::new();
    server.reply(
        "HTTP/1.1 200 OK\r\n\
         Set-Cookie: a=1\r\n\
         Set-Cookie: b=2; Path=/\r\n\
         Set-Cookie: secret=x; Secure\r\n\
         Content-Length: 0\r\n\r\n",
    );
    server.reply("HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
    let engine = engine(&server);

    engine.get("http://h/login").send().await.unwrap();
    assert_eq!(engine.cookies().len(), 3);

    engine.post("http://h/api").body("{}").send().await.unwrap();
    let requests = server.requests();
    assert!(requests[1].contains("cookie: a=1; b=2\r\n"));
    assert!(!requests[1].contains("secret"));
}

#[tokio::test]
async fn test_default_user_agent_and_override() {
    let server = H1Connector::new();
    server.reply("HTTP/1.1 204 No Content\r\n\r\n");
    server.reply("HTTP/1.1 204 No Content\r\n\r\n");
    let engine = EngineBuilder::new(server.clone()).user_agent("custom-agent/2").build();

    engine.get("http://h/").send().await.unwrap();
    engine
        .get("http://h/")
        .header("user-agent", "custom/1")
        .send()
        .await
        .unwrap();
    let requests = server.requests();
    assert!(requests[0].contains("user-agent: custom-agent/2\r\n"));
    assert!(requests[1].contains("user-agent: custom/1\r\n"));
    assert!(!requests[1].contains("custom-agent/2"));
}

#[tokio::test(start_paused = true)]
async fn test_stale_entry_served_when_network_fails() {
    let server = H1Connector::new();
    server.reply("HTTP/1.1 200 OK\r\nCache-Control: max-age=1\r\nContent-Length: 3\r\n\r\nold");
    server.hang_up();
    let engine = engine(&server);

    engine.get("http://h/page").send().await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;

    let fallback = engine.get("http://h/page").send().await.unwrap();
    assert!(fallback.is_from_cache());
    assert_eq!(fallback.text().unwrap(), "old");
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_must_revalidate_blocks_stale_fallback() {
    let server = H1Connector::new();
    server.reply(
        "HTTP/1.1 200 OK\r\nCache-Control: max-age=1, must-revalidate\r\nContent-Length: 3\r\n\r\nold",
    );
    server.hang_up();
    let engine = engine(&server);

    engine.get("http://h/page").send().await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;

    let err = engine.get("http://h/page").send().await.unwrap_err();
    assert!(err.is_transport_error());
}

#[tokio::test]
async fn test_connect_failure_without_cache() {
    let server = H1Connector::new();
    server.refuse_connections(true);
    let engine = engine(&server);

    let err = engine.get("http://h/").send().await.unwrap_err();
    assert_eq!(err, NetError::ConnectionRefused);
    assert_eq!(server.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_on_silent_server() {
    let server = H1Connector::new();
    server.stay_silent();
    let engine = engine(&server);

    let err = engine
        .get("http://h/slow")
        .idle_timeout(Duration::from_secs(2))
        .send()
        .await
        .unwrap_err();
    assert_eq!(err, NetError::TimedOut);
}

#[tokio::test]
async fn test_unsafe_method_invalidates_cached_url() {
    let server = H1Connector::new();
    server.reply(CACHEABLE);
    server.reply("HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n");
    server.reply(CACHEABLE);
    let engine = engine(&server);

    engine.get("http://h/item").send().await.unwrap();
    assert_eq!(engine.cache().len(), 1);

    let created = engine.post("http://h/item").body("x").send().await.unwrap();
    assert_eq!(created.status(), 201);
    assert!(engine.cache().is_empty());

    let again = engine.get("http://h/item").send().await.unwrap();
    assert!(!again.is_from_cache());
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_vary_keeps_variants_apart() {
    let server = H1Connector::new();
    for body in ["gzip!", "plain"] {
        server.reply(&format!(
            "HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nVary: Accept-Encoding\r\nContent-Length: 5\r\n\r\n{body}"
        ));
    }
    let engine = engine(&server);

    let gzip = engine
        .get("http://h/v")
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(gzip.text().unwrap(), "gzip!");

    let identity = engine
        .get("http://h/v")
        .header("accept-encoding", "identity")
        .send()
        .await
        .unwrap();
    assert!(!identity.is_from_cache());
    assert_eq!(identity.text().unwrap(), "plain");

    let gzip_again = engine
        .get("http://h/v")
        .header("accept-encoding", "gzip")
        .send()
        .await
        .unwrap();
    assert!(gzip_again.is_from_cache());
    assert_eq!(gzip_again.text().unwrap(), "gzip!");
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn test_chunked_response_body() {
    let server = H1Connector::new();
    server.reply(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
         4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n",
    );
    let engine = engine(&server);

    let response = engine.get("http://h/chunked").send().await.unwrap();
    assert_eq!(response.text().unwrap(), "Wikipedia");
    assert_eq!(engine.pool().idle_count(), 1);
}

#[tokio::test]
async fn test_body_over_limit_fails() {
    let server = H1Connector::new();
    server.reply(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
         4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    server.reply("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
    let engine = EngineBuilder::new(server.clone()).max_body_size(5).build();

    let err = engine.get("http://h/big").send().await.unwrap_err();
    assert_eq!(err, NetError::ResponseBodyTooBig);
    assert!(!err.is_transport_error());
    assert_eq!(engine.pool().idle_count(), 0);

    let small = engine.get("http://h/small").send().await.unwrap();
    assert_eq!(small.text().unwrap(), "hello");
}

#[tokio::test]
async fn test_transaction_load_state() {
    let server = H1Connector::new();
    server.reply("HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
    let engine = engine(&server);

    let mut txn = engine.get("http://h/").into_transaction().unwrap();
    let watcher = txn.subscribe();
    assert_eq!(txn.load_state(), LoadState::Idle);

    let response = engine.execute_transaction(&mut txn).await.unwrap();
    assert_eq!(response.text().unwrap(), "ok");
    assert_eq!(txn.load_state(), LoadState::Idle);
    assert!(watcher.has_changed().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_maintenance_task_purges_expired_state() {
    let server = H1Connector::new();
    server.reply("HTTP/1.1 200 OK\r\nCache-Control: max-age=5\r\nContent-Length: 2\r\n\r\nok");
    let engine = EngineBuilder::new(server.clone())
        .pool_idle_timeout(Duration::from_secs(10))
        .build();

    engine.get("http://h/").send().await.unwrap();
    assert_eq!(engine.cache().len(), 1);
    assert_eq!(engine.pool().idle_count(), 1);

    let task = engine.start_maintenance_task(Duration::from_secs(1));
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert!(engine.cache().is_empty());
    assert_eq!(engine.pool().idle_count(), 0);
    task.abort();
}
