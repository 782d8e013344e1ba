use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rtu_sync::http::ReqwestTransport;
use rtu_sync::protocol::OutboundRequest;
use rtu_sync::reconcile::Bookmark;
use rtu_sync::server::ServerOptions;
use rtu_sync::storage::{EntityCache, MemoryStore};
use rtu_sync::{Delivery, RtuClient, RtuConfig};
use serde_json::json;
use tokio::time::{sleep, timeout};

fn reserve_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

async fn start_server(options: ServerOptions) -> Result<(u16, tokio::task::JoinHandle<()>)> {
    let port = reserve_port()?;
    let handle = tokio::spawn(async move {
        let _ = rtu_sync::server::start(port, options).await;
    });
    sleep(Duration::from_millis(150)).await;
    Ok((port, handle))
}

fn client(port: u16, token: &str) -> Result<RtuClient> {
    let mut config = RtuConfig::new(&format!("http://127.0.0.1:{}", port))?;
    config.token = Some(token.to_string());
    config.device_id = "device-7".to_string();
    let http = Arc::new(ReqwestTransport::new(config.request_timeout())?);
    Ok(RtuClient::with_parts(config, Arc::new(MemoryStore::new()), http))
}

fn secured() -> ServerOptions {
    ServerOptions {
        token: Some("secret".into()),
        heartbeat_delay: Duration::from_secs(1),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_without_channel_uses_http() -> Result<()> {
    let (port, server) = start_server(secured()).await?;
    let client = client(port, "secret")?;

    let request = OutboundRequest::get("books", "bookmarks")
        .with_query("since", 0)
        .with_extra(json!({ "reason": "sync" }));
    let body = match client.send(&request).await {
        Delivery::Fallback(body) => body,
        other => panic!("expected http fallback, got {:?}", other),
    };

    assert_eq!(body["Method"], "GET");
    assert_eq!(body["Path"], "books/bookmarks");
    assert_eq!(body["Query"]["since"], "0");
    assert_eq!(body["Extras"], json!({ "reason": "sync" }));
    assert_eq!(body["DeviceId"], "device-7");

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_fallback_is_reported_as_failed() -> Result<()> {
    let (port, server) = start_server(secured()).await?;
    let client = client(port, "wrong")?;

    let delivery = client.send(&OutboundRequest::get("books", "bookmarks")).await;
    assert_eq!(delivery, Delivery::Failed);

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_book_is_fetched_into_cache() -> Result<()> {
    let (port, server) = start_server(secured()).await?;
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/admin/fixtures/Books/Items/k1", port))
        .json(&json!({ "Id": "k1", "Title": "Dune" }))
        .send()
        .await?
        .error_for_status()?;

    let client = client(port, "secret")?;
    client.open().await?;
    client
        .bookmarks()
        .upsert(Bookmark::new("b1", "k1", "cfi", 0.1))
        .await?;

    let cache = client.entities().clone();
    timeout(Duration::from_secs(3), async {
        while !cache.contains("k1") {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    assert_eq!(cache.get("k1").unwrap()["Title"], "Dune");

    server.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_puts_dirty_bookmarks_over_http() -> Result<()> {
    let (port, server) = start_server(secured()).await?;
    let client = client(port, "secret")?;
    client.open().await?;

    client.bookmarks().upsert(Bookmark::new("b1", "", "a", 0.2)).await?;
    client.bookmarks().upsert(Bookmark::new("b2", "", "b", 0.4)).await?;

    assert_eq!(client.bookmarks().flush().await, 2);
    assert!(client.bookmarks().dirty_ids().await.is_empty());

    let calls = reqwest::get(format!("http://127.0.0.1:{}/admin/calls", port))
        .await?
        .json::<Vec<String>>()
        .await?;
    assert!(calls.contains(&"PUT /Books/Bookmarks".to_string()));

    server.abort();
    Ok(())
}
