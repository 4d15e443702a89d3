use std::time::Duration;

use anyhow::{ensure, Context, Result};
use emberkv_client::EmberKvClient;
use emberkv_proto::EventKind;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVER_URL: &str = "http://127.0.0.1:9980";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "emberkv_integration_tests=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("emberkv integration tests");
    tracing::info!("   server: {}", SERVER_URL);

    test_scalar_operations().await?;
    test_hash_operations().await?;
    test_list_operations().await?;
    test_expiry().await?;
    test_watch_stream().await?;

    tracing::info!("all tests passed");
    Ok(())
}

/// PUT / GET / DELETE round trip
async fn test_scalar_operations() -> Result<()> {
    tracing::info!("test: scalar operations");

    let client = EmberKvClient::connect(SERVER_URL)
        .await
        .context("is an emberkv server running?")?;

    client.put("it:scalar", "hello", 0).await?;
    let value = client.get("it:scalar").await?;
    ensure!(value.as_deref() == Some("hello"), "value should round-trip");

    ensure!(client.delete("it:scalar").await?, "key should be deleted");
    ensure!(
        client.get("it:scalar").await?.is_none(),
        "key should be gone after delete"
    );
    ensure!(
        !client.delete("it:scalar").await?,
        "second delete should be a no-op"
    );

    tracing::info!("   ok");
    Ok(())
}

/// Hash field merge, member reads, member delete
async fn test_hash_operations() -> Result<()> {
    tracing::info!("test: hash operations");

    let client = EmberKvClient::connect(SERVER_URL).await?;
    client.hash_delete("it:hash").await?;

    client
        .hash_put(
            "it:hash",
            vec!["x".into(), "y".into()],
            vec!["1".into(), "2".into()],
            0,
        )
        .await?;

    let x = client.hash_get_field("it:hash", "x").await?;
    ensure!(x.as_deref() == Some("1"), "field x should be 1");

    client.hash_delete_field("it:hash", "x").await?;
    ensure!(
        client.hash_get_field("it:hash", "x").await?.is_none(),
        "field x should be gone"
    );
    let y = client.hash_get_field("it:hash", "y").await?;
    ensure!(y.as_deref() == Some("2"), "field y should survive");

    // Mismatched arrays must be rejected
    let err = client
        .hash_put("it:hash", vec!["k".into()], vec![], 0)
        .await
        .unwrap_err();
    ensure!(
        matches!(err, emberkv_client::Error::InvalidArgument(_)),
        "length mismatch should be invalid"
    );

    client.hash_delete("it:hash").await?;
    tracing::info!("   ok");
    Ok(())
}

/// List append, range read, range delete
async fn test_list_operations() -> Result<()> {
    tracing::info!("test: list operations");

    let client = EmberKvClient::connect(SERVER_URL).await?;
    client.list_delete("it:list").await?;

    client
        .list_push(
            "it:list",
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            0,
        )
        .await?;

    let middle = client.list_get_range("it:list", 1, 3).await?;
    ensure!(middle == r#"["b","c"]"#, "range read mismatch: {middle}");

    client.list_delete_range("it:list", 1, 3).await?;
    let rest = client.list_get("it:list").await?;
    ensure!(
        rest.as_deref() == Some(r#"["a","d"]"#),
        "range delete mismatch: {rest:?}"
    );

    client.list_delete("it:list").await?;
    tracing::info!("   ok");
    Ok(())
}

/// A short-lived record reads as missing after its deadline
async fn test_expiry() -> Result<()> {
    tracing::info!("test: expiry");

    let client = EmberKvClient::connect(SERVER_URL).await?;

    client.put("it:expiring", "soon gone", 1).await?;
    ensure!(
        client.get("it:expiring").await?.is_some(),
        "fresh record should be readable"
    );

    tokio::time::sleep(Duration::from_millis(1500)).await;
    ensure!(
        client.get("it:expiring").await?.is_none(),
        "expired record should read as missing"
    );

    tracing::info!("   ok");
    Ok(())
}

/// A watched key delivers Add and Delete events
async fn test_watch_stream() -> Result<()> {
    tracing::info!("test: watch stream");

    let client = EmberKvClient::connect(SERVER_URL).await?;
    let mut session = client.watch().await?;
    session.watch_key("it:watched").await?;

    // Give the server a moment to apply the subscription
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.put("it:watched", "v1", 0).await?;
    let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
        .await
        .context("timed out waiting for an add event")??
        .context("watch stream ended early")?;
    ensure!(event.kind() == EventKind::Add, "expected an add event");
    ensure!(event.key == "it:watched" && event.value == "v1");

    client.delete("it:watched").await?;
    let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
        .await
        .context("timed out waiting for a delete event")??
        .context("watch stream ended early")?;
    ensure!(
        event.kind() == EventKind::Delete,
        "expected a delete event"
    );

    tracing::info!("   ok");
    Ok(())
}
