/// Transient markdown: failing endpoints shed load for a bounded window.
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use uplink::telemetry::{EventHistory, EventSeverity};
use uplink::{
    Address, AddressGroup, ConnectionManager, Context, CredentialSpec, EndpointConfig,
    ManagerSettings, OpsConfig, PoolSettings, UplinkError,
};

fn settings_with_markdown(markdown_duration: Duration) -> ManagerSettings {
    ManagerSettings {
        markdown_duration,
        pool: PoolSettings {
            idle_timeout: Duration::from_secs(10),
            ..PoolSettings::default()
        },
        ..ManagerSettings::default()
    }
}

fn context_for(addr: Address, markdown_enabled: bool) -> Arc<Context> {
    let context = Context::new();
    context.insert_address_group("svc", AddressGroup::new(vec![vec![(1.0, addr)]]).unwrap());
    let mut ops = OpsConfig::default();
    ops.named.insert(
        "svc".to_string(),
        EndpointConfig {
            max_connect_retry: 0,
            transient_markdown_enabled: markdown_enabled,
            ..EndpointConfig::default()
        },
    );
    context.set_ops_config(ops);
    context
}

async fn refused_addr() -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = Address::from(listener.local_addr().unwrap());
    drop(listener);
    addr
}

#[tokio::test]
async fn marked_down_endpoint_is_gated_without_dialing() {
    let addr = refused_addr().await;
    let context = context_for(addr, true);
    let manager =
        ConnectionManager::with_settings(context, settings_with_markdown(Duration::from_secs(10)));

    manager.server_models().get(addr).record_failure();

    // Inside the window the dial is never attempted, so the failure is the
    // markdown gate rather than a connection refusal.
    let err = manager
        .get_connection("svc", CredentialSpec::None)
        .await
        .unwrap_err();
    assert!(matches!(err, UplinkError::MarkedDown(a) if a == addr));
}

#[tokio::test]
async fn markdown_expires_and_dialing_resumes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = Address::from(listener.local_addr().unwrap());
    let context = context_for(addr, true);
    let manager = ConnectionManager::with_settings(
        context,
        settings_with_markdown(Duration::from_millis(200)),
    );

    manager.server_models().get(addr).record_failure();
    let err = manager
        .get_connection("svc", CredentialSpec::None)
        .await
        .unwrap_err();
    assert!(matches!(err, UplinkError::MarkedDown(_)));

    tokio::time::sleep(Duration::from_millis(250)).await;

    let (connected, accepted) = tokio::join!(
        manager.get_connection("svc", CredentialSpec::None),
        listener.accept()
    );
    accepted.unwrap();
    assert!(connected.is_ok());
}

#[tokio::test]
async fn exhausted_retries_emit_markdown_telemetry() {
    let addr = refused_addr().await;
    let context = context_for(addr, true);
    let history = Arc::new(EventHistory::new(16));
    context.telemetry.set_event_sink(history.clone());
    let manager = ConnectionManager::with_settings(
        Arc::clone(&context),
        settings_with_markdown(Duration::from_secs(10)),
    );

    let err = manager
        .get_connection("svc", CredentialSpec::None)
        .await
        .unwrap_err();
    assert!(matches!(err, UplinkError::Io(_)));

    assert_eq!(context.telemetry.count("net.markdowns"), 1);
    assert_eq!(
        context
            .telemetry
            .count(&format!("net.markdowns.svc.{addr}")),
        1
    );

    let events = history.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].code, "TMARKDOWN");
    assert_eq!(events[0].severity, EventSeverity::Error);
    assert_eq!(events[0].version, 2);
    assert_eq!(events[0].details["name"], "svc");
    assert_eq!(events[0].details["addr"], addr.to_string());
}

#[tokio::test]
async fn disabled_markdown_never_gates() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = Address::from(listener.local_addr().unwrap());
    let context = context_for(addr, false);
    let manager =
        ConnectionManager::with_settings(context, settings_with_markdown(Duration::from_secs(10)));

    // Even with a fresh failure stamp, a disabled endpoint dials normally.
    manager.server_models().get(addr).record_failure();
    let (connected, accepted) = tokio::join!(
        manager.get_connection("svc", CredentialSpec::None),
        listener.accept()
    );
    accepted.unwrap();
    assert!(connected.is_ok());
}

#[tokio::test]
async fn failures_with_markdown_disabled_stay_silent() {
    let addr = refused_addr().await;
    let context = context_for(addr, false);
    let manager =
        ConnectionManager::with_settings(Arc::clone(&context), settings_with_markdown(Duration::from_secs(10)));

    let err = manager
        .get_connection("svc", CredentialSpec::None)
        .await
        .unwrap_err();
    assert!(matches!(err, UplinkError::Io(_)));

    // The stamp is still recorded, but no markdown telemetry fires.
    assert!(manager
        .server_models()
        .peek(addr)
        .unwrap()
        .last_error()
        .is_some());
    assert_eq!(context.telemetry.count("net.markdowns"), 0);
}
