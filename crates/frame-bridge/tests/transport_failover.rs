mod support;

use std::sync::Arc;
use std::time::Duration;

use frame_bridge::{
    BridgeConfig, BridgeError, FrameBridge, InvalidationReason, LegacyAdapter, LegacyContext,
    TransportMode,
};
use serde_json::{Value, json};
use support::{FakePeer, PeerScript, bridge_with, config, tab};
use tokio::time::Instant;

fn modern_calls(frame: &frame_bridge::LocalFrame) -> Vec<String> {
    frame
        .sent_of_kind("bridge:call")
        .into_iter()
        .filter_map(|msg| msg["data"]["method"].as_str().map(str::to_owned))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn modern_probe_pins_mode_until_reload() {
    let (frame, bridge) = bridge_with(config());
    let _peer = FakePeer::spawn(&frame, &bridge, PeerScript::modern(), vec![tab("t1", "https://one.test")]);
    bridge.handle_peer_load();
    assert_eq!(bridge.transport_mode(), TransportMode::Unknown);

    let (a, b) = tokio::join!(
        bridge.call("getTabs", vec![]),
        bridge.call("evaluate", vec![json!("document.title")]),
    );
    assert_eq!(a.expect("getTabs")[0]["id"], json!("t1"));
    assert_eq!(b.expect("evaluate"), json!(true));
    assert_eq!(bridge.transport_mode(), TransportMode::Modern);
    // One shared probe plus the two real calls.
    let mut calls = modern_calls(&frame);
    assert_eq!(calls.remove(0), "getTabs");
    calls.sort();
    assert_eq!(calls, ["evaluate", "getTabs"]);
    assert_eq!(bridge.list_methods(), ["getTabs", "evaluate"]);

    bridge.handle_peer_load();
    assert_eq!(bridge.transport_mode(), TransportMode::Unknown);
}

#[tokio::test(start_paused = true)]
async fn modern_timeout_fails_over_to_legacy_handler() {
    let (frame, bridge) = bridge_with(BridgeConfig {
        request_timeout: Duration::from_millis(500),
        ..config()
    });
    let script = PeerScript {
        ignore: vec!["goBack"],
        ..PeerScript::modern()
    };
    let _peer = FakePeer::spawn(&frame, &bridge, script, vec![tab("t1", "https://one.test")]);
    bridge.handle_peer_load();

    let started = Instant::now();
    let result = bridge.call("goBack", vec![]).await.expect("legacy fallback");
    assert_eq!(result, json!(true));
    assert_eq!(started.elapsed(), Duration::from_millis(500));
    assert_eq!(bridge.transport_mode(), TransportMode::Modern);
    assert_eq!(
        frame.sent_of_kind("goBack"),
        vec![json!({ "type": "goBack", "tabId": "t1" })]
    );
}

#[tokio::test(start_paused = true)]
async fn modern_timeout_without_legacy_mapping_surfaces_the_timeout() {
    let (frame, bridge) = bridge_with(BridgeConfig {
        request_timeout: Duration::from_millis(500),
        ..config()
    });
    let script = PeerScript {
        ignore: vec!["screenshot"],
        ..PeerScript::modern()
    };
    let _peer = FakePeer::spawn(&frame, &bridge, script, Vec::new());
    bridge.handle_peer_load();

    // No legacy handler: the timeout surfaces as is.
    let err = bridge.call("screenshot", vec![]).await.unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.to_string(), "bridge:call timed out after 500ms");
}

#[tokio::test(start_paused = true)]
async fn peer_rejection_is_surfaced_verbatim_without_failover() {
    let (frame, bridge) = bridge_with(config());
    let script = PeerScript {
        reject: vec![("navigate", "navigation blocked by policy")],
        ..PeerScript::modern()
    };
    let _peer = FakePeer::spawn(&frame, &bridge, script, vec![tab("t1", "https://one.test")]);
    bridge.handle_peer_load();

    let err = bridge
        .call("navigate", vec![json!("https://blocked.test")])
        .await
        .unwrap_err();
    assert!(matches!(&err, BridgeError::PeerRejected(text) if text == "navigation blocked by policy"));
    assert!(frame.sent_of_kind("navigate").is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_probe_timeout_pins_legacy_for_the_session() {
    let (frame, bridge) = bridge_with(config());
    let script = PeerScript {
        ignore: vec!["getTabs"],
        ..PeerScript::modern()
    };
    let _peer = FakePeer::spawn(&frame, &bridge, script, vec![tab("t1", "https://one.test")]);
    bridge.handle_peer_load();

    let tabs = bridge.call("getTabs", vec![]).await.expect("legacy getTabs");
    assert_eq!(tabs[0]["id"], json!("t1"));
    assert_eq!(bridge.transport_mode(), TransportMode::Legacy);

    bridge.call("reload", vec![json!(0)]).await.expect("legacy reload");
    assert_eq!(modern_calls(&frame), ["getTabs"]);
    assert_eq!(frame.sent_of_kind("reload").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reload_during_transport_probe_rejects_the_call() {
    let (frame, bridge) = bridge_with(config());
    let script = PeerScript {
        ignore: vec!["getTabs"],
        ..PeerScript::modern()
    };
    let _peer = FakePeer::spawn(&frame, &bridge, script, vec![tab("t1", "https://one.test")]);
    bridge.handle_peer_load();

    let call = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.call("goBack", vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(modern_calls(&frame), ["getTabs"]);

    bridge.handle_peer_load();
    assert!(matches!(
        call.await.expect("join"),
        Err(BridgeError::SessionInvalidated(InvalidationReason::Refreshed))
    ));
    assert!(frame.sent_of_kind("goBack").is_empty());
    assert_eq!(bridge.transport_mode(), TransportMode::Unknown);

    // The next session decides its dialect afresh.
    bridge.call("goBack", vec![]).await.expect("legacy goBack");
    assert_eq!(bridge.transport_mode(), TransportMode::Legacy);
    assert_eq!(modern_calls(&frame), ["getTabs", "getTabs"]);
}

#[tokio::test(start_paused = true)]
async fn legacy_evaluate_whitelist_and_rejection() {
    let (frame, bridge) = bridge_with(config());
    let _peer = FakePeer::spawn(
        &frame,
        &bridge,
        PeerScript::legacy(),
        vec![tab("t1", "https://one.test"), tab("t2", "https://two.test")],
    );
    bridge.handle_peer_load();

    bridge
        .call("evaluate", vec![json!("window.history.forward()"), json!(-1)])
        .await
        .expect("whitelisted");
    assert_eq!(
        frame.sent_of_kind("goForward"),
        vec![json!({ "type": "goForward", "tabId": "t2" })]
    );

    let err = bridge
        .call("evaluate", vec![json!("alert(1)")])
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedLegacyOperation { .. }));
}

#[tokio::test(start_paused = true)]
async fn custom_legacy_handlers_extend_the_catalog() {
    let frame = Arc::new(frame_bridge::LocalFrame::with_window(frame_bridge::WindowId(11)));
    let mut legacy = LegacyAdapter::new();
    legacy.register(
        "tabCount",
        |cx: LegacyContext, _args: Vec<Value>, _original: Option<String>| async move {
            Ok::<_, BridgeError>(json!(cx.list_tabs().await.len()))
        },
    );
    let bridge = FrameBridge::with_legacy_adapter(frame.clone(), config(), legacy);
    let _peer = FakePeer::spawn(
        &frame,
        &bridge,
        PeerScript::legacy(),
        vec![tab("t1", "https://one.test"), tab("t2", "https://two.test")],
    );
    bridge.handle_peer_load();

    assert_eq!(bridge.call("tabCount", vec![]).await.expect("custom"), json!(2));
    assert_eq!(bridge.list_methods().last().map(String::as_str), Some("tabCount"));
}
