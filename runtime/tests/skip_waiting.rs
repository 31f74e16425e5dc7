//! Update takeover: waiting workers, the SKIP_WAITING control message and
//! update-on-next-load.

mod common;

use std::sync::Arc;

use common::{install_default, install_with, registration, respond, url, MockNetwork};
use futures::executor::block_on;
use novacore_sw::{LifecycleEvent, Request, ServiceWorkerError, ServiceWorkerState, WorkerConfig};

fn manual_update(version: &str) -> WorkerConfig {
    WorkerConfig {
        version: version.into(),
        skip_waiting_on_install: false,
        ..WorkerConfig::default()
    }
}

#[test]
fn update_waits_while_a_tab_is_open() {
    let network = Arc::new(MockNetwork::storefront());
    let mut reg = registration(&network);
    let v1 = install_default(&mut reg);
    reg.connect_client(url("/"));

    let v2 = install_with(&mut reg, manual_update("v2"));
    assert_eq!(reg.active(), Some(v1));
    assert_eq!(reg.waiting(), Some(v2));
    assert_eq!(reg.state_of(v2), Some(ServiceWorkerState::Installed));

    // v1 keeps serving from its own caches
    assert!(reg.caches().has("novacore-static-v1"));
    assert!(reg.caches().has("novacore-static-v2"));
}

#[test]
fn skip_waiting_message_takes_control_without_closing_tabs() {
    let network = Arc::new(MockNetwork::storefront());
    let mut reg = registration(&network);
    let v1 = install_default(&mut reg);
    let tab_a = reg.connect_client(url("/"));
    let tab_b = reg.connect_client(url("/games"));
    let v2 = install_with(&mut reg, manual_update("v2"));

    let promoted = block_on(reg.post_message_to_waiting(
        serde_json::json!({ "type": "SKIP_WAITING" }),
        Some(tab_a.id.as_str()),
    ))
    .unwrap();

    assert_eq!(promoted, Some(v2));
    assert_eq!(reg.active(), Some(v2));
    assert_eq!(reg.waiting(), None);
    assert_eq!(reg.state_of(v1), None);
    for tab in [&tab_a, &tab_b] {
        assert_eq!(reg.clients().get(&tab.id).unwrap().controller, Some(v2));
    }
    assert_eq!(reg.clients().len(), 2);
    assert!(reg.lifecycle().events().iter().any(|event| matches!(
        event,
        LifecycleEvent::ControllerChange { worker_id, clients: 2 } if *worker_id == v2
    )));

    // Old caches are gone, the new version serves the app shell
    assert!(!reg.caches().has("novacore-static-v1"));
    let mut shell = respond(&reg, Request::navigate(url("/")));
    assert_eq!(shell.text().unwrap(), "<html>app shell</html>");
}

#[test]
fn other_messages_are_ignored() {
    let network = Arc::new(MockNetwork::storefront());
    let mut reg = registration(&network);
    install_default(&mut reg);
    reg.connect_client(url("/"));
    let v2 = install_with(&mut reg, manual_update("v2"));

    for message in [
        serde_json::json!({ "type": "PING" }),
        serde_json::json!("SKIP_WAITING"),
        serde_json::json!({ "kind": "SKIP_WAITING" }),
        serde_json::Value::Null,
    ] {
        let promoted = block_on(reg.post_message_to_waiting(message, None)).unwrap();
        assert_eq!(promoted, None);
    }
    assert_eq!(reg.waiting(), Some(v2));
}

#[test]
fn skip_waiting_to_active_worker_is_harmless() {
    let network = Arc::new(MockNetwork::storefront());
    let mut reg = registration(&network);
    let v1 = install_default(&mut reg);
    block_on(reg.post_message(serde_json::json!({ "type": "SKIP_WAITING" }), None)).unwrap();
    assert_eq!(reg.active(), Some(v1));
}

#[test]
fn message_without_waiting_worker() {
    let network = Arc::new(MockNetwork::storefront());
    let mut reg = registration(&network);
    install_default(&mut reg);
    assert_eq!(
        block_on(reg.post_message_to_waiting(serde_json::json!({ "type": "SKIP_WAITING" }), None)),
        Err(ServiceWorkerError::NoWaitingWorker)
    );
}

#[test]
fn update_applies_once_every_tab_is_closed() {
    let network = Arc::new(MockNetwork::storefront());
    let mut reg = registration(&network);
    install_default(&mut reg);
    let tab = reg.connect_client(url("/"));
    let v2 = install_with(&mut reg, manual_update("v2"));

    assert_eq!(block_on(reg.release_clients()).unwrap(), None);
    reg.clients().disconnect(&tab.id);
    assert_eq!(block_on(reg.release_clients()).unwrap(), Some(v2));
    assert_eq!(reg.state_of(v2), Some(ServiceWorkerState::Activated));
}
