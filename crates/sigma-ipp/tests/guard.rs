mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{fast_config, init_tracing, sim_client};
use pretty_assertions::assert_eq;
use sigma_ipp::client::SigmaClient;
use sigma_ipp::protocol::SigmaError;
use sigma_ipp::sim::{PurchaseBehavior, SimConnector, SimHandle};

#[test]
fn test_concurrent_purchases_run_serially() {
    init_tracing();
    let handle = SimHandle::new();
    handle.update(|s| s.frame_interval = Duration::from_millis(5));
    let client = Arc::new(sim_client(&handle));

    let workers: Vec<_> = (0..2)
        .map(|i| {
            let client = Arc::clone(&client);
            thread::spawn(move || client.purchase(100 + i, "826", &format!("ORD-{}", i)))
        })
        .collect();
    for worker in workers {
        assert!(worker.join().unwrap().unwrap().approved());
    }

    let state = handle.state();
    assert_eq!(state.max_open_transports, 1);
    // Each purchase is one uninterrupted critical section
    assert_eq!(
        state.methods(),
        vec!["GET_STATUS", "PURCHASE", "GET_STATUS", "GET_STATUS", "PURCHASE", "GET_STATUS"]
    );
}

#[test]
fn test_second_caller_gets_busy() {
    init_tracing();
    let handle = SimHandle::new();
    handle.update(|s| {
        s.purchase = PurchaseBehavior::Approve {
            progress: vec![1, 3, 5],
        };
        s.frame_interval = Duration::from_millis(100);
    });
    let mut config = fast_config();
    config.acquire_timeout_ms = 20;
    let client = Arc::new(SigmaClient::with_connector(config, SimConnector::new(handle.clone())));

    let first = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.purchase(150, "826", "ORD-A"))
    };
    thread::sleep(Duration::from_millis(50));

    match client.purchase(150, "826", "ORD-B") {
        Err(SigmaError::Busy { waited }) => assert!(waited < Duration::from_millis(500)),
        other => panic!("expected busy, got {:?}", other),
    }
    assert_eq!(client.warmup().unwrap(), None);

    assert!(first.join().unwrap().unwrap().approved());
    assert_eq!(handle.state().connects, 1);
    assert_eq!(handle.state().max_open_transports, 1);
}

#[cfg(unix)]
#[test]
fn test_lock_file_spans_clients() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let handle = SimHandle::new();

    let mut config = fast_config();
    config.lock_file = Some(dir.path().join("sigma.lock"));
    config.acquire_timeout_ms = 30;
    let first = SigmaClient::with_connector(config.clone(), SimConnector::new(handle.clone()));
    let second = SigmaClient::with_connector(config, SimConnector::new(handle.clone()));

    let token = first.guard().try_acquire().unwrap();
    assert!(matches!(second.get_status(), Err(SigmaError::Busy { .. })));
    assert_eq!(handle.state().connects, 0);

    drop(token);
    assert_eq!(second.get_status().unwrap().status(), Some("0"));
}
