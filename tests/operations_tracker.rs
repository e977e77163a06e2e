use std::time::Duration;

use kapsule::operations::{
    EventPayload, MessageLevel, OperationId, OperationSpec, OperationState, OperationTracker,
};
use kapsule::KapsuleError;
use tokio::sync::oneshot;

fn spec(name: &str) -> OperationSpec {
    OperationSpec::new("start", "Starting container: {name}", "name").arg("name", name)
}

#[tokio::test]
async fn test_concurrent_operations_get_distinct_ids_and_are_retired() {
    let tracker = OperationTracker::new();
    let (tx1, rx1) = oneshot::channel::<()>();
    let (tx2, rx2) = oneshot::channel::<()>();

    let op1 = tracker.track(spec("a"), |p| async move {
        rx1.await.ok();
        Ok(p.operation())
    });
    let op2 = tracker.track(spec("b"), |p| async move {
        rx2.await.ok();
        Ok(p.operation())
    });
    let observe = async {
        tokio::task::yield_now().await;
        let active = tracker.active_ids();
        let paths = tracker.list_paths();
        tx1.send(()).ok();
        tx2.send(()).ok();
        (active, paths)
    };

    let (id1, id2, (active, paths)) = tokio::join!(op1, op2, observe);
    let id1 = id1.unwrap().unwrap();
    let id2 = id2.unwrap().unwrap();
    assert_ne!(id1, id2);
    assert_eq!(active.len(), 2);
    assert!(active.contains(&id1) && active.contains(&id2));
    assert!(paths.iter().all(|p| p.starts_with("/org/kde/kapsule/operations/")));
    assert_eq!(OperationId::parse(&id1.path()), Some(id1));

    assert!(tracker.active_ids().is_empty());
    assert!(!tracker.is_active(id1));
}

#[tokio::test]
async fn test_failed_operation_is_retired_and_reported() {
    let tracker = OperationTracker::new();
    let mut events = tracker.subscribe();

    let err = tracker
        .track(spec("dev"), |_| async {
            Err::<(), _>(KapsuleError::precondition("Container 'dev' does not exist"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Container 'dev' does not exist");
    assert!(tracker.active_ids().is_empty());

    let mut payloads = Vec::new();
    while let Ok(ev) = events.try_recv() {
        payloads.push(ev.payload);
    }
    assert_eq!(
        payloads,
        vec![
            EventPayload::Started {
                kind: "start".to_string(),
                description: "Starting container: dev".to_string(),
                target: "dev".to_string(),
            },
            EventPayload::Message {
                level: MessageLevel::Error,
                text: "Container 'dev' does not exist".to_string(),
                indent: 0,
            },
            EventPayload::Completed {
                state: OperationState::Failed,
                error: Some("Container 'dev' does not exist".to_string()),
            },
        ]
    );
}

#[tokio::test]
async fn test_progress_is_attributed_to_its_operation() {
    let tracker = OperationTracker::new();
    let mut events = tracker.subscribe();

    let id = tracker
        .track(spec("dev"), |p| async move {
            p.info("Starting container...");
            p.dim("detail");
            Ok(p.operation())
        })
        .await
        .unwrap()
        .unwrap();

    let mut seen = 0;
    while let Ok(ev) = events.try_recv() {
        assert_eq!(ev.operation, id);
        seen += 1;
    }
    assert_eq!(seen, 4);
}

#[tokio::test]
async fn test_dropped_operation_is_retired() {
    let tracker = OperationTracker::new();
    let mut events = tracker.subscribe();

    let fut = tracker.track(spec("dev"), |_| std::future::pending::<kapsule::Result<()>>());
    assert!(tokio::time::timeout(Duration::from_millis(20), fut).await.is_err());
    assert!(tracker.active_ids().is_empty());

    let mut last = None;
    while let Ok(ev) = events.try_recv() {
        last = Some(ev.payload);
    }
    assert_eq!(
        last,
        Some(EventPayload::Completed {
            state: OperationState::Failed,
            error: Some("operation was interrupted".to_string()),
        })
    );
}

#[tokio::test]
async fn test_bad_template_fails_before_allocating() {
    let tracker = OperationTracker::new();
    let bad = OperationSpec::new("create", "Creating container: {missing}", "name").arg("name", "x");
    let mut ran = false;
    let res = tracker
        .track(bad, |_| {
            ran = true;
            async { Ok(()) }
        })
        .await;
    assert!(res.is_err());
    assert!(!ran);
    assert!(tracker.active_ids().is_empty());
}
