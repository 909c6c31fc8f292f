mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{harness, room_composite_request, Harness};
use egress_core::{CpuCostConfig, ServiceError, ServiceOptions};
use egress_protocol::RequestKind;

fn four_core_node(release: Duration) -> Harness {
    harness(
        4.0,
        CpuCostConfig {
            room_composite_cpu_cost: 3.0,
            ..CpuCostConfig::default()
        },
        release,
        ServiceOptions::default(),
    )
}

#[tokio::test]
async fn burst_is_rejected_until_reservation_releases() {
    let h = four_core_node(Duration::from_millis(150));
    let admission = h.service.admission().clone();
    assert_eq!(admission.idle_cpu(), 4.0);

    h.service.start(room_composite_request("RM_1")).unwrap();
    assert_eq!(admission.pending_cpu(), 3.0);
    assert_eq!(admission.active_count(RequestKind::RoomComposite), 1);

    let err = h.service.start(room_composite_request("RM_2")).unwrap_err();
    assert_eq!(
        err,
        ServiceError::ResourceExhausted {
            kind: RequestKind::RoomComposite
        }
    );
    assert_eq!(h.service.list().len(), 1, "rejected start leaves no job");
    assert_eq!(admission.rejected_count(), 1);
    assert!(!admission.can_accept(RequestKind::RoomComposite));
    assert_eq!(admission.rejected_count(), 1);

    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(admission.pending_cpu(), 0.0);
    h.service.start(room_composite_request("RM_3")).unwrap();
    assert_eq!(h.service.list().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_admit_exactly_one() {
    let h = Arc::new(four_core_node(Duration::from_secs(5)));
    let mut tasks = Vec::new();
    for n in 0..4 {
        let h = h.clone();
        tasks.push(tokio::spawn(async move {
            h.service.start(room_composite_request(&format!("RM_{n}")))
        }));
    }
    let mut accepted = 0;
    for t in tasks {
        match t.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(err) => assert!(matches!(err, ServiceError::ResourceExhausted { .. })),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(h.service.admission().pending_cpu(), 3.0);
}

#[tokio::test]
async fn acceptance_needs_strictly_more_than_cost() {
    let h = four_core_node(Duration::from_secs(5));
    let admission = h.service.admission().clone();
    h.service.start(room_composite_request("RM_1")).unwrap();

    // exactly 1 core available and a track costs 1
    assert_eq!(admission.available_cpu(), 1.0);
    assert!(!admission.can_accept(RequestKind::Track));
    assert!(matches!(
        h.service.start(common::track_request("RM_2")),
        Err(ServiceError::ResourceExhausted { kind: RequestKind::Track })
    ));

    admission.update_idle(4.5);
    assert_eq!(admission.idle_cpu(), 4.0, "idle is clamped to the core count");
    assert!(!admission.can_accept(RequestKind::Track));
}
