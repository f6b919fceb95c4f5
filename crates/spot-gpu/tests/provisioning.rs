//! Zone fallback, cancellation and tagging of the provisioning state machine.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    instance_id_for, request_id_for, Call, FakeCloud, InstanceScript, ZoneScript, FAKE_PUBLIC_IP,
};
use spot_gpu::market::ImageTier;
use spot_gpu::providers::{Architecture, InstanceState};
use spot_gpu::provision::{AttemptState, FailureReason, MANAGED_BY_TAG, MANAGED_BY_VALUE};
use spot_gpu::scoring::PriceSource;
use spot_gpu::{Candidate, ProvisioningError, Provisioner};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const REGION: &str = "us-west-2";

fn candidate(zone: &str) -> Candidate {
    Candidate {
        instance_type: "g5.xlarge".to_string(),
        architecture: Architecture::X86_64,
        image_id: "ami-dl-x86".to_string(),
        image_tier: ImageTier::Primary,
        region: REGION.to_string(),
        zone: zone.to_string(),
        spot_price: 0.70,
        on_demand_price: 1.006,
        price_source: PriceSource::Live,
        performance_score: 70,
        efficiency_score: 100.0,
    }
}

/// `us-west-2a/b/c` priced so they are tried in that order.
fn three_zones() -> FakeCloud {
    FakeCloud::new()
        .offer(REGION, "g5.xlarge", &["us-west-2a", "us-west-2b", "us-west-2c"])
        .price(REGION, "g5.xlarge", "us-west-2a", 0.70)
        .price(REGION, "g5.xlarge", "us-west-2b", 0.75)
        .price(REGION, "g5.xlarge", "us-west-2c", 0.80)
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_through_zones_until_fulfilled() {
    let cloud = Arc::new(
        three_zones()
            .zone(
                "us-west-2a",
                ZoneScript::Fail {
                    code: "capacity-not-available".to_string(),
                },
            )
            .zone(
                "us-west-2b",
                ZoneScript::StayOpen {
                    code: Some("capacity-oversubscribed".to_string()),
                },
            )
            .zone("us-west-2c", ZoneScript::Fulfil { after_polls: 2 }),
    );

    let host = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        cloud.requested_zones(),
        vec!["us-west-2a", "us-west-2b", "us-west-2c"]
    );
    assert_eq!(
        cloud.cancelled_requests(),
        vec![request_id_for("us-west-2a"), request_id_for("us-west-2b")]
    );

    assert_eq!(host.instance_id, instance_id_for("us-west-2c"));
    assert_eq!(host.zone, "us-west-2c");
    assert_eq!(host.request_id, request_id_for("us-west-2c"));
    assert_eq!(host.address(), Some(FAKE_PUBLIC_IP));

    let states: Vec<AttemptState> = host.attempts.iter().map(|a| a.state).collect();
    assert_eq!(
        states,
        vec![AttemptState::Failed, AttemptState::Cancelled, AttemptState::Active]
    );
    assert_eq!(host.attempts[0].reason, Some(FailureReason::Capacity));
    assert_eq!(host.attempts[1].reason, Some(FailureReason::Capacity));
}

#[tokio::test(start_paused = true)]
async fn test_all_zones_exhausted_leaves_nothing_pending() {
    let cloud = Arc::new(
        three_zones()
            .zone("us-west-2a", ZoneScript::StayOpen { code: None })
            .zone("us-west-2b", ZoneScript::StayOpen { code: None })
            .zone(
                "us-west-2c",
                ZoneScript::Fail {
                    code: "price-too-low".to_string(),
                },
            ),
    );

    let err = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(!err.remedies().is_empty());
    let (region, attempts) = match err {
        ProvisioningError::Exhausted {
            region, attempts, ..
        } => (region, attempts),
        other => panic!("unexpected error: {other:?}"),
    };
    assert_eq!(region, REGION);
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.state != AttemptState::Pending));

    let reasons: Vec<Option<FailureReason>> = attempts.into_iter().map(|a| a.reason).collect();
    assert_eq!(
        reasons,
        vec![
            Some(FailureReason::Timeout),
            Some(FailureReason::Timeout),
            Some(FailureReason::Price),
        ]
    );

    let mut cancelled = cloud.cancelled_requests();
    cancelled.sort();
    assert_eq!(
        cancelled,
        vec![
            request_id_for("us-west-2a"),
            request_id_for("us-west-2b"),
            request_id_for("us-west-2c"),
        ]
    );
    assert_eq!(cloud.count(|c| matches!(c, Call::Tag { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cheapest_zone_tried_first() {
    let cloud = Arc::new(
        FakeCloud::new()
            .offer(REGION, "g5.xlarge", &["us-west-2a", "us-west-2b"])
            .price(REGION, "g5.xlarge", "us-west-2a", 0.85)
            .price(REGION, "g5.xlarge", "us-west-2b", 0.70),
    );

    let host = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cloud.requested_zones(), vec!["us-west-2b"]);
    assert_eq!(host.zone, "us-west-2b");
    assert_eq!(host.attempts.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_zone_without_subnet_skipped() {
    let cloud = Arc::new(three_zones().without_subnet("us-west-2a"));

    let host = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cloud.requested_zones(), vec!["us-west-2b"]);
    assert_eq!(host.attempts[0].state, AttemptState::Failed);
    assert_eq!(host.attempts[0].reason, Some(FailureReason::NoSubnet));
    assert_eq!(host.attempts[0].request_id, None);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_submission_moves_on() {
    let cloud = Arc::new(three_zones().zone(
        "us-west-2a",
        ZoneScript::Reject("InsufficientInstanceCapacity".to_string()),
    ));

    let host = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(host.zone, "us-west-2b");
    assert_eq!(host.attempts[0].request_id, None);
    assert_eq!(host.attempts[0].reason, Some(FailureReason::Capacity));
    assert!(cloud.cancelled_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_cancels_open_request() {
    let cloud = Arc::new(three_zones().zone("us-west-2a", ZoneScript::StayOpen { code: None }));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(40)).await;
        trigger.cancel();
    });

    let err = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &cancel)
        .await
        .unwrap_err();

    let attempts = match err {
        ProvisioningError::Cancelled { attempts, .. } => attempts,
        other => panic!("unexpected error: {other:?}"),
    };
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, AttemptState::Cancelled);
    assert_eq!(attempts[0].reason, Some(FailureReason::Interrupted));

    assert_eq!(cloud.requested_zones(), vec!["us-west-2a"]);
    assert_eq!(cloud.cancelled_requests(), vec![request_id_for("us-west-2a")]);
}

#[tokio::test(start_paused = true)]
async fn test_fulfilled_instance_tagged_with_selection() {
    let cloud = Arc::new(three_zones());

    let host = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &CancellationToken::new())
        .await
        .unwrap();

    let calls = cloud.calls();
    let requested_cents = calls.iter().find_map(|c| match c {
        Call::RequestCapacity {
            max_price_cents, ..
        } => Some(*max_price_cents),
        _ => None,
    });
    assert_eq!(requested_cents, Some(90));

    let tags = calls
        .iter()
        .find_map(|c| match c {
            Call::Tag { resource_id, tags } if *resource_id == host.instance_id => Some(tags),
            _ => None,
        })
        .unwrap();
    assert_eq!(tags[MANAGED_BY_TAG], MANAGED_BY_VALUE);
    assert_eq!(tags["InstanceType"], "g5.xlarge");
    assert_eq!(tags["ImageId"], "ami-dl-x86");
    assert_eq!(tags["ImageTier"], "primary");
    assert_eq!(tags["Zone"], "us-west-2a");
    assert_eq!(tags["MaxPrice"], "0.9000");
}

#[tokio::test(start_paused = true)]
async fn test_price_refresh_failure_keeps_offered_order() {
    let cloud = Arc::new(
        FakeCloud::new()
            .offer(REGION, "g5.xlarge", &["us-west-2c", "us-west-2a"])
            .failing_price_history()
            .zone(
                "us-west-2c",
                ZoneScript::Fail {
                    code: "capacity-not-available".to_string(),
                },
            ),
    );

    let host = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cloud.requested_zones(), vec!["us-west-2c", "us-west-2a"]);
    assert_eq!(host.zone, "us-west-2a");
}

#[tokio::test(start_paused = true)]
async fn test_unoffered_type_tries_selected_zone() {
    let cloud = Arc::new(FakeCloud::new());

    let host = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2b"), 0.9, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(cloud.requested_zones(), vec!["us-west-2b"]);
    assert_eq!(host.instance_id, instance_id_for("us-west-2b"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_cancel_keeps_attempt_failed() {
    let cloud = Arc::new(
        three_zones()
            .zone(
                "us-west-2a",
                ZoneScript::Fail {
                    code: "capacity-not-available".to_string(),
                },
            )
            .zone("us-west-2b", ZoneScript::StayOpen { code: None })
            .failing_cancel(),
    );

    let host = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        cloud.cancelled_requests(),
        vec![request_id_for("us-west-2a"), request_id_for("us-west-2b")]
    );
    let states: Vec<AttemptState> = host.attempts.iter().map(|a| a.state).collect();
    assert_eq!(
        states,
        vec![AttemptState::Failed, AttemptState::Failed, AttemptState::Active]
    );
    assert_eq!(host.attempts[0].reason, Some(FailureReason::Capacity));
    assert_eq!(host.attempts[1].reason, Some(FailureReason::Timeout));
    assert_eq!(host.zone, "us-west-2c");
}

#[tokio::test(start_paused = true)]
async fn test_terminated_instance_is_not_running() {
    let cloud = Arc::new(three_zones().instance(InstanceScript::Stuck(InstanceState::Terminated)));

    let err = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &CancellationToken::new())
        .await
        .unwrap_err();

    let remedies = err.remedies();
    assert!(remedies[0].contains(&instance_id_for("us-west-2a")));
    match err {
        ProvisioningError::InstanceNotRunning {
            instance_id,
            reason,
        } => {
            assert_eq!(instance_id, instance_id_for("us-west-2a"));
            assert_eq!(reason, "instance entered state terminated");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(cloud.requested_zones(), vec!["us-west-2a"]);
    assert_eq!(cloud.count(|c| matches!(c, Call::DescribeInstance { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn test_instance_without_public_ip_times_out() {
    let cloud = Arc::new(three_zones().instance(InstanceScript::NoPublicIp));
    let start = Instant::now();

    let err = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(start.elapsed() >= Duration::from_secs(300));
    match err {
        ProvisioningError::InstanceNotRunning {
            instance_id,
            reason,
        } => {
            assert_eq!(instance_id, instance_id_for("us-west-2a"));
            assert_eq!(reason, "not running with a public address after 300s");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // checks at 0, 10, ..., 300
    assert_eq!(cloud.count(|c| matches!(c, Call::DescribeInstance { .. })), 31);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_while_waiting_for_instance() {
    let cloud = Arc::new(three_zones().instance(InstanceScript::Stuck(InstanceState::Pending)));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(30)).await;
        trigger.cancel();
    });

    let err = Provisioner::new(cloud.clone())
        .provision(&candidate("us-west-2a"), 0.9, &cancel)
        .await
        .unwrap_err();

    let remedies = err.remedies();
    assert!(remedies[0].contains(&instance_id_for("us-west-2a")));
    let attempts = match err {
        ProvisioningError::Cancelled { attempts, .. } => attempts,
        other => panic!("unexpected error: {other:?}"),
    };
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, AttemptState::Active);
    assert_eq!(
        attempts[0].instance_id.as_deref(),
        Some(instance_id_for("us-west-2a").as_str())
    );
    assert!(cloud.cancelled_requests().is_empty());
}
