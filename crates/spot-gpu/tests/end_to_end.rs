//! Select, provision and validate in one run, wired from settings.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{classify, healthy_host, ok, Call, Cmd, FakeCloud, FakeRemote, FAKE_PUBLIC_IP};
use spot_gpu::providers::Architecture;
use spot_gpu::readiness::StageStatus;
use spot_gpu::{Orchestrator, OrchestratorError, SelectionError, Settings};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SETTINGS: &str = r#"
budget = 1.0
region = "us-east-1"
cross_region = true
extra_regions = ["us-west-2"]
instance_types = ["g5.xlarge", "g4dn.xlarge"]

[provisioning]
poll_interval_secs = 5
max_polls = 3

[readiness]
marker_dir = "/opt/bootstrap/steps"
stages = ["driver", "app"]
complete_marker = "ready"
"#;

/// g4dn.xlarge in us-west-2b is the most efficient offer.
fn market() -> FakeCloud {
    FakeCloud::new()
        .offer("us-east-1", "g5.xlarge", &["us-east-1a"])
        .offer("us-east-1", "g4dn.xlarge", &["us-east-1a"])
        .offer("us-west-2", "g4dn.xlarge", &["us-west-2a", "us-west-2b"])
        .image("us-east-1", "ami-east", Architecture::X86_64)
        .image("us-west-2", "ami-west", Architecture::X86_64)
        .price("us-east-1", "g5.xlarge", "us-east-1a", 0.90)
        .price("us-east-1", "g4dn.xlarge", "us-east-1a", 0.50)
        .price("us-west-2", "g4dn.xlarge", "us-west-2a", 0.60)
        .price("us-west-2", "g4dn.xlarge", "us-west-2b", 0.45)
}

#[tokio::test(start_paused = true)]
async fn test_select_provision_validate() {
    let settings = Settings::from_toml(SETTINGS).unwrap();
    settings.validate().unwrap();

    let cloud = Arc::new(market());
    let remote = FakeRemote::new(|command, elapsed| match classify(command) {
        Cmd::Markers if command.contains("/opt/bootstrap/steps") => {
            ok("driver.done\napp.done\nready\n")
        }
        _ => healthy_host(command, elapsed),
    });
    let orchestrator = Orchestrator::from_settings(&settings, cloud.clone(), remote.clone());
    let cancel = CancellationToken::new();

    let host = orchestrator
        .select_and_provision(
            settings.budget,
            &settings.regions(),
            &settings.instance_types,
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(host.instance_type, "g4dn.xlarge");
    assert_eq!(host.region, "us-west-2");
    assert_eq!(host.zone, "us-west-2b");
    assert_eq!(host.image_id, "ami-west");
    assert_eq!(cloud.requested_zones(), vec!["us-west-2b"]);
    assert!(cloud.calls().contains(&Call::RequestCapacity {
        zone: "us-west-2b".to_string(),
        max_price_cents: 100,
    }));

    let address = host.address().unwrap();
    assert_eq!(address, FAKE_PUBLIC_IP);

    let report = orchestrator
        .validate_readiness(address, &cancel)
        .await
        .unwrap();

    assert_eq!(report.host, FAKE_PUBLIC_IP);
    let stages: Vec<(&str, StageStatus)> = report
        .progress
        .iter()
        .map(|p| (p.stage.as_str(), p.status))
        .collect();
    assert_eq!(
        stages,
        vec![("driver", StageStatus::Done), ("app", StageStatus::Done)]
    );
    assert!(report.all_subsystems_pass());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_requests_no_capacity() {
    let settings = Settings::from_toml(SETTINGS).unwrap();
    let cloud = Arc::new(market());
    let orchestrator =
        Orchestrator::from_settings(&settings, cloud.clone(), FakeRemote::new(healthy_host));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = orchestrator
        .select_and_provision(
            settings.budget,
            &settings.regions(),
            &settings.instance_types,
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::Selection(SelectionError::Cancelled { .. })
    ));
    assert!(cloud.requested_zones().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_slow_region_scan() {
    let settings = Settings::from_toml(SETTINGS).unwrap();
    let cloud = Arc::new(market().slow_availability(Duration::from_secs(120)));
    let orchestrator =
        Orchestrator::from_settings(&settings, cloud.clone(), FakeRemote::new(healthy_host));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    let start = Instant::now();

    let err = orchestrator
        .select_and_provision(
            settings.budget,
            &settings.regions(),
            &settings.instance_types,
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(start.elapsed() < Duration::from_secs(120));
    assert!(!err.remedies().is_empty());
    match err {
        OrchestratorError::Selection(SelectionError::Cancelled { regions }) => {
            assert_eq!(regions, vec!["us-east-1", "us-west-2"]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(cloud.requested_zones().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fulfilment_polls_follow_settings() {
    let settings = Settings::from_toml(SETTINGS).unwrap();
    let cloud = Arc::new(market().zone(
        "us-west-2b",
        common::ZoneScript::StayOpen { code: None },
    ));
    let orchestrator =
        Orchestrator::from_settings(&settings, cloud.clone(), FakeRemote::new(healthy_host));

    let host = orchestrator
        .select_and_provision(
            settings.budget,
            &settings.regions(),
            &settings.instance_types,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(host.zone, "us-west-2a");
    let polls_in_b = cloud.count(|c| {
        matches!(c, Call::DescribeRequest { request_id } if request_id == "sir-us-west-2b")
    });
    assert_eq!(polls_in_b, 3);
}
