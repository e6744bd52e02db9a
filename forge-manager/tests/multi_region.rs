mod common;

use common::*;
use forge_manager::cluster::ClusterMode;
use forge_manager::types::{EffectivePriority, ForgeState, HealthStatus};

/// Tick every replica once, check global exclusion, then move the clock on.
async fn round(sim: &Sim, replicas: &mut [Replica]) -> Vec<String> {
    tick_all(replicas).await;
    let active = forging(replicas);
    assert!(active.len() <= 1, "dual active: {active:?}");
    sim.advance();
    active
}

/// Same as `round`, with the replicas ticking last to first.
async fn reversed_round(sim: &Sim, replicas: &mut [Replica]) -> Vec<String> {
    tick_all_reversed(replicas).await;
    let active = forging(replicas);
    assert!(active.len() <= 1, "dual active: {active:?}");
    sim.advance();
    active
}

/// Rounds until the first region has published, confirmed and committed.
async fn warm_up(sim: &Sim, replicas: &mut [Replica]) {
    for _ in 0..5 {
        round(sim, replicas).await;
    }
}

fn two_regions(sim: &Sim) -> Vec<Replica> {
    vec![
        sim.regional_replica("bp-0", "us-east", 1),
        sim.regional_replica("bp-1", "us-east", 1),
        sim.regional_replica("bp-0", "eu-west", 2),
    ]
}

const US_EAST: &str = "bp-0@us-east";
const EU_WEST: &str = "bp-0@eu-west";

#[tokio::test]
async fn primary_region_forges_and_records_status() {
    let sim = Sim::new();
    let mut replicas = two_regions(&sim);

    warm_up(&sim, &mut replicas).await;
    assert_eq!(forging(&replicas), vec![US_EAST.to_string()]);

    let report = replicas[0].last.as_ref().unwrap();
    let cluster = report.cluster.as_ref().unwrap();
    assert_eq!(cluster.mode, ClusterMode::MultiRegion);
    assert_eq!(cluster.active_region.as_deref(), Some("us-east"));
    assert!(cluster.status_written);

    // The standby in us-east never writes status.
    let standby = replicas[1].last.as_ref().unwrap().cluster.as_ref().unwrap();
    assert!(!standby.status_written);

    let store = sim.store();
    let east = store
        .get_cluster_record("mainnet", "pool1", "us-east")
        .await
        .unwrap()
        .unwrap();
    let status = east.value.status.unwrap();
    assert_eq!(status.effective_priority, EffectivePriority::Finite(1));
    assert_eq!(status.health_status, HealthStatus::Healthy);
    assert!(status.forging_enabled);
    assert_eq!(status.observed_by, "cardano/bp-0");

    let west = store
        .get_cluster_record("mainnet", "pool1", "eu-west")
        .await
        .unwrap()
        .unwrap();
    let status = west.value.status.unwrap();
    assert_eq!(status.effective_priority, EffectivePriority::Finite(2));
    assert!(!status.forging_enabled);
}

#[tokio::test]
async fn unhealthy_primary_fails_over_and_recovers() {
    let sim = Sim::new();
    let mut replicas = two_regions(&sim);
    warm_up(&sim, &mut replicas).await;
    assert_eq!(forging(&replicas), vec![US_EAST.to_string()]);

    // Both us-east replicas watch the same node, so both probes fail.
    replicas[0].probe.set_healthy(false);
    replicas[1].probe.set_healthy(false);

    // Two failures stay under the threshold.
    for _ in 0..2 {
        assert_eq!(round(&sim, &mut replicas).await, vec![US_EAST.to_string()]);
    }
    // The third makes us-east ineligible; it stops at once and eu-west
    // starts its debounce.
    assert!(round(&sim, &mut replicas).await.is_empty());
    assert!(!replicas[0].credentials_on_disk());
    assert_eq!(round(&sim, &mut replicas).await, vec![EU_WEST.to_string()]);

    for _ in 0..3 {
        assert_eq!(round(&sim, &mut replicas).await, vec![EU_WEST.to_string()]);
    }

    replicas[0].probe.set_healthy(true);
    replicas[1].probe.set_healthy(true);

    // eu-west yields as soon as us-east reports priority 1 again. us-east
    // waits for that report to be on record, then debounces.
    assert!(round(&sim, &mut replicas).await.is_empty());
    assert!(round(&sim, &mut replicas).await.is_empty());
    assert_eq!(round(&sim, &mut replicas).await, vec![US_EAST.to_string()]);
    assert!(!replicas[2].credentials_on_disk());
}

#[tokio::test]
async fn operator_override_disables_region_within_one_tick() {
    let sim = Sim::new();
    let mut replicas = two_regions(&sim);
    warm_up(&sim, &mut replicas).await;
    assert_eq!(forging(&replicas), vec![US_EAST.to_string()]);

    let store = sim.store();
    let current = store
        .get_cluster_record("mainnet", "pool1", "us-east")
        .await
        .unwrap()
        .unwrap();
    let mut record = current.value.clone();
    record.forge_override.enabled = true;
    record.forge_override.reason = Some("maintenance".to_string());
    record.forge_override.forced_state = Some(ForgeState::Disabled);
    assert!(store
        .put_cluster_record(&record, current.version)
        .await
        .unwrap());

    assert!(round(&sim, &mut replicas).await.is_empty());
    let evaluation = replicas[0].last.as_ref().unwrap().cluster.clone().unwrap();
    assert!(evaluation.override_active);
    assert_eq!(evaluation.effective_priority, EffectivePriority::Ineligible);

    assert_eq!(round(&sim, &mut replicas).await, vec![EU_WEST.to_string()]);

    // The override survives the leader's status writes.
    let after = store
        .get_cluster_record("mainnet", "pool1", "us-east")
        .await
        .unwrap()
        .unwrap();
    assert!(after.value.forge_override.enabled);
    assert_eq!(
        after.value.forge_override.reason.as_deref(),
        Some("maintenance")
    );
}

#[tokio::test]
async fn lost_region_goes_stale_and_secondary_takes_over() {
    let sim = Sim::new();
    let mut replicas = two_regions(&sim);
    warm_up(&sim, &mut replicas).await;
    assert_eq!(forging(&replicas), vec![US_EAST.to_string()]);

    // The whole of us-east disappears, status and lease included.
    let last_heartbeat = sim.clock.now() - chrono::Duration::from_std(TICK).unwrap();
    replicas[0].crashed = true;
    replicas[1].crashed = true;

    let mut took_over = None;
    for _ in 0..20 {
        let active = round(&sim, &mut replicas).await;
        if active == vec![EU_WEST.to_string()] {
            took_over = Some(sim.clock.now() - chrono::Duration::from_std(TICK).unwrap());
            break;
        }
    }
    let took_over = took_over.expect("eu-west never took over");
    // Not before the heartbeat went stale (60s), then one debounce tick.
    assert!(took_over - last_heartbeat > chrono::Duration::seconds(60));
    assert!(took_over - last_heartbeat <= chrono::Duration::seconds(75));
}

#[tokio::test]
async fn flapping_health_never_produces_two_forgers() {
    let sim = Sim::new();
    let mut replicas = two_regions(&sim);
    warm_up(&sim, &mut replicas).await;

    for cycle in 0..4 {
        let failing = cycle % 2 == 0;
        for replica in &replicas[..2] {
            if failing {
                replica.probe.push_failures(3);
            } else {
                replica.probe.push_successes(3);
            }
        }
        for _ in 0..4 {
            round(&sim, &mut replicas).await;
        }
    }

    // Healthy at the end, so us-east is back in charge.
    assert_eq!(forging(&replicas), vec![US_EAST.to_string()]);
}

#[tokio::test]
async fn reverse_tick_order_never_produces_two_forgers() {
    let sim = Sim::new();
    let mut replicas = two_regions(&sim);
    // eu-west ticks first now, and bp-1 wins the us-east lease.
    let east = "bp-1@us-east".to_string();

    for _ in 0..5 {
        reversed_round(&sim, &mut replicas).await;
    }
    assert_eq!(forging(&replicas), vec![east.clone()]);

    for cycle in 0..4 {
        let failing = cycle % 2 == 0;
        for replica in &replicas[..2] {
            replica.probe.set_healthy(!failing);
        }
        for _ in 0..6 {
            reversed_round(&sim, &mut replicas).await;
        }
        let expected = if failing { EU_WEST.to_string() } else { east.clone() };
        assert_eq!(forging(&replicas), vec![expected], "cycle {cycle}");
    }
}
