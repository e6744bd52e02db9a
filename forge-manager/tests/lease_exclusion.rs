mod common;

use common::*;
use forge_manager::credentials::CredentialState;
use forge_manager::signal::ReloadReason;

#[tokio::test]
async fn at_most_one_replica_forges_per_region() {
    let sim = Sim::new();
    let mut replicas: Vec<Replica> = (0..4)
        .map(|i| sim.replica(&format!("bp-{i}"), "us-east"))
        .collect();

    for round in 0..10 {
        tick_all(&mut replicas).await;
        assert_eq!(leaders(&replicas).len(), 1, "round {round}");
        assert!(forging(&replicas).len() <= 1, "round {round}");
        sim.advance();
    }

    // Steady state: the first replica won and forges after the debounce.
    assert_eq!(forging(&replicas), vec!["bp-0@us-east".to_string()]);
    assert!(replicas[0].credentials_on_disk());
    for standby in &replicas[1..] {
        assert!(!standby.credentials_on_disk());
        assert_eq!(standby.signaler.count(), 0);
    }
}

#[tokio::test]
async fn steady_state_is_idempotent() {
    let sim = Sim::new();
    let mut leader = sim.replica("bp-0", "us-east");

    for _ in 0..6 {
        leader.tick().await;
        sim.advance();
    }
    assert!(leader.is_forging());
    assert_eq!(
        leader.signaler.reasons(),
        vec![ReloadReason::CredentialsInstalled]
    );
    let report = leader.last.as_ref().unwrap();
    assert!(!report.leadership_changed);
    assert!(report.credential_error.is_none());
}

#[tokio::test]
async fn standby_takes_over_after_leader_crash() {
    let sim = Sim::new();
    let mut replicas = vec![sim.replica("bp-a", "us-east"), sim.replica("bp-b", "us-east")];

    tick_all(&mut replicas).await;
    sim.advance();
    tick_all(&mut replicas).await;
    assert_eq!(forging(&replicas), vec!["bp-a@us-east".to_string()]);

    // The last renewal happened at the current clock reading.
    let crashed_at = sim.clock.now();
    replicas[0].crashed = true;

    let deadline = crashed_at
        + chrono::Duration::from_std(LEASE_DURATION + TICK).unwrap();
    let mut took_over_at = None;
    for _ in 0..8 {
        sim.advance();
        tick_all(&mut replicas).await;
        if replicas[1].is_forging() {
            took_over_at = Some(sim.clock.now());
            break;
        }
        assert!(!replicas[1].manager.is_leader());
    }

    let took_over_at = took_over_at.expect("standby never took over");
    assert!(took_over_at <= deadline);
    // Cluster term was already committed while standing by, so forging starts
    // on the tick the lease is won.
    assert!(replicas[1].last.as_ref().unwrap().leadership_changed);
    assert!(replicas[1].credentials_on_disk());
    assert_eq!(
        replicas[1].signaler.reasons(),
        vec![ReloadReason::CredentialsInstalled]
    );
}

#[tokio::test]
async fn store_outage_disables_forging_on_the_same_tick() {
    let sim = Sim::new();
    let mut leader = sim.replica("bp-0", "us-east");

    leader.tick().await;
    sim.advance();
    leader.tick().await;
    assert!(leader.is_forging());

    sim.backend.set_unavailable(true);
    sim.advance();
    let report = leader.tick().await.unwrap().clone();
    assert!(!report.is_leader);
    assert!(report.leadership_changed);
    assert!(!report.forge);
    assert_eq!(report.credential_state, CredentialState::Disabled);
    assert!(!leader.credentials_on_disk());
    assert_eq!(
        leader.signaler.reasons(),
        vec![
            ReloadReason::CredentialsInstalled,
            ReloadReason::CredentialsRemoved
        ]
    );

    // The lease is still ours once the store comes back; forging resumes.
    sim.backend.set_unavailable(false);
    sim.advance();
    leader.tick().await;
    assert!(leader.manager.is_leader());
    assert!(leader.is_forging());
}

#[tokio::test]
async fn graceful_shutdown_hands_over_without_waiting_for_expiry() {
    let sim = Sim::new();
    let mut replicas = vec![sim.replica("bp-a", "us-east"), sim.replica("bp-b", "us-east")];

    for _ in 0..2 {
        tick_all(&mut replicas).await;
        sim.advance();
    }
    assert!(replicas[0].is_forging());

    replicas[0].manager.shutdown().await;
    replicas[0].crashed = true;
    assert!(!replicas[0].credentials_on_disk());

    tick_all(&mut replicas).await;
    assert_eq!(forging(&replicas), vec!["bp-b@us-east".to_string()]);
}

#[tokio::test]
async fn regions_hold_independent_leases() {
    let sim = Sim::new();
    let mut replicas = vec![
        sim.replica("bp-0", "us-east"),
        sim.replica("bp-1", "us-east"),
        sim.replica("bp-0", "eu-west"),
    ];

    for _ in 0..3 {
        tick_all(&mut replicas).await;
        sim.advance();
    }

    // Without cluster management each region only coordinates locally.
    assert_eq!(
        leaders(&replicas),
        vec!["bp-0".to_string(), "bp-0".to_string()]
    );
    assert_eq!(
        forging(&replicas),
        vec!["bp-0@us-east".to_string(), "bp-0@eu-west".to_string()]
    );
}
