//! End-to-end scenarios over a local cluster.

use std::sync::Arc;

use super::{ClusterConfig, GroupSpec, LocalCluster};
use crate::client::{ClientContext, ClientRequest};
use crate::server::{
    AccessType, Accessor, CommandResult, GroupId, Operation, ReplicaId,
    ReplicaTag, Status, TokenVerifier,
};
use crate::utils::GuidStoreError;

use bytes::Bytes;

use tempfile::TempDir;

use tokio::time::{self, Duration, Instant};

const SETTLE: Duration = Duration::from_secs(5);

fn cluster_config(
    dir: &TempDir,
    groups: &[(GroupId, Vec<ReplicaId>)],
    extra: &str,
) -> Result<ClusterConfig, GuidStoreError> {
    let replica = format!(
        "hb_hear_timeout_min = 150\nhb_hear_timeout_max = 300\n\
         hb_send_interval_ms = 20\ncheckpoint_retry_ms = 50\n{}",
        extra
    );
    Ok(ClusterConfig {
        groups: groups
            .iter()
            .map(|(id, members)| GroupSpec {
                id: *id,
                members: members.clone(),
            })
            .collect(),
        data_dir: dir.path().to_string_lossy().into_owned(),
        replica: Some(replica.parse()?),
        client: Some(
            "attempt_timeout_ms = 400\nmax_retries = 30\nbackoff_max_ms = 200"
                .parse()?,
        ),
    })
}

/// Three-replica group 0 on nodes 0 to 2.
async fn launch_three(
    dir: &TempDir,
    extra: &str,
) -> Result<LocalCluster, GuidStoreError> {
    LocalCluster::launch(cluster_config(dir, &[(0, vec![0, 1, 2])], extra)?)
        .await
}

fn tag(node: ReplicaId) -> ReplicaTag {
    ReplicaTag::new(0, node)
}

fn create(guid: &str) -> ClientRequest {
    ClientRequest::new(guid, guid, Operation::CreateRecord)
}

fn write(
    key: &str,
    requester: &str,
    field: &str,
    value: &str,
) -> ClientRequest {
    ClientRequest::new(
        key,
        requester,
        Operation::Write {
            field: field.into(),
            value: Bytes::copy_from_slice(value.as_bytes()),
        },
    )
}

fn read(key: &str, requester: &str, field: &str) -> ClientRequest {
    ClientRequest::new(
        key,
        requester,
        Operation::Read {
            field: field.into(),
        },
    )
}

async fn expect_ok(
    client: &mut ClientContext,
    req: ClientRequest,
) -> Result<CommandResult, GuidStoreError> {
    let result = client.execute(req.clone()).await?;
    if !result.is_ok() {
        return Err(GuidStoreError::msg(format!(
            "{:?} got {:?}",
            req, result
        )));
    }
    Ok(result)
}

/// Polls until replica `node` of group 0 has finished its Prepare phase.
async fn wait_prepared(
    cluster: &LocalCluster,
    node: ReplicaId,
) -> Result<(), GuidStoreError> {
    let deadline = Instant::now() + SETTLE;
    while !cluster.query_info(tag(node)).await?.is_leader {
        if Instant::now() >= deadline {
            return Err(GuidStoreError::msg(format!(
                "replica {} never prepared",
                node
            )));
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

fn ok_value(value: &'static str) -> Option<Bytes> {
    Some(Bytes::from_static(value.as_bytes()))
}

/// Polls until exactly one running replica of group 0 leads and every other
/// listed replica follows it.
async fn settled_leader(
    cluster: &LocalCluster,
    nodes: &[ReplicaId],
) -> Result<ReplicaId, GuidStoreError> {
    let deadline = Instant::now() + SETTLE;
    loop {
        let mut infos = vec![];
        for &node in nodes {
            infos.push(cluster.query_info(tag(node)).await?);
        }
        let leaders: Vec<ReplicaId> = infos
            .iter()
            .filter(|info| info.is_leader)
            .map(|info| info.tag.node)
            .collect();
        if leaders.len() == 1
            && infos.iter().all(|info| info.leader == Some(leaders[0]))
        {
            return Ok(leaders[0]);
        }
        if Instant::now() >= deadline {
            return Err(GuidStoreError::msg(format!(
                "no settled leader: {:?}",
                infos
            )));
        }
        time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_with_two_of_five_down() -> Result<(), GuidStoreError> {
    let dir = tempfile::tempdir()?;
    let config = cluster_config(&dir, &[(0, vec![0, 1, 2, 3, 4])], "")?;
    let mut cluster = LocalCluster::launch(config).await?;
    cluster.isolate(3)?;
    cluster.isolate(4)?;

    let mut client = cluster.client()?;
    assert_eq!(expect_ok(&mut client, create("alice")).await?.version, 1);
    let email = write("alice", "alice", "email", "a@x.org");
    assert_eq!(expect_ok(&mut client, email).await?.version, 2);

    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;
    for node in 0..3 {
        let state = cluster.dump_state(tag(node)).await?;
        let record = state
            .get("alice")
            .ok_or_else(|| GuidStoreError::msg("alice missing"))?;
        assert_eq!(record.fields.get("email").cloned(), ok_value("a@x.org"));
        assert_eq!(record.version, 2);
    }
    for node in 3..5 {
        let state = cluster.dump_state(tag(node)).await?;
        assert!(state.get("alice").is_none());
    }

    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unlisted_reader_denied() -> Result<(), GuidStoreError> {
    let dir = tempfile::tempdir()?;
    let mut cluster = launch_three(&dir, "").await?;

    let mut client = cluster.client()?;
    expect_ok(&mut client, create("alice")).await?;
    let ssn = write("alice", "alice", "ssn", "123-45-6789");
    expect_ok(&mut client, ssn).await?;

    let result = client.execute(read("alice", "bob", "ssn")).await?;
    assert_eq!(result.status, Status::Denied);
    assert_eq!(result.value, None);
    assert_eq!(result.version, 2);
    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;
    let peek = read("alice", "bob", "ssn").best_effort();
    assert_eq!(client.execute(peek).await?.status, Status::Denied);

    let result = expect_ok(&mut client, read("alice", "alice", "ssn")).await?;
    assert_eq!(result.value, ok_value("123-45-6789"));
    assert_eq!(result.version, 2);

    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;
    for node in 0..3 {
        let state = cluster.dump_state(tag(node)).await?;
        assert_eq!(state.get("alice").map(|r| r.version), Some(2));
    }
    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn revocation_applies_in_log_order() -> Result<(), GuidStoreError> {
    let dir = tempfile::tempdir()?;
    let mut cluster = launch_three(&dir, "acl_precheck = false").await?;

    let mut client = cluster.client()?;
    expect_ok(&mut client, create("alice")).await?;
    let email = write("alice", "alice", "email", "a@x.org");
    expect_ok(&mut client, email).await?;
    let bob = Accessor::Guid("bob".into());
    let add = Operation::AddAcl {
        field: "email".into(),
        access: AccessType::Write,
        accessor: bob.clone(),
    };
    expect_ok(&mut client, ClientRequest::new("alice", "alice", add)).await?;
    let email = write("alice", "bob", "email", "b@x.org");
    expect_ok(&mut client, email).await?;
    let remove = Operation::RemoveAcl {
        field: "email".into(),
        access: AccessType::Write,
        accessor: bob,
    };
    expect_ok(&mut client, ClientRequest::new("alice", "alice", remove))
        .await?;

    // the denied write still takes a slot once it reaches the log
    let leader = cluster.wait_for_leader(0, SETTLE).await?;
    let before = cluster.query_info(tag(leader)).await?.exec_bar;
    let email = write("alice", "bob", "email", "c@x.org");
    assert_eq!(client.execute(email).await?.status, Status::Denied);
    let after = cluster.query_info(tag(leader)).await?.exec_bar;
    assert!(after > before);

    let result = expect_ok(&mut client, read("alice", "alice", "email")).await?;
    assert_eq!(result.value, ok_value("b@x.org"));
    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn competing_leaders_settle() -> Result<(), GuidStoreError> {
    let dir = tempfile::tempdir()?;
    let mut cluster = launch_three(&dir, "disable_hb_timer = true").await?;

    // both campaign with round-1 ballots, neither hearing the other
    cluster.cut(1, 2)?;
    cluster.cut(2, 1)?;
    let (x, y) =
        tokio::join!(cluster.step_up(tag(1)), cluster.step_up(tag(2)));
    x?;
    y?;
    time::sleep(Duration::from_millis(100)).await;
    cluster.heal(1)?;
    cluster.heal(2)?;

    // the higher proposer ID breaks the tie
    assert_eq!(settled_leader(&cluster, &[0, 1, 2]).await?, 2);
    let loser = cluster.query_info(tag(1)).await?;
    assert!(!loser.is_leader);
    assert_eq!(loser.ballot_round, 1);

    let mut client = cluster.client()?;
    expect_ok(&mut client, create("carol")).await?;
    let city = write("carol", "carol", "city", "Lisbon");
    expect_ok(&mut client, city).await?;
    assert_eq!(client.cached_leader(0), Some(2));

    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;
    let expect = cluster.dump_state(tag(0)).await?;
    for node in 1..3 {
        assert_eq!(cluster.dump_state(tag(node)).await?, expect);
    }
    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn contested_slot_converges() -> Result<(), GuidStoreError> {
    let dir = tempfile::tempdir()?;
    let mut config =
        cluster_config(&dir, &[(0, vec![0, 1, 2])], "disable_hb_timer = true")?;
    config.client = Some(
        "attempt_timeout_ms = 3000\nmax_retries = 10\nbackoff_max_ms = 200"
            .parse()?,
    );
    let mut cluster = LocalCluster::launch(config).await?;
    cluster.step_up(tag(1)).await?;
    assert_eq!(settled_leader(&cluster, &[0, 1, 2]).await?, 1);

    let mut client_a = cluster.client()?;
    let mut client_b = cluster.client()?;
    expect_ok(&mut client_a, create("gina")).await?;
    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;

    // node 1 goes on leading a minority of one
    for peer in [0, 2] {
        cluster.cut(1, peer)?;
        cluster.cut(peer, 1)?;
    }
    let write_a = client_a.execute(write("gina", "gina", "city", "Oslo"));
    let rival = async {
        time::sleep(Duration::from_millis(100)).await;
        cluster.step_up(tag(2)).await?;
        wait_prepared(&cluster, 2).await?;

        // node 2 proposes for the same slot, again reaching only itself
        cluster.cut(2, 0)?;
        cluster.cut(0, 2)?;
        let write_b = client_b.execute(write("gina", "gina", "city", "Rome"));
        let heal = async {
            time::sleep(Duration::from_millis(150)).await;
            for node in 0..3 {
                cluster.heal(node)?;
            }
            Ok::<(), GuidStoreError>(())
        };
        let (result_b, healed) = tokio::join!(write_b, heal);
        healed?;
        result_b
    };
    let (result_a, result_b) = tokio::join!(write_a, rival);
    assert!(result_a?.is_ok());
    assert!(result_b?.is_ok());

    // the outdated leader stepped down for the higher ballot
    assert_eq!(settled_leader(&cluster, &[0, 1, 2]).await?, 2);
    let loser = cluster.query_info(tag(1)).await?;
    assert!(!loser.is_leader);
    assert!(loser.ballot_round >= 2);

    // every replica decided the same batch for every slot: Rome took the
    // contested slot and Oslo was retried after it
    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;
    let decided = cluster.decided_log(tag(0)).await?;
    for node in 1..3 {
        assert_eq!(cluster.decided_log(tag(node)).await?, decided);
    }
    let clients: Vec<Vec<_>> = decided
        .iter()
        .map(|(_, reqs)| reqs.iter().map(|(client, _)| *client).collect())
        .collect();
    assert_eq!(
        clients,
        vec![
            vec![client_a.id()],
            vec![client_b.id()],
            vec![client_a.id()]
        ]
    );
    let expect = cluster.dump_state(tag(0)).await?;
    for node in 1..3 {
        assert_eq!(cluster.dump_state(tag(node)).await?, expect);
    }

    let city = client_a.read_field("gina", "gina", "city").await?;
    assert_eq!(city, Bytes::from_static(b"Oslo"));
    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_read_is_stale() -> Result<(), GuidStoreError> {
    let dir = tempfile::tempdir()?;
    let mut cluster =
        launch_three(&dir, "disable_hb_timer = true\nstale_read_slots = 2")
            .await?;
    cluster.step_up(tag(0)).await?;
    settled_leader(&cluster, &[0, 1, 2]).await?;

    let mut writer = cluster.client()?;
    expect_ok(&mut writer, create("hana")).await?;
    expect_ok(&mut writer, write("hana", "hana", "mood", "calm")).await?;
    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;

    // node 2 misses every decision of the next writes
    cluster.cut(0, 2)?;
    cluster.cut(2, 0)?;
    for mood in ["busy", "tired", "happy", "sleepy"] {
        expect_ok(&mut writer, write("hana", "hana", "mood", mood)).await?;
    }

    // then hears the leader's commit point but cannot fetch what it missed
    cluster.mend(0, 2)?;

    // best-effort reads start at the member picked by client ID
    let mut reader = loop {
        let client = cluster.client()?;
        if client.id() % 3 == 2 {
            break client;
        }
    };
    let deadline = Instant::now() + SETTLE;
    let stale = loop {
        let peek = read("hana", "hana", "mood").best_effort();
        let result = reader.execute(peek).await?;
        if result.status == Status::Stale {
            break result;
        }
        if Instant::now() >= deadline {
            return Err(GuidStoreError::msg(format!(
                "lagging read never stale: {:?}",
                result
            )));
        }
        time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(stale.value, ok_value("calm"));
    assert_eq!(stale.version, 2);
    let lagging = cluster.query_info(tag(2)).await?;
    assert!(lagging.exec_bar < cluster.query_info(tag(0)).await?.exec_bar);

    // caught up again, the same replica answers fresh
    cluster.heal(2)?;
    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;
    let peek = read("hana", "hana", "mood").best_effort();
    let result = reader.execute(peek).await?;
    assert_eq!(result.status, Status::Ok);
    assert_eq!(result.value, ok_value("sleepy"));
    assert_eq!(result.version, 6);
    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unproven_requester_denied() -> Result<(), GuidStoreError> {
    let dir = tempfile::tempdir()?;
    let alice = Bytes::from_static(b"alice-token");
    let bob = Bytes::from_static(b"bob-token");
    let verifier = Arc::new(TokenVerifier::new());
    verifier.enroll("alice", alice.clone());
    verifier.enroll("bob", bob.clone());
    let config = cluster_config(&dir, &[(0, vec![0, 1, 2])], "")?;
    let mut cluster =
        LocalCluster::launch_with_verifier(config, verifier.clone()).await?;

    let mut client = cluster.client()?;
    expect_ok(&mut client, create("alice").with_proof(alice.clone())).await?;
    let motd = write("alice", "alice", "motd", "hello");
    expect_ok(&mut client, motd.with_proof(alice.clone())).await?;
    let grant = Operation::AddAcl {
        field: "motd".into(),
        access: AccessType::Read,
        accessor: Accessor::Guid("bob".into()),
    };
    let grant = ClientRequest::new("alice", "alice", grant);
    expect_ok(&mut client, grant.with_proof(alice)).await?;

    // a listed reader proving identity gets through
    let proven = read("alice", "bob", "motd").with_proof(bob.clone());
    let result = expect_ok(&mut client, proven).await?;
    assert_eq!(result.value, ok_value("hello"));

    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;
    let leader = cluster.wait_for_leader(0, SETTLE).await?;
    let before = cluster.query_info(tag(leader)).await?;

    // missing or mismatched proofs are refused before taking a slot
    let result = client.execute(read("alice", "bob", "motd")).await?;
    assert_eq!(result, CommandResult::status(Status::Denied, 0));
    let forged = write("alice", "alice", "motd", "pwned");
    let forged = forged.with_proof(bob.clone());
    assert_eq!(client.execute(forged).await?.status, Status::Denied);
    let after = cluster.query_info(tag(leader)).await?;
    assert_eq!(after.commit_bar, before.commit_bar);
    assert_eq!(after.exec_bar, before.exec_bar);

    verifier.revoke("bob");
    let revoked = read("alice", "bob", "motd").with_proof(bob);
    assert_eq!(client.execute(revoked).await?.status, Status::Denied);
    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn typed_reads_filter_and_surface() -> Result<(), GuidStoreError> {
    let dir = tempfile::tempdir()?;
    let mut cluster = launch_three(&dir, "").await?;
    let mut client = cluster.client()?;

    expect_ok(&mut client, create("ivan")).await?;
    for (field, value, version) in [
        ("contact.email", "i@x.org", 2),
        ("contact.phone", "555", 3),
        ("ssn", "987", 4),
    ] {
        let value = Bytes::copy_from_slice(value.as_bytes());
        let written = client.write_field("ivan", "ivan", field, value).await?;
        assert_eq!(written, version);
    }
    let grant = Operation::AddAcl {
        field: "contact.email".into(),
        access: AccessType::Read,
        accessor: Accessor::Guid("bob".into()),
    };
    expect_ok(&mut client, ClientRequest::new("ivan", "ivan", grant)).await?;

    assert_eq!(client.read_record("ivan", "ivan").await?.len(), 3);
    let visible = client.read_record("ivan", "bob").await?;
    assert_eq!(visible.keys().collect::<Vec<_>>(), ["contact.email"]);
    let contact = client.read_field("ivan", "bob", "contact").await?;
    let contact: std::collections::BTreeMap<String, Bytes> =
        rmp_serde::from_slice(&contact)?;
    assert_eq!(contact, visible);

    let denied = GuidStoreError::AclDenied {
        accessor: "bob".into(),
        field: "ssn".into(),
    };
    assert_eq!(client.read_field("ivan", "bob", "ssn").await, Err(denied));
    let pwned = Bytes::from_static(b"000");
    assert!(matches!(
        client.write_field("ivan", "bob", "ssn", pwned).await,
        Err(GuidStoreError::AclDenied { .. })
    ));
    assert_eq!(
        client.read_field("nobody", "bob", "motd").await,
        Err(GuidStoreError::RecordNotFound("nobody".into()))
    );
    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_replica_catches_up() -> Result<(), GuidStoreError> {
    let dir = tempfile::tempdir()?;
    let mut cluster = launch_three(&dir, "").await?;
    let mut client = cluster.client()?;
    let field = |i: usize| format!("f{}", i);

    expect_ok(&mut client, create("dave")).await?;
    for i in 0..5 {
        expect_ok(&mut client, write("dave", "dave", &field(i), "v")).await?;
    }
    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;
    assert!(cluster.take_snapshot(tag(2)).await? > 0);

    // some entries only in node 2's WAL, then some it never sees
    for i in 5..8 {
        expect_ok(&mut client, write("dave", "dave", &field(i), "v")).await?;
    }
    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;
    cluster.crash(2).await?;
    for i in 8..12 {
        expect_ok(&mut client, write("dave", "dave", &field(i), "v")).await?;
    }

    // the others compact past what node 2 has
    cluster.wait_caught_up(0, &[0, 1], SETTLE).await?;
    let compacted = cluster.take_snapshot(tag(0)).await?;
    assert_eq!(cluster.take_snapshot(tag(1)).await?, compacted);
    for i in 12..14 {
        expect_ok(&mut client, write("dave", "dave", &field(i), "v")).await?;
    }

    cluster.restart(2).await?;
    cluster.wait_caught_up(0, &[0, 1, 2], SETTLE).await?;
    let expect = cluster.dump_state(tag(0)).await?;
    assert_eq!(expect.get("dave").map(|r| r.fields.len()), Some(14));
    for node in 1..3 {
        assert_eq!(cluster.dump_state(tag(node)).await?, expect);
    }
    let info = cluster.query_info(tag(2)).await?;
    assert!(info.start_slot >= compacted);
    cluster.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reconfiguration_replaces_member() -> Result<(), GuidStoreError> {
    let dir = tempfile::tempdir()?;
    let mut cluster = launch_three(&dir, "").await?;
    cluster.add_replica(0, 3).await?;
    assert!(cluster.query_info(tag(3)).await?.awaiting_start);

    let mut client = cluster.client()?;
    expect_ok(&mut client, create("erin")).await?;
    expect_ok(&mut client, write("erin", "erin", "email", "e@x.org")).await?;

    let epoch = cluster.reconfigure(0, vec![0, 1, 3]).await?;
    assert_eq!(epoch, 2);
    assert_eq!(
        cluster.routing().read()?.members(0),
        Some(&[0, 1, 3][..])
    );

    expect_ok(&mut client, write("erin", "erin", "phone", "555")).await?;
    expect_ok(&mut client, create("frank")).await?;

    cluster.wait_caught_up(0, &[0, 1, 3], SETTLE).await?;
    let expect = cluster.dump_state(tag(0)).await?;
    assert_eq!(expect.epoch(), 2);
    assert_eq!(expect.members(), &[0, 1, 3]);
    assert_eq!(expect.get("erin").map(|r| r.fields.len()), Some(2));
    assert!(expect.get("frank").is_some());
    for node in [1, 3] {
        assert_eq!(cluster.dump_state(tag(node)).await?, expect);
    }

    // the joiner never held a slot of the old epoch
    let info = cluster.query_info(tag(3)).await?;
    assert_eq!(info.epoch, 2);
    assert!(info.start_slot > 0);

    // the removed member retires
    let deadline = Instant::now() + SETTLE;
    while !cluster.query_info(tag(2)).await?.retired {
        if Instant::now() >= deadline {
            return Err(GuidStoreError::msg("replica 2 never retired"));
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    let stale = cluster.dump_state(tag(2)).await?;
    assert!(stale.get("frank").is_none());
    assert!(stale.next_slot() <= expect.next_slot());

    cluster.shutdown().await
}
