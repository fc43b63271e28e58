//! Concurrency properties of the ledger, the value store and rule cycles.

mod common;

use accord_governance::events::ChangeKind;
use accord_governance::services::{CreateAssignmentInput, CreateRuleInput};
use accord_governance::{Actor, ErrorKind, GovernanceConfig, TriggerType};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::TestContext;

const TASKS: usize = 16;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_leave_one_active_assignment() {
    let ctx = TestContext::new().await;
    let emp = ctx.employee("U1", "IT").await;
    let input = CreateAssignmentInput {
        user_id: emp.id,
        role_id: ctx.admin.id,
        target_system_id: ctx.system,
        ..Default::default()
    };

    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let assignments = ctx.services.assignments.clone();
        let input = input.clone();
        handles.push(tokio::spawn(async move {
            assignments.create(input, Actor::System, None).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(e) => assert_eq!(e.kind(), ErrorKind::Conflict),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(ctx.active(&emp, &ctx.admin).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reactivation_keeps_invariant() {
    let ctx = TestContext::new().await;
    let emp = ctx.employee("U1", "IT").await;

    // Two suspended grants of the same triple, disjoint only by suspension.
    let mut suspended = Vec::new();
    for _ in 0..2 {
        let a = ctx
            .services
            .assignments
            .create(
                CreateAssignmentInput {
                    user_id: emp.id,
                    role_id: ctx.admin.id,
                    target_system_id: ctx.system,
                    ..Default::default()
                },
                Actor::System,
                None,
            )
            .await
            .unwrap();
        let a = ctx
            .services
            .assignments
            .set_active(a.id, a.meta.version, false, Actor::System, None)
            .await
            .unwrap();
        suspended.push(a);
    }

    let handles: Vec<_> = suspended
        .into_iter()
        .map(|a| {
            let assignments = ctx.services.assignments.clone();
            tokio::spawn(async move {
                assignments
                    .set_active(a.id, a.meta.version, true, Actor::System, None)
                    .await
            })
        })
        .collect();
    let mut reactivated = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            reactivated += 1;
        }
    }
    assert_eq!(reactivated, 1);
    assert_eq!(ctx.active(&emp, &ctx.admin).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_upserts_keep_one_open_row() {
    let ctx = TestContext::new().await;
    let emp = ctx.employee("EMP100", "IT").await;

    let mut handles = Vec::new();
    for i in 0..TASKS {
        let values = ctx.services.property_values.clone();
        let cell = (emp.id, ctx.department.id);
        handles.push(tokio::spawn(async move {
            values
                .upsert_value(cell.0, cell.1, &json!(format!("Dept-{i}")), Actor::System, None)
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(
        ctx.stores
            .property_values
            .open_count((emp.id, ctx.department.id))
            .await,
        1
    );
    let history = ctx
        .services
        .property_values
        .value_history(emp.id, ctx.department.id)
        .await
        .unwrap();
    assert_eq!(history.len(), TASKS + 1);
    for pair in history.windows(2) {
        assert_eq!(pair[0].effective_to, Some(pair[1].effective_from));
    }
    assert!(history.last().unwrap().effective_to.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_cycles_grant_once() {
    let ctx = TestContext::new().await;
    let rule = ctx
        .rule(
            CreateRuleInput::new("IT staff", TriggerType::NewEntity, ctx.assign(&ctx.it_staff))
                .when("Department = 'IT'"),
        )
        .await;
    let emp = ctx.employee("EMP100", "IT").await;
    let event = ctx
        .drain_kind(|k| matches!(k, ChangeKind::EntityCreated))
        .await
        .remove(0);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let engine = ctx.services.engine.clone();
        let event = event.clone();
        handles.push(tokio::spawn(async move {
            engine.process_event(&event).await
        }));
    }
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        assert!(report.outcome(rule.id).is_some());
    }

    assert_eq!(ctx.active(&emp, &ctx.it_staff).await, 1);
    let stamped = ctx.services.rules.require(rule.id).await.unwrap();
    assert_eq!(stamped.execution_count, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scheduled_and_manual_runs_overlap() {
    let ctx = TestContext::with_config(GovernanceConfig {
        max_conflict_retries: 16,
        ..Default::default()
    })
    .await;
    let scheduled = ctx
        .rule(
            CreateRuleInput::new("Nightly", TriggerType::Schedule, ctx.assign(&ctx.admin))
                .when("Department = 'IT'"),
        )
        .await;
    let emp = ctx.employee("EMP100", "IT").await;

    let cancel = CancellationToken::new();
    let rule_ids = [scheduled.id];
    let (tick, manual) = tokio::join!(
        ctx.services.engine.run_scheduled(&cancel),
        ctx.services
            .engine
            .execute_manual(&rule_ids, Some(emp.id), Actor::System, &cancel),
    );
    tick.unwrap();
    manual.unwrap();

    assert_eq!(ctx.active(&emp, &ctx.admin).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_retirement_races_grants_and_writes() {
    let ctx = TestContext::new().await;

    for round in 0..TASKS {
        let emp = ctx.employee(&format!("EMP{round}"), "IT").await;
        let (id, version) = (emp.id, emp.meta.version);

        let retire = {
            let instances = ctx.services.entity_instances.clone();
            tokio::spawn(async move {
                instances
                    .retire_instance(id, version, Actor::System, None)
                    .await
            })
        };
        let grant = {
            let assignments = ctx.services.assignments.clone();
            let input = CreateAssignmentInput {
                user_id: id,
                role_id: ctx.admin.id,
                target_system_id: ctx.system,
                ..Default::default()
            };
            tokio::spawn(async move { assignments.create(input, Actor::System, None).await })
        };
        let write = {
            let values = ctx.services.property_values.clone();
            let property = ctx.department.id;
            tokio::spawn(async move {
                values
                    .upsert_value(id, property, &json!("Finance"), Actor::System, None)
                    .await
            })
        };

        let retired = retire.await.unwrap();
        let granted = grant.await.unwrap();
        let written = write.await.unwrap();

        match retired {
            Ok(_) => {
                assert_eq!(granted.unwrap_err().kind(), ErrorKind::NotFound);
                assert_eq!(ctx.active(&emp, &ctx.admin).await, 0);
                assert!(ctx
                    .services
                    .property_values
                    .current_values(id)
                    .await
                    .unwrap()
                    .is_empty());
                if let Err(e) = written {
                    assert_eq!(e.kind(), ErrorKind::NotFound);
                }
            }
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::DependencyConflict);
                granted.unwrap();
                written.unwrap();
                assert_eq!(ctx.active(&emp, &ctx.admin).await, 1);
            }
        }
    }
}
