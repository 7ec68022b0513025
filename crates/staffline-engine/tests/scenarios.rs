use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;

use staffline_core::config::AppConfig;
use staffline_core::error::StafflineError;
use staffline_core::event::WorkflowEvent;
use staffline_core::traits::Clock;
use staffline_core::types::*;
use staffline_engine::{aggregate, DispatchOutcome, Engine, InstanceDetail};
use staffline_store::ExceptionFilter;
use staffline_test_utils::*;

fn engine(config: AppConfig, provider: Option<(IntegrationKind, Arc<MockProvider>)>) -> (Engine, Arc<FixedClock>) {
    let clock = Arc::new(FixedClock::default_start());
    let providers = match provider {
        Some((kind, p)) => providers_with(kind, p),
        None => Default::default(),
    };
    let engine = Engine::in_memory(config, providers, clock.clone()).unwrap();
    (engine, clock)
}

fn publish(engine: &Engine, draft: TemplateDraft) -> TemplateId {
    let admin = Actor::from_string("admin");
    let t = engine.templates().create(draft, &admin).unwrap();
    engine.templates().publish(&t.id).unwrap();
    t.id
}

fn step_id(detail: &InstanceDetail, key: &str) -> StepId {
    detail.step_by_blueprint(key).unwrap().id.clone()
}

fn exceptions_for(engine: &Engine, instance: &InstanceId) -> Vec<WorkflowException> {
    engine
        .exceptions()
        .list(&ExceptionFilter {
            instance_id: Some(instance.clone()),
            ..Default::default()
        })
        .unwrap()
}

fn assert_consistent(detail: &InstanceDetail) {
    assert_eq!(detail.instance.percentage, aggregate(&detail.steps).percentage);
}

#[tokio::test]
async fn scenario_a_dependency_not_met_is_atomic_noop() {
    let (engine, _) = engine(test_config(), None);
    let tpl = publish(&engine, two_step_draft());
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-100"), &Actor::from_string("hr"))
        .unwrap();
    let s1 = step_id(&detail, "s1");
    let s2 = step_id(&detail, "s2");

    let before = engine.instances().get(&detail.instance.id).unwrap();
    let err = engine
        .instances()
        .transition_step(&detail.instance.id, &s2, StepStatus::InProgress, &Actor::from_string("it"))
        .await
        .unwrap_err();

    match &err {
        StafflineError::DependencyNotMet { step, unmet, missing } => {
            assert_eq!(step, &s2);
            assert_eq!(unmet, &vec![s1.clone()]);
            assert!(missing.is_empty());
        }
        other => panic!("expected DependencyNotMet, got {:?}", other),
    }
    assert!(err.is_precondition());

    let after = engine.instances().get(&detail.instance.id).unwrap();
    assert_eq!(after.instance, before.instance);
    assert_eq!(after.steps, before.steps);
    assert_eq!(after.instance.percentage, 0);
    assert_eq!(after.instance.status, InstanceStatus::NotStarted);
}

#[tokio::test]
async fn scenario_b_progress_follows_steps() {
    let (engine, _) = engine(test_config(), None);
    let mut events = engine.event_bus().subscribe();
    let tpl = publish(&engine, two_step_draft());
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-101"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let s1 = step_id(&detail, "s1");
    let s2 = step_id(&detail, "s2");
    let it = Actor::from_string("it");

    assert_eq!(detail.instance.stage, "paperwork");
    assert_eq!(detail.step(&s2).unwrap().assignee.as_deref(), Some("it"));
    assert_eq!(detail.step(&s1).unwrap().due_date, NaiveDate::from_ymd_opt(2026, 11, 3));
    assert_eq!(detail.instance.expected_completion, NaiveDate::from_ymd_opt(2026, 11, 7));

    let started = engine
        .instances()
        .transition_step(&id, &s1, StepStatus::InProgress, &it)
        .await
        .unwrap();
    assert_eq!(started.instance.status, InstanceStatus::InProgress);
    assert_eq!(started.instance.percentage, 0);

    let done = engine
        .instances()
        .transition_step(&id, &s1, StepStatus::Completed, &it)
        .await
        .unwrap();
    assert_eq!(done.instance.percentage, 50);
    assert_eq!(done.instance.status, InstanceStatus::InProgress);
    assert_eq!(done.instance.stage, "equipment");
    assert_eq!(done.step.completed_by, Some(it.clone()));

    engine
        .instances()
        .transition_step(&id, &s2, StepStatus::InProgress, &it)
        .await
        .unwrap();
    let finished = engine
        .instances()
        .transition_step(&id, &s2, StepStatus::Completed, &it)
        .await
        .unwrap();
    assert_eq!(finished.instance.percentage, 100);
    assert_eq!(finished.instance.status, InstanceStatus::Completed);
    assert_eq!(finished.instance.stage, "complete");
    assert!(finished.instance.actual_completion.is_some());
    assert_consistent(&engine.instances().get(&id).unwrap());

    let mut transitions = 0;
    let mut completed_seen = false;
    while let Ok(event) = events.try_recv() {
        match event {
            WorkflowEvent::StepTransitioned { .. } => transitions += 1,
            WorkflowEvent::InstanceStatusChanged {
                status: InstanceStatus::Completed,
                percentage: 100,
                ..
            } => completed_seen = true,
            _ => {}
        }
    }
    assert_eq!(transitions, 4);
    assert!(completed_seen);

    // A finished instance accepts no more transitions
    let err = engine
        .instances()
        .transition_step(&id, &s2, StepStatus::Skipped, &it)
        .await
        .unwrap_err();
    assert!(matches!(err, StafflineError::InstanceTerminal { .. }));
}

#[tokio::test]
async fn scenario_c_exhaustion_opens_one_critical_exception() {
    let provider = Arc::new(MockProvider::failing("checkr", 3));
    let (engine, clock) = engine(
        test_config(),
        Some((IntegrationKind::BackgroundCheck, provider.clone())),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::BackgroundCheck, 3, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-102"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let check = step_id(&detail, "check");

    let started = engine
        .instances()
        .transition_step(&id, &check, StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap();
    let attempt = started.attempt.unwrap();
    assert_eq!(attempt.attempt_count, 1);
    assert_eq!(attempt.status, AttemptStatus::Pending);
    assert!(attempt.next_retry_at.is_some());
    assert_eq!(started.step.status, StepStatus::InProgress);

    // Not due yet: nothing is sent
    let early = engine.dispatcher().dispatch(&attempt.id).await.unwrap();
    assert!(matches!(early.outcome, DispatchOutcome::Skipped { .. }));
    assert_eq!(provider.calls(), 1);

    clock.advance(chrono::Duration::hours(2));
    let second = engine.dispatcher().dispatch(&attempt.id).await.unwrap();
    assert!(matches!(second.outcome, DispatchOutcome::RetryScheduled { .. }));
    assert_eq!(second.attempt.attempt_count, 2);

    clock.advance(chrono::Duration::hours(2));
    let third = engine.dispatcher().dispatch(&attempt.id).await.unwrap();
    assert!(matches!(
        third.outcome,
        DispatchOutcome::Exhausted { exception_id: Some(_) }
    ));
    assert_eq!(third.attempt.attempt_count, 3);
    assert_eq!(third.attempt.status, AttemptStatus::Failed);

    let after = engine.instances().get(&id).unwrap();
    assert_eq!(after.step(&check).unwrap().status, StepStatus::Failed);
    assert_eq!(after.step(&check).unwrap().completed_by, Some(Actor::system()));
    assert_consistent(&after);

    let exceptions = exceptions_for(&engine, &id);
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].kind, ExceptionKind::IntegrationFailure);
    assert_eq!(exceptions[0].severity, Severity::Critical);
    assert_eq!(exceptions[0].step_id.as_ref(), Some(&check));
    assert_eq!(exceptions[0].status, ResolutionStatus::Open);

    // Re-dispatch after exhaustion changes nothing
    clock.advance(chrono::Duration::hours(2));
    let again = engine.dispatcher().dispatch(&attempt.id).await.unwrap();
    assert!(matches!(again.outcome, DispatchOutcome::Skipped { .. }));
    assert_eq!(again.attempt.attempt_count, 3);
    assert_eq!(provider.calls(), 3);
    assert_eq!(exceptions_for(&engine, &id).len(), 1);
    let report = engine.sweeper().sweep_once().await.unwrap();
    assert_eq!(report.retried, 0);
    assert_eq!(exceptions_for(&engine, &id).len(), 1);
}

#[tokio::test]
async fn optional_step_exhaustion_is_medium_severity() {
    let provider = Arc::new(MockProvider::failing("docs", 1));
    let (engine, _) = engine(
        test_config(),
        Some((IntegrationKind::DocumentSearch, provider)),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::DocumentSearch, 1, false));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-103"), &Actor::from_string("hr"))
        .unwrap();
    let check = step_id(&detail, "check");

    let result = engine
        .instances()
        .transition_step(&detail.instance.id, &check, StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap();
    assert_eq!(result.step.status, StepStatus::Failed);

    let exceptions = exceptions_for(&engine, &detail.instance.id);
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].severity, Severity::Medium);
}

#[tokio::test]
async fn scenario_d_retry_after_cancel_is_noop() {
    let provider = Arc::new(MockProvider::failing("docusign", 1));
    let (engine, clock) = engine(
        test_config(),
        Some((IntegrationKind::ESignature, provider.clone())),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::ESignature, 3, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-104"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let check = step_id(&detail, "check");

    let started = engine
        .instances()
        .transition_step(&id, &check, StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap();
    let attempt = started.attempt.unwrap();
    assert_eq!(attempt.attempt_count, 1);

    let cancelled = engine
        .instances()
        .cancel(&id, &Actor::from_string("hr"), "offer withdrawn")
        .unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("offer withdrawn"));

    clock.advance(chrono::Duration::hours(3));
    let fired = engine.dispatcher().dispatch(&attempt.id).await.unwrap();
    assert!(matches!(fired.outcome, DispatchOutcome::Skipped { .. }));
    assert_eq!(fired.attempt.attempt_count, 1);

    let report = engine.sweeper().sweep_once().await.unwrap();
    assert_eq!(report.retried, 0);
    assert_eq!(provider.calls(), 1);
    assert!(exceptions_for(&engine, &id).is_empty());

    // Cancelling again is a no-op
    let again = engine
        .instances()
        .cancel(&id, &Actor::from_string("someone-else"), "dup")
        .unwrap();
    assert_eq!(again.cancelled_by, Some(Actor::from_string("hr")));

    let err = engine
        .instances()
        .transition_step(&id, &check, StepStatus::Completed, &Actor::from_string("hr"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StafflineError::InstanceTerminal {
            status: InstanceStatus::Cancelled,
            ..
        }
    ));
}

#[tokio::test]
async fn successful_integration_completes_step_as_system() {
    let provider = Arc::new(MockProvider::new("docusign"));
    provider.push_success("env-42");
    let (engine, _) = engine(
        test_config(),
        Some((IntegrationKind::ESignature, provider.clone())),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::ESignature, 3, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-105"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let check = step_id(&detail, "check");
    let welcome = step_id(&detail, "welcome");
    assert_eq!(detail.step(&welcome).unwrap().assignee.as_deref(), Some("jamie"));

    let result = engine
        .instances()
        .transition_step(&id, &check, StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap();
    assert_eq!(result.step.status, StepStatus::Completed);
    assert_eq!(result.step.completed_by, Some(Actor::system()));
    assert_eq!(result.instance.percentage, 50);

    let attempt = result.attempt.unwrap();
    assert_eq!(attempt.status, AttemptStatus::Completed);
    assert_eq!(attempt.correlation_id.as_deref(), Some("env-42"));
    assert_eq!(attempt.request_payload.as_ref().unwrap()["employee_id"], "emp-105");

    let requests = provider.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].attempt, 1);
    assert_eq!(requests[0].kind, IntegrationKind::ESignature);

    // The dependent step is now eligible
    engine
        .instances()
        .transition_step(&id, &welcome, StepStatus::InProgress, &Actor::from_string("jamie"))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn provider_timeout_counts_as_failure() {
    let provider = Arc::new(MockProvider::new("slow").with_delay(Duration::from_secs(10), 1));
    let (engine, _) = engine(
        test_config(),
        Some((IntegrationKind::BackgroundCheck, provider)),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::BackgroundCheck, 3, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-106"), &Actor::from_string("hr"))
        .unwrap();
    let check = step_id(&detail, "check");

    let result = engine
        .instances()
        .transition_step(&detail.instance.id, &check, StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap();
    let attempt = result.attempt.unwrap();
    assert_eq!(attempt.status, AttemptStatus::Pending);
    assert!(attempt.error_message.unwrap().contains("timeout"));
    assert_eq!(result.step.status, StepStatus::InProgress);
}

#[tokio::test]
async fn missing_provider_exhausts_into_exception() {
    let (engine, _) = engine(test_config(), None);
    let tpl = publish(&engine, integration_draft(IntegrationKind::BackgroundCheck, 1, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-107"), &Actor::from_string("hr"))
        .unwrap();
    let check = step_id(&detail, "check");

    let result = engine
        .instances()
        .transition_step(&detail.instance.id, &check, StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap();
    assert_eq!(result.step.status, StepStatus::Failed);
    let attempt = result.attempt.unwrap();
    assert!(attempt.error_message.unwrap().contains("No integration provider"));
    assert_eq!(exceptions_for(&engine, &detail.instance.id).len(), 1);
}

#[tokio::test]
async fn manual_retry_reopens_failed_step_and_keeps_exception() {
    let provider = Arc::new(MockProvider::failing("checkr", 1));
    let (engine, _) = engine(
        test_config(),
        Some((IntegrationKind::BackgroundCheck, provider.clone())),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::BackgroundCheck, 1, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-108"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let check = step_id(&detail, "check");
    let hr = Actor::from_string("hr");

    let failed = engine
        .instances()
        .transition_step(&id, &check, StepStatus::InProgress, &hr)
        .await
        .unwrap();
    assert_eq!(failed.step.status, StepStatus::Failed);

    // Only failed integration steps can be retried
    let welcome = step_id(&detail, "welcome");
    assert!(matches!(
        engine.instances().retry_step(&id, &welcome, &hr).await,
        Err(StafflineError::IllegalTransition { .. })
    ));

    let retried = engine.instances().retry_step(&id, &check, &hr).await.unwrap();
    assert_eq!(retried.step.status, StepStatus::Completed);
    assert_eq!(provider.calls(), 2);
    let attempts = engine.instances().attempts(&id, &check).unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].status, AttemptStatus::Completed);

    let exceptions = exceptions_for(&engine, &id);
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].status, ResolutionStatus::Open);
}

#[tokio::test]
async fn illegal_transition_names_statuses_and_changes_nothing() {
    let (engine, _) = engine(test_config(), None);
    let tpl = publish(&engine, two_step_draft());
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-109"), &Actor::from_string("hr"))
        .unwrap();
    let s1 = step_id(&detail, "s1");
    let before = engine.instances().get(&detail.instance.id).unwrap();

    let err = engine
        .instances()
        .transition_step(&detail.instance.id, &s1, StepStatus::Completed, &Actor::from_string("hr"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StafflineError::IllegalTransition {
            from: StepStatus::Pending,
            to: StepStatus::Completed,
            ..
        }
    ));
    let after = engine.instances().get(&detail.instance.id).unwrap();
    assert_eq!(after.steps, before.steps);
    assert_eq!(after.instance, before.instance);

    let missing = engine
        .instances()
        .transition_step(&detail.instance.id, &StepId::from_string("nope"), StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap_err();
    assert!(matches!(missing, StafflineError::StepNotFound { .. }));
}

#[tokio::test]
async fn skipping_removes_step_from_progress() {
    let (engine, _) = engine(test_config(), None);
    let tpl = publish(&engine, two_step_draft());
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-110"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let s1 = step_id(&detail, "s1");
    let s2 = step_id(&detail, "s2");
    let hr = Actor::from_string("hr");

    engine.instances().transition_step(&id, &s1, StepStatus::InProgress, &hr).await.unwrap();
    engine.instances().transition_step(&id, &s1, StepStatus::Completed, &hr).await.unwrap();
    let skipped = engine
        .instances()
        .transition_step(&id, &s2, StepStatus::Skipped, &hr)
        .await
        .unwrap();
    assert_eq!(skipped.instance.percentage, 100);
    assert_eq!(skipped.instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn blocked_step_returns_to_in_progress() {
    let (engine, _) = engine(test_config(), None);
    let tpl = publish(&engine, two_step_draft());
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-111"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let s1 = step_id(&detail, "s1");
    let hr = Actor::from_string("hr");

    engine.instances().transition_step(&id, &s1, StepStatus::InProgress, &hr).await.unwrap();
    let blocked = engine
        .instances()
        .transition_step(&id, &s1, StepStatus::Blocked, &hr)
        .await
        .unwrap();
    assert_eq!(blocked.instance.status, InstanceStatus::InProgress);
    let resumed = engine
        .instances()
        .transition_step(&id, &s1, StepStatus::InProgress, &hr)
        .await
        .unwrap();
    assert_eq!(resumed.step.status, StepStatus::InProgress);
}

#[tokio::test]
async fn instantiate_rejects_missing_and_unpublished_templates() {
    let (engine, _) = engine(test_config(), None);
    let err = engine
        .instances()
        .instantiate(from_template(&TemplateId::from_string("ghost"), "emp-1"), &Actor::system())
        .unwrap_err();
    assert!(matches!(err, StafflineError::TemplateNotFound(_)));

    let draft = engine
        .templates()
        .create(two_step_draft(), &Actor::system())
        .unwrap();
    let err = engine
        .instances()
        .instantiate(from_template(&draft.id, "emp-1"), &Actor::system())
        .unwrap_err();
    assert!(matches!(
        err,
        StafflineError::TemplateNotInstantiable {
            state: TemplateState::Draft,
            ..
        }
    ));
}

#[tokio::test]
async fn freeform_instance_with_explicit_steps() {
    let (engine, _) = engine(test_config(), None);
    let req = InstantiateRequest {
        employee_id: EmployeeId::from_string("emp-200"),
        source: StepSource::Steps {
            lifecycle: LifecycleType::Leave,
            steps: vec![
                StepBlueprint::new("request", "Submit leave request").with_due_offset(0),
                StepBlueprint::new("approve", "Manager approval")
                    .with_kind(StepKind::Approval)
                    .with_assignee_role("manager")
                    .with_prerequisites(&["request"])
                    .with_due_offset(2),
            ],
        },
        start_date: NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(),
        expected_completion: None,
        assignments: BTreeMap::from([("manager".to_string(), "morgan".to_string())]),
    };
    let detail = engine.instances().instantiate(req, &Actor::from_string("hr")).unwrap();
    assert!(detail.instance.template_id.is_none());
    assert_eq!(detail.instance.lifecycle, LifecycleType::Leave);
    assert_eq!(detail.instance.expected_completion, NaiveDate::from_ymd_opt(2026, 12, 3));
    let approve = detail.step_by_blueprint("approve").unwrap();
    assert_eq!(approve.assignee.as_deref(), Some("morgan"));
    assert_eq!(approve.prerequisites, vec![step_id(&detail, "request")]);

    let cyclic = InstantiateRequest {
        employee_id: EmployeeId::from_string("emp-201"),
        source: StepSource::Steps {
            lifecycle: LifecycleType::Other,
            steps: vec![
                StepBlueprint::new("a", "A").with_prerequisites(&["b"]),
                StepBlueprint::new("b", "B").with_prerequisites(&["a"]),
            ],
        },
        start_date: NaiveDate::from_ymd_opt(2026, 12, 1).unwrap(),
        expected_completion: None,
        assignments: BTreeMap::new(),
    };
    assert!(matches!(
        engine.instances().instantiate(cyclic, &Actor::system()),
        Err(StafflineError::InvalidDefinition(_))
    ));
    assert!(engine
        .instances()
        .for_employee(&EmployeeId::from_string("emp-201"))
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn exception_resolution_is_one_way() {
    let (engine, _) = engine(test_config(), None);
    let tpl = publish(&engine, two_step_draft());
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-112"), &Actor::from_string("hr"))
        .unwrap();
    let opened = engine
        .exceptions()
        .open(
            NewException {
                instance_id: detail.instance.id.clone(),
                step_id: Some(step_id(&detail, "s1")),
                kind: ExceptionKind::ManualIntervention,
                severity: Severity::Low,
                title: "I-9 documents missing".into(),
                description: String::new(),
                assignee: Some("hr-ops".into()),
            },
            &Actor::from_string("manager"),
        )
        .unwrap();

    let resolved = engine
        .exceptions()
        .resolve(&opened.id, &Actor::from_string("hr-ops"), Some("received".into()))
        .unwrap();
    let err = engine
        .exceptions()
        .resolve(&opened.id, &Actor::from_string("hr-ops"), Some("again".into()))
        .unwrap_err();
    assert!(matches!(err, StafflineError::AlreadyResolved { .. }));
    assert_eq!(engine.exceptions().get(&opened.id).unwrap(), resolved);
}

#[tokio::test]
async fn sweeper_retries_due_attempts() {
    let provider = Arc::new(MockProvider::failing("checkr", 1));
    let (engine, clock) = engine(
        test_config(),
        Some((IntegrationKind::BackgroundCheck, provider.clone())),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::BackgroundCheck, 3, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-113"), &Actor::from_string("hr"))
        .unwrap();
    let check = step_id(&detail, "check");
    engine
        .instances()
        .transition_step(&detail.instance.id, &check, StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap();

    let report = engine.sweeper().sweep_once().await.unwrap();
    assert_eq!(report.retried, 0);

    clock.advance(chrono::Duration::hours(1));
    let report = engine.sweeper().sweep_once().await.unwrap();
    assert_eq!(report.retried, 1);
    assert_eq!(provider.calls(), 2);

    let after = engine.instances().get(&detail.instance.id).unwrap();
    assert_eq!(after.step(&check).unwrap().status, StepStatus::Completed);
    assert_eq!(after.instance.percentage, 50);
}

#[tokio::test]
async fn sweeper_reclaims_stale_attempts() {
    let provider = Arc::new(MockProvider::failing("checkr", 1));
    let (engine, clock) = engine(
        test_config(),
        Some((IntegrationKind::BackgroundCheck, provider)),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::BackgroundCheck, 2, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-114"), &Actor::from_string("hr"))
        .unwrap();
    let check = step_id(&detail, "check");
    let attempt = engine
        .instances()
        .transition_step(&detail.instance.id, &check, StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap()
        .attempt
        .unwrap();

    // Simulate a crash mid-call on the second attempt
    let crashed_at = clock.now();
    engine
        .store()
        .write(|tx| {
            let mut a = tx.get_attempt(&attempt.id)?.unwrap();
            a.status = AttemptStatus::InProgress;
            a.attempt_count = 2;
            a.last_attempt_at = Some(crashed_at);
            a.next_retry_at = None;
            tx.update_attempt(&a)
        })
        .unwrap();

    clock.advance(chrono::Duration::hours(1));
    let report = engine.sweeper().sweep_once().await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(report.exceptions_opened, 1);

    let after = engine.instances().get(&detail.instance.id).unwrap();
    assert_eq!(after.step(&check).unwrap().status, StepStatus::Failed);
}

#[tokio::test]
async fn sweeper_flags_overdue_once() {
    let (engine, clock) = engine(test_config(), None);
    let tpl = publish(&engine, two_step_draft());
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-115"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();

    // Expected completion is 2026-11-07
    clock.advance(chrono::Duration::days(8));
    let report = engine.sweeper().sweep_once().await.unwrap();
    assert_eq!(report.overdue_instances, 1);
    assert_eq!(report.exceptions_opened, 3);

    let after = engine.instances().get(&id).unwrap();
    assert_eq!(after.instance.status, InstanceStatus::Overdue);
    let timeouts = exceptions_for(&engine, &id);
    assert!(timeouts.iter().all(|e| e.kind == ExceptionKind::Timeout));
    assert_eq!(timeouts.iter().filter(|e| e.step_id.is_none()).count(), 1);

    let again = engine.sweeper().sweep_once().await.unwrap();
    assert_eq!(again.exceptions_opened, 0);
    assert_eq!(exceptions_for(&engine, &id).len(), 3);

    // Finishing the work clears the flag
    let hr = Actor::from_string("hr");
    let s1 = step_id(&detail, "s1");
    let s2 = step_id(&detail, "s2");
    engine.instances().transition_step(&id, &s1, StepStatus::InProgress, &hr).await.unwrap();
    let half = engine
        .instances()
        .transition_step(&id, &s1, StepStatus::Completed, &hr)
        .await
        .unwrap();
    assert_eq!(half.instance.status, InstanceStatus::Overdue);
    assert_eq!(half.instance.percentage, 50);
    engine.instances().transition_step(&id, &s2, StepStatus::InProgress, &hr).await.unwrap();
    let done = engine
        .instances()
        .transition_step(&id, &s2, StepStatus::Completed, &hr)
        .await
        .unwrap();
    assert_eq!(done.instance.status, InstanceStatus::Completed);
}

#[tokio::test]
async fn background_dispatch_completes_later() {
    let provider = Arc::new(MockProvider::new("docusign"));
    let mut config = test_config();
    config.engine.dispatch_mode = staffline_core::config::DispatchMode::Background;
    let (engine, _) = engine(config, Some((IntegrationKind::ESignature, provider.clone())));
    let tpl = publish(&engine, integration_draft(IntegrationKind::ESignature, 3, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-116"), &Actor::from_string("hr"))
        .unwrap();
    let check = step_id(&detail, "check");

    let result = engine
        .instances()
        .transition_step(&detail.instance.id, &check, StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap();
    assert_eq!(result.step.status, StepStatus::InProgress);
    assert_eq!(result.attempt.unwrap().attempt_count, 0);

    let mut completed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let now = engine.instances().get(&detail.instance.id).unwrap();
        if now.step(&check).unwrap().status == StepStatus::Completed {
            completed = true;
            break;
        }
    }
    assert!(completed);
    assert_eq!(provider.calls(), 1);
}

/// Wait until the spawned dispatch has claimed the step's attempt.
async fn wait_for_in_flight(engine: &Engine, instance: &InstanceId, step: &StepId) -> IntegrationAttempt {
    for _ in 0..100 {
        let attempts = engine.instances().attempts(instance, step).unwrap();
        if let Some(a) = attempts.iter().find(|a| a.status == AttemptStatus::InProgress) {
            return a.clone();
        }
        tokio::task::yield_now().await;
    }
    panic!("attempt never went in flight");
}

#[tokio::test]
async fn skipping_integration_step_closes_pending_retry() {
    let provider = Arc::new(MockProvider::failing("checkr", 1));
    let (engine, clock) = engine(
        test_config(),
        Some((IntegrationKind::BackgroundCheck, provider.clone())),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::BackgroundCheck, 3, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-117"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let check = step_id(&detail, "check");
    let hr = Actor::from_string("hr");

    let started = engine
        .instances()
        .transition_step(&id, &check, StepStatus::InProgress, &hr)
        .await
        .unwrap();
    let pending = started.attempt.unwrap();
    assert_eq!(pending.status, AttemptStatus::Pending);
    assert!(pending.next_retry_at.is_some());

    engine
        .instances()
        .transition_step(&id, &check, StepStatus::Skipped, &hr)
        .await
        .unwrap();

    let attempts = engine.instances().attempts(&id, &check).unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, AttemptStatus::Failed);
    assert_eq!(attempts[0].attempt_count, 1);
    assert!(attempts[0].next_retry_at.is_none());

    for _ in 0..3 {
        clock.advance(chrono::Duration::hours(2));
        let report = engine.sweeper().sweep_once().await.unwrap();
        assert_eq!(report.retried, 0);
    }
    assert_eq!(provider.calls(), 1);
    let due = engine
        .store()
        .read(|tx| tx.due_attempts(clock.now(), 10))
        .unwrap();
    assert!(due.is_empty());

    let after = engine.instances().get(&id).unwrap();
    assert_eq!(after.step(&check).unwrap().status, StepStatus::Skipped);
    assert!(exceptions_for(&engine, &id).is_empty());
}

#[tokio::test]
async fn completing_integration_step_by_hand_closes_pending_retry() {
    let provider = Arc::new(MockProvider::failing("checkr", 1));
    let (engine, clock) = engine(
        test_config(),
        Some((IntegrationKind::BackgroundCheck, provider.clone())),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::BackgroundCheck, 3, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-118"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let check = step_id(&detail, "check");
    let hr = Actor::from_string("hr");

    engine
        .instances()
        .transition_step(&id, &check, StepStatus::InProgress, &hr)
        .await
        .unwrap();
    let done = engine
        .instances()
        .transition_step(&id, &check, StepStatus::Completed, &hr)
        .await
        .unwrap();
    assert_eq!(done.step.completed_by, Some(hr.clone()));
    assert_eq!(done.instance.percentage, 50);

    let attempts = engine.instances().attempts(&id, &check).unwrap();
    assert_eq!(attempts[0].status, AttemptStatus::Completed);
    assert!(attempts[0].next_retry_at.is_none());

    clock.advance(chrono::Duration::hours(2));
    let report = engine.sweeper().sweep_once().await.unwrap();
    assert_eq!(report.retried, 0);
    assert_eq!(provider.calls(), 1);
    assert!(exceptions_for(&engine, &id).is_empty());
}

#[tokio::test(start_paused = true)]
async fn late_failure_after_manual_completion_is_discarded() {
    let provider = Arc::new(
        MockProvider::failing("checkr", 1).with_delay(Duration::from_secs(5), 30),
    );
    let mut config = test_config();
    config.engine.dispatch_mode = staffline_core::config::DispatchMode::Background;
    let (engine, _) = engine(config, Some((IntegrationKind::BackgroundCheck, provider.clone())));
    // A single allowed try: a recorded failure would exhaust the step
    let tpl = publish(&engine, integration_draft(IntegrationKind::BackgroundCheck, 1, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-119"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let check = step_id(&detail, "check");
    let hr = Actor::from_string("hr");

    engine
        .instances()
        .transition_step(&id, &check, StepStatus::InProgress, &hr)
        .await
        .unwrap();
    wait_for_in_flight(&engine, &id, &check).await;

    engine
        .instances()
        .transition_step(&id, &check, StepStatus::Completed, &hr)
        .await
        .unwrap();

    // Let the provider call finish and its outcome land
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(provider.calls(), 1);

    let after = engine.instances().get(&id).unwrap();
    let step = after.step(&check).unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.completed_by, Some(hr));
    let attempts = engine.instances().attempts(&id, &check).unwrap();
    assert_eq!(attempts[0].status, AttemptStatus::Completed);
    assert!(exceptions_for(&engine, &id).is_empty());
    assert_consistent(&after);
}

#[tokio::test(start_paused = true)]
async fn sweep_report_ignores_discarded_outcomes() {
    let provider = Arc::new(
        MockProvider::failing("checkr", 1).with_delay(Duration::from_secs(5), 30),
    );
    let (engine, clock) = engine(
        test_config(),
        Some((IntegrationKind::BackgroundCheck, provider.clone())),
    );
    let tpl = publish(&engine, integration_draft(IntegrationKind::BackgroundCheck, 3, true));
    let detail = engine
        .instances()
        .instantiate(from_template(&tpl, "emp-120"), &Actor::from_string("hr"))
        .unwrap();
    let id = detail.instance.id.clone();
    let check = step_id(&detail, "check");
    engine
        .instances()
        .transition_step(&id, &check, StepStatus::InProgress, &Actor::from_string("hr"))
        .await
        .unwrap();
    assert_eq!(provider.calls(), 1);

    clock.advance(chrono::Duration::hours(2));
    let sweeper = engine.sweeper();
    let sweep = tokio::spawn(async move { sweeper.sweep_once().await });
    let in_flight = wait_for_in_flight(&engine, &id, &check).await;
    assert_eq!(in_flight.attempt_count, 2);

    engine
        .instances()
        .cancel(&id, &Actor::from_string("hr"), "offer withdrawn")
        .unwrap();

    let report = sweep.await.unwrap().unwrap();
    assert_eq!(report.retried, 0);
    assert_eq!(provider.calls(), 2);
    assert!(exceptions_for(&engine, &id).is_empty());
}
