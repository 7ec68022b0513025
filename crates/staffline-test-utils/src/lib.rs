//! Shared mocks and fixtures for staffline tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use futures::future::BoxFuture;

use staffline_core::config::{AppConfig, DispatchMode};
use staffline_core::error::{Result, StafflineError};
use staffline_core::traits::{Clock, IntegrationProvider};
use staffline_core::types::*;

/// Integration provider that replays scripted results.
///
/// Once the script runs out every call succeeds with a generated
/// correlation id.
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<Result<ProviderResponse>>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ProviderRequest>>,
    delay: Option<Duration>,
    timeout_secs: u64,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            delay: None,
            timeout_secs: 30,
        }
    }

    /// A provider whose every call fails with a 503-style error.
    pub fn failing(name: &str, times: usize) -> Self {
        let provider = Self::new(name);
        for i in 0..times {
            provider.push_failure(&format!("503 Service Unavailable (call {})", i + 1));
        }
        provider
    }

    pub fn with_delay(mut self, delay: Duration, timeout_secs: u64) -> Self {
        self.delay = Some(delay);
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn push_success(&self, correlation_id: &str) {
        self.lock_script().push_back(Ok(ProviderResponse {
            correlation_id: correlation_id.to_string(),
            payload: serde_json::json!({ "status": "accepted" }),
        }));
    }

    pub fn push_failure(&self, message: &str) {
        self.lock_script().push_back(Err(StafflineError::Provider {
            provider: self.name.clone(),
            message: message.to_string(),
        }));
    }

    /// Number of network calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<ProviderResponse>>> {
        match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl IntegrationProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, request: ProviderRequest) -> BoxFuture<'_, Result<ProviderResponse>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Ok(mut requests) = self.requests.lock() {
                requests.push(request);
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let scripted = self.lock_script().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(ProviderResponse {
                    correlation_id: format!("{}-{}", self.name, n),
                    payload: serde_json::json!({ "status": "accepted" }),
                })
            })
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }
}

/// Provider map with a single provider.
pub fn providers_with(
    kind: IntegrationKind,
    provider: Arc<MockProvider>,
) -> HashMap<IntegrationKind, Arc<dyn IntegrationProvider>> {
    let mut map: HashMap<IntegrationKind, Arc<dyn IntegrationProvider>> = HashMap::new();
    map.insert(kind, provider);
    map
}

/// Clock that only moves when told to.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// 2026-11-02 09:00 UTC.
    pub fn default_start() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 11, 2, 9, 0, 0).single().unwrap_or_else(Utc::now))
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}

/// Config for engine tests: inline dispatch, small attempt bound.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.database = ":memory:".into();
    config.engine.dispatch_mode = DispatchMode::Inline;
    config.engine.default_max_attempts = 3;
    config.retry.initial_backoff_secs = 60;
    config.retry.max_backoff_secs = 600;
    config
}

/// Two manual steps, the second depending on the first.
pub fn two_step_draft() -> TemplateDraft {
    TemplateDraft {
        name: "Two step onboarding".into(),
        lifecycle: LifecycleType::Onboarding,
        department: None,
        role: None,
        description: None,
        steps: vec![
            StepBlueprint::new("s1", "Complete paperwork")
                .with_category("paperwork")
                .with_due_offset(1),
            StepBlueprint::new("s2", "Order laptop")
                .with_category("equipment")
                .with_prerequisites(&["s1"])
                .with_due_offset(5)
                .with_assignee_role("it"),
        ],
    }
}

/// One integration step followed by a manual step that depends on it.
pub fn integration_draft(kind: IntegrationKind, max_attempts: u32, mandatory: bool) -> TemplateDraft {
    let mut check = StepBlueprint::new("check", "Run integration")
        .with_category("compliance")
        .with_integration(kind)
        .with_max_attempts(max_attempts)
        .with_due_offset(3);
    if !mandatory {
        check = check.optional();
    }
    TemplateDraft {
        name: format!("{} workflow", kind),
        lifecycle: LifecycleType::Onboarding,
        department: None,
        role: None,
        description: None,
        steps: vec![
            check,
            StepBlueprint::new("welcome", "Welcome meeting")
                .with_category("orientation")
                .with_prerequisites(&["check"])
                .with_due_offset(7)
                .with_assignee_role("buddy"),
        ],
    }
}

pub fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 11, 2).expect("valid date")
}

/// Instantiate request for a template.
pub fn from_template(template_id: &TemplateId, employee: &str) -> InstantiateRequest {
    InstantiateRequest {
        employee_id: EmployeeId::from_string(employee),
        source: StepSource::Template {
            template_id: template_id.clone(),
        },
        start_date: start_date(),
        expected_completion: None,
        assignments: BTreeMap::from([
            ("buddy".to_string(), "jamie".to_string()),
            ("manager".to_string(), "morgan".to_string()),
        ]),
    }
}
