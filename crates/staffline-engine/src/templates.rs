use std::sync::Arc;

use tracing::info;

use staffline_core::error::{Result, StafflineError};
use staffline_core::traits::Clock;
use staffline_core::types::*;
use staffline_store::SqliteStore;

use crate::resolver::validate_blueprints;
use crate::retry::write_with_retry;

/// Administrative access to workflow templates.
///
/// Templates move `draft -> published -> retired`. Only drafts can be
/// edited; a new version of a published template is a new template.
pub struct TemplateStore {
    store: Arc<SqliteStore>,
    clock: Arc<dyn Clock>,
    conflict_retries: u32,
}

impl TemplateStore {
    pub fn new(store: Arc<SqliteStore>, clock: Arc<dyn Clock>, conflict_retries: u32) -> Self {
        Self {
            store,
            clock,
            conflict_retries,
        }
    }

    /// Create a draft template at version 1.
    pub fn create(&self, draft: TemplateDraft, actor: &Actor) -> Result<WorkflowTemplate> {
        check_name(&draft.name)?;
        let template = WorkflowTemplate {
            id: TemplateId::new(),
            name: draft.name,
            lifecycle: draft.lifecycle,
            department: draft.department,
            role: draft.role,
            description: draft.description,
            version: 1,
            state: TemplateState::Draft,
            steps: draft.steps,
            created_by: actor.clone(),
            created_at: self.clock.now(),
            published_at: None,
            retired_at: None,
        };
        write_with_retry(&self.store, self.conflict_retries, |tx| {
            tx.insert_template(&template)
        })?;
        info!(template_id = %template.id, name = %template.name, "Template draft created");
        Ok(template)
    }

    /// Replace the content of a draft.
    pub fn update(&self, id: &TemplateId, draft: TemplateDraft) -> Result<WorkflowTemplate> {
        check_name(&draft.name)?;
        write_with_retry(&self.store, self.conflict_retries, |tx| {
            let mut t = tx
                .get_template(id)?
                .ok_or_else(|| StafflineError::TemplateNotFound(id.clone()))?;
            if t.state != TemplateState::Draft {
                return Err(StafflineError::TemplateImmutable {
                    id: id.clone(),
                    state: t.state,
                });
            }
            t.name = draft.name.clone();
            t.lifecycle = draft.lifecycle;
            t.department = draft.department.clone();
            t.role = draft.role.clone();
            t.description = draft.description.clone();
            t.steps = draft.steps.clone();
            tx.update_template(&t)?;
            Ok(t)
        })
    }

    /// Validate the step graph and make the template instantiable.
    /// Publishing an already published template is a no-op.
    pub fn publish(&self, id: &TemplateId) -> Result<WorkflowTemplate> {
        let now = self.clock.now();
        let template = write_with_retry(&self.store, self.conflict_retries, |tx| {
            let mut t = tx
                .get_template(id)?
                .ok_or_else(|| StafflineError::TemplateNotFound(id.clone()))?;
            match t.state {
                TemplateState::Published => return Ok(t),
                TemplateState::Retired => {
                    return Err(StafflineError::TemplateImmutable {
                        id: id.clone(),
                        state: t.state,
                    })
                }
                TemplateState::Draft => {}
            }
            validate_blueprints(&t.steps)?;
            t.state = TemplateState::Published;
            t.published_at = Some(now);
            tx.update_template(&t)?;
            Ok(t)
        })?;
        info!(template_id = %id, version = template.version, "Template published");
        Ok(template)
    }

    /// Withdraw a template from new instantiations. Existing instances are
    /// unaffected. Retiring twice is a no-op.
    pub fn retire(&self, id: &TemplateId) -> Result<WorkflowTemplate> {
        let now = self.clock.now();
        let template = write_with_retry(&self.store, self.conflict_retries, |tx| {
            let mut t = tx
                .get_template(id)?
                .ok_or_else(|| StafflineError::TemplateNotFound(id.clone()))?;
            if t.state == TemplateState::Retired {
                return Ok(t);
            }
            t.state = TemplateState::Retired;
            t.retired_at = Some(now);
            tx.update_template(&t)?;
            Ok(t)
        })?;
        info!(template_id = %id, "Template retired");
        Ok(template)
    }

    /// Copy a template into a new draft one version above the newest
    /// template of the same name and lifecycle.
    pub fn revise(&self, id: &TemplateId, actor: &Actor) -> Result<WorkflowTemplate> {
        let now = self.clock.now();
        let revised = write_with_retry(&self.store, self.conflict_retries, |tx| {
            let source = tx
                .get_template(id)?
                .ok_or_else(|| StafflineError::TemplateNotFound(id.clone()))?;
            let newest = tx
                .list_templates(Some(source.lifecycle), None)?
                .into_iter()
                .filter(|t| t.name == source.name)
                .map(|t| t.version)
                .max()
                .unwrap_or(source.version);

            let draft = WorkflowTemplate {
                id: TemplateId::new(),
                version: newest + 1,
                state: TemplateState::Draft,
                created_by: actor.clone(),
                created_at: now,
                published_at: None,
                retired_at: None,
                ..source
            };
            tx.insert_template(&draft)?;
            Ok(draft)
        })?;
        info!(template_id = %revised.id, source = %id, version = revised.version, "Template revised");
        Ok(revised)
    }

    pub fn get(&self, id: &TemplateId) -> Result<WorkflowTemplate> {
        self.store
            .read(|tx| tx.get_template(id))?
            .ok_or_else(|| StafflineError::TemplateNotFound(id.clone()))
    }

    pub fn list(
        &self,
        lifecycle: Option<LifecycleType>,
        state: Option<TemplateState>,
    ) -> Result<Vec<WorkflowTemplate>> {
        self.store.read(|tx| tx.list_templates(lifecycle, state))
    }

    /// The most specific published template for a lifecycle event.
    ///
    /// A template scoped to a department or role only matches that department
    /// or role. Department and role together beat department alone, which
    /// beats role alone, which beats a generic template. Newest version wins
    /// a tie.
    pub fn find_template(
        &self,
        lifecycle: LifecycleType,
        department: Option<&str>,
        role: Option<&str>,
    ) -> Result<Option<WorkflowTemplate>> {
        let candidates = self.list(Some(lifecycle), Some(TemplateState::Published))?;
        Ok(candidates
            .into_iter()
            .filter_map(|t| specificity(&t, department, role).map(|score| (score, t)))
            .max_by(|(sa, a), (sb, b)| {
                sa.cmp(sb)
                    .then(a.version.cmp(&b.version))
                    .then(a.published_at.cmp(&b.published_at))
            })
            .map(|(_, t)| t))
    }
}

/// `None` when the template is scoped to a different department or role.
fn specificity(t: &WorkflowTemplate, department: Option<&str>, role: Option<&str>) -> Option<u8> {
    let dept = match (t.department.as_deref(), department) {
        (None, _) => 0,
        (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => 2,
        _ => return None,
    };
    let role = match (t.role.as_deref(), role) {
        (None, _) => 0,
        (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => 1,
        _ => return None,
    };
    Some(dept + role)
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(StafflineError::InvalidDefinition(
            "template name must not be empty".into(),
        ));
    }
    Ok(())
}

/// Parse a template definition file.
///
/// ```toml
/// name = "Engineering onboarding"
/// lifecycle = "onboarding"
/// department = "engineering"
///
/// [[steps]]
/// id = "offer"
/// title = "Sign offer letter"
/// kind = "integration"
/// integration = "e_signature"
///
/// [[steps]]
/// id = "laptop"
/// title = "Order laptop"
/// prerequisites = ["offer"]
/// due_day_offset = 3
/// ```
pub fn draft_from_toml(content: &str) -> Result<TemplateDraft> {
    toml::from_str(content).map_err(|e| StafflineError::InvalidDefinition(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use staffline_core::traits::SystemClock;

    fn store() -> TemplateStore {
        TemplateStore::new(
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::new(SystemClock),
            3,
        )
    }

    fn draft(name: &str, department: Option<&str>, role: Option<&str>) -> TemplateDraft {
        TemplateDraft {
            name: name.into(),
            lifecycle: LifecycleType::Onboarding,
            department: department.map(String::from),
            role: role.map(String::from),
            description: None,
            steps: vec![
                StepBlueprint::new("paperwork", "Complete paperwork"),
                StepBlueprint::new("laptop", "Order laptop").with_prerequisites(&["paperwork"]),
            ],
        }
    }

    #[test]
    fn draft_publish_retire() {
        let ts = store();
        let admin = Actor::from_string("admin");
        let t = ts.create(draft("Default", None, None), &admin).unwrap();
        assert_eq!(t.state, TemplateState::Draft);
        assert_eq!(t.version, 1);

        let published = ts.publish(&t.id).unwrap();
        assert_eq!(published.state, TemplateState::Published);
        assert!(published.published_at.is_some());

        let err = ts.update(&t.id, draft("Changed", None, None)).unwrap_err();
        assert!(matches!(err, StafflineError::TemplateImmutable { .. }));

        let retired = ts.retire(&t.id).unwrap();
        assert_eq!(retired.state, TemplateState::Retired);
        assert!(matches!(
            ts.publish(&t.id),
            Err(StafflineError::TemplateImmutable { .. })
        ));
    }

    #[test]
    fn publish_validates_graph() {
        let ts = store();
        let mut bad = draft("Broken", None, None);
        bad.steps[0].prerequisites = vec!["laptop".into()];
        let t = ts.create(bad, &Actor::system()).unwrap();
        let err = ts.publish(&t.id).unwrap_err();
        assert!(matches!(err, StafflineError::InvalidDefinition(_)));
        assert_eq!(ts.get(&t.id).unwrap().state, TemplateState::Draft);
    }

    #[test]
    fn drafts_are_editable() {
        let ts = store();
        let t = ts.create(draft("Default", None, None), &Actor::system()).unwrap();
        let mut changed = draft("Renamed", None, None);
        changed.steps.push(StepBlueprint::new("badge", "Issue badge"));
        let updated = ts.update(&t.id, changed).unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.steps.len(), 3);
    }

    #[test]
    fn revise_creates_next_version_draft() {
        let ts = store();
        let admin = Actor::from_string("admin");
        let v1 = ts.create(draft("Default", None, None), &admin).unwrap();
        ts.publish(&v1.id).unwrap();

        let v2 = ts.revise(&v1.id, &admin).unwrap();
        assert_ne!(v2.id, v1.id);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.state, TemplateState::Draft);
        assert_eq!(v2.steps, v1.steps);

        // Revising the old version again still moves past the newest
        let v3 = ts.revise(&v1.id, &admin).unwrap();
        assert_eq!(v3.version, 3);
    }

    #[test]
    fn find_template_prefers_most_specific() {
        let ts = store();
        let admin = Actor::system();
        let generic = ts.create(draft("Generic", None, None), &admin).unwrap();
        let eng = ts
            .create(draft("Engineering", Some("engineering"), None), &admin)
            .unwrap();
        let eng_sre = ts
            .create(draft("SRE", Some("engineering"), Some("sre")), &admin)
            .unwrap();
        let sales = ts.create(draft("Sales", Some("sales"), None), &admin).unwrap();
        for t in [&generic, &eng, &eng_sre, &sales] {
            ts.publish(&t.id).unwrap();
        }

        let pick = |d: Option<&str>, r: Option<&str>| {
            ts.find_template(LifecycleType::Onboarding, d, r)
                .unwrap()
                .map(|t| t.name)
        };
        assert_eq!(pick(Some("engineering"), Some("sre")).as_deref(), Some("SRE"));
        assert_eq!(
            pick(Some("Engineering"), Some("backend")).as_deref(),
            Some("Engineering")
        );
        assert_eq!(pick(Some("finance"), None).as_deref(), Some("Generic"));
        assert_eq!(pick(None, None).as_deref(), Some("Generic"));
        assert!(ts
            .find_template(LifecycleType::Offboarding, None, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn find_template_ignores_drafts_and_retired() {
        let ts = store();
        let t = ts.create(draft("Only", None, None), &Actor::system()).unwrap();
        assert!(ts
            .find_template(LifecycleType::Onboarding, None, None)
            .unwrap()
            .is_none());
        ts.publish(&t.id).unwrap();
        ts.retire(&t.id).unwrap();
        assert!(ts
            .find_template(LifecycleType::Onboarding, None, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn parse_toml_definition() {
        let content = r#"
name = "Engineering onboarding"
lifecycle = "onboarding"
department = "engineering"

[[steps]]
id = "offer"
title = "Sign offer letter"
kind = "integration"
integration = "e_signature"

[[steps]]
id = "laptop"
title = "Order laptop"
prerequisites = ["offer"]
due_day_offset = 3
default_assignee_role = "it"
"#;
        let draft = draft_from_toml(content).unwrap();
        assert_eq!(draft.steps.len(), 2);
        assert_eq!(draft.steps[0].integration, Some(IntegrationKind::ESignature));
        assert_eq!(draft.steps[1].prerequisites, vec!["offer".to_string()]);
        validate_blueprints(&draft.steps).unwrap();

        assert!(draft_from_toml("name = 1").is_err());
    }
}
