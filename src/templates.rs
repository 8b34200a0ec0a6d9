//! Task template definitions and JSON loading.
//!
//! Each owned phase has a fixed batch of task templates. The titles and
//! descriptions are policy fixtures, not engine logic — deployments override
//! them with a JSON file; the compiled-in defaults are the fallback.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::phase::WorkflowPhase;

/// Blueprint for one task in a phase batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskTemplate {
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Due-date offset from generation time, in days. Policy constant.
    pub due_in_days: i64,
    #[serde(default)]
    pub checklist: Vec<String>,
}

impl TaskTemplate {
    pub fn new(title: &str, description: &str, due_in_days: i64) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
            due_in_days,
            checklist: Vec::new(),
        }
    }

    pub fn with_checklist(mut self, items: &[&str]) -> Self {
        self.checklist = items.iter().map(|i| i.to_string()).collect();
        self
    }
}

/// The full template file format: one batch per phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSet {
    pub phases: HashMap<WorkflowPhase, Vec<TaskTemplate>>,
}

impl TemplateSet {
    /// Load a template set from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template file: {}", path.display()))?;

        let set: TemplateSet = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse template JSON: {}", path.display()))?;

        set.validate()?;
        Ok(set)
    }

    /// Save the template set to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize templates to JSON")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write template file: {}", path.display()))?;

        Ok(())
    }

    /// Templates for a phase; empty when the phase has no batch defined.
    pub fn templates_for(&self, phase: WorkflowPhase) -> &[TaskTemplate] {
        self.phases.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    fn validate(&self) -> Result<()> {
        for (phase, templates) in &self.phases {
            for template in templates {
                if template.title.trim().is_empty() {
                    anyhow::bail!("template in phase {} has an empty title", phase);
                }
                if template.due_in_days <= 0 {
                    anyhow::bail!(
                        "template '{}' in phase {} has a non-positive due offset",
                        template.title,
                        phase
                    );
                }
            }
        }
        Ok(())
    }
}

/// The compiled-in default batches.
pub fn default_templates() -> TemplateSet {
    let mut phases = HashMap::new();

    phases.insert(
        WorkflowPhase::Operations,
        vec![
            TaskTemplate::new(
                "Create inventory records",
                "Register project materials and equipment in the inventory system",
                3,
            )
            .with_checklist(&[
                "List required materials",
                "Register each item with quantities",
                "Attach supplier references",
            ]),
            TaskTemplate::new(
                "Verify equipment allocation",
                "Confirm allocated equipment against the approved bill of quantities",
                5,
            ),
            TaskTemplate::new(
                "Site readiness assessment",
                "Inspect the site and record readiness blockers",
                7,
            )
            .with_checklist(&["Access and permits", "Utilities available", "Safety signage"]),
            TaskTemplate::new(
                "Mobilize field team",
                "Assign and brief the field team for project start",
                10,
            ),
            TaskTemplate::new(
                "Baseline operations report",
                "Compile the operations baseline for handover to procurement",
                14,
            ),
        ],
    );

    phases.insert(
        WorkflowPhase::Procurement,
        vec![
            TaskTemplate::new(
                "Collect vendor quotations",
                "Request and record quotations for all inventory items",
                5,
            )
            .with_checklist(&["Shortlist vendors", "Send RFQs", "Record quotations"]),
            TaskTemplate::new(
                "Raise purchase requisitions",
                "Create requisitions for approved items",
                7,
            ),
            TaskTemplate::new(
                "Negotiate supplier contracts",
                "Finalize terms with selected suppliers",
                14,
            ),
            TaskTemplate::new(
                "Schedule deliveries",
                "Plan delivery windows against the execution timeline",
                28,
            ),
        ],
    );

    phases.insert(
        WorkflowPhase::Finance,
        vec![
            TaskTemplate::new(
                "Open project cost center",
                "Create the cost center and map procurement commitments",
                3,
            ),
            TaskTemplate::new(
                "Allocate project budget",
                "Distribute the approved budget across work packages",
                7,
            )
            .with_checklist(&["Confirm approved budget", "Split by work package"]),
            TaskTemplate::new(
                "Set up invoicing schedule",
                "Agree milestones and invoicing dates with the client",
                14,
            ),
            TaskTemplate::new(
                "Financial compliance review",
                "Verify tax, withholding, and audit requirements for the project",
                35,
            ),
        ],
    );

    TemplateSet { phases }
}

/// Try to load templates from a file, falling back to the defaults.
pub fn load_templates_or_default(path: Option<&Path>) -> Result<TemplateSet> {
    match path {
        Some(p) if p.exists() => TemplateSet::load(p),
        _ => Ok(default_templates()),
    }
}
