use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A CI job to supervise: a workflow definition file, optionally narrowed to one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    pub definition: PathBuf,
    pub job: Option<String>,
    pub working_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Workload {
    pub fn new(definition: impl Into<PathBuf>) -> Self {
        let definition = definition.into();
        let name = definition
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workload".to_string());
        let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            name,
            definition,
            job: None,
            working_dir,
            env: BTreeMap::new(),
        }
    }

    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job = Some(job.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Path of the definition, resolved against the working directory when relative.
    pub fn definition_path(&self) -> PathBuf {
        if self.definition.is_absolute() {
            self.definition.clone()
        } else {
            self.working_dir.join(&self.definition)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkflowStep {
    pub name: Option<String>,
    pub uses: Option<String>,
    pub run: Option<String>,
}

impl WorkflowStep {
    pub fn label(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.uses.clone())
            .or_else(|| {
                self.run
                    .as_ref()
                    .and_then(|run| run.lines().next())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "<unnamed step>".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkflowJob {
    pub name: Option<String>,
    pub runs_on: Option<serde_yaml::Value>,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

/// The subset of a workflow file the degraded execution paths need: jobs and their steps.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WorkflowDefinition {
    pub name: Option<String>,
    #[serde(default)]
    pub jobs: BTreeMap<String, WorkflowJob>,
}

impl WorkflowDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)
            .with_context(|| format!("Failed to read workflow file at {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse workflow file at {}", path.display()))
    }

    pub fn parse(content: &[u8]) -> Result<Self> {
        let definition: Self = serde_yaml::from_slice(content)?;
        ensure!(!definition.jobs.is_empty(), "workflow defines no jobs");
        Ok(definition)
    }

    /// Jobs selected by `job`, or every job when no filter is given.
    pub fn selected_jobs<'a>(
        &'a self,
        job: Option<&'a str>,
    ) -> impl Iterator<Item = (&'a String, &'a WorkflowJob)> + 'a {
        self.jobs
            .iter()
            .filter(move |(id, _)| job.is_none_or(|wanted| wanted == id.as_str()))
    }

    /// Concatenated `run:` scripts of the selected jobs, in declaration order.
    pub fn run_script(&self, job: Option<&str>) -> Option<String> {
        let scripts = self
            .selected_jobs(job)
            .flat_map(|(_, job)| job.steps.iter())
            .filter_map(|step| step.run.as_deref())
            .collect::<Vec<_>>();
        if scripts.is_empty() {
            return None;
        }
        Some(format!("set -e\n{}", scripts.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKFLOW: &str = r#"
name: CI
on: [push]
jobs:
  build:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v4
      - name: Compile
        run: make build
  test:
    runs-on: ubuntu-latest
    steps:
      - run: |
          make test
          echo done
"#;

    #[test]
    fn test_parse_jobs_and_steps() {
        let definition = WorkflowDefinition::parse(WORKFLOW.as_bytes()).unwrap();
        assert_eq!(definition.name.as_deref(), Some("CI"));
        assert_eq!(definition.jobs.len(), 2);
        let build = &definition.jobs["build"];
        assert_eq!(build.steps.len(), 2);
        assert_eq!(build.steps[0].label(), "actions/checkout@v4");
        assert_eq!(build.steps[1].label(), "Compile");
        assert_eq!(definition.jobs["test"].steps[0].label(), "make test");
    }

    #[test]
    fn test_run_script_respects_job_filter() {
        let definition = WorkflowDefinition::parse(WORKFLOW.as_bytes()).unwrap();
        assert_eq!(
            definition.run_script(Some("build")).unwrap(),
            "set -e\nmake build"
        );
        let all = definition.run_script(None).unwrap();
        assert!(all.contains("make build"));
        assert!(all.contains("make test"));
        assert!(definition.run_script(Some("missing")).is_none());
    }

    #[test]
    fn test_workflow_without_jobs_is_rejected() {
        assert!(WorkflowDefinition::parse(b"name: empty\n").is_err());
    }

    #[test]
    fn test_workload_name_and_path() {
        let workload = Workload::new(".github/workflows/ci.yml").with_working_dir("/repo");
        assert_eq!(workload.name, "ci");
        assert_eq!(
            workload.definition_path(),
            PathBuf::from("/repo/.github/workflows/ci.yml")
        );
    }
}
