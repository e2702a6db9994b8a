// Workflow compiler: YAML files + trigger -> executable pipeline
//
// Problems surface as Diagnostic values. Errors drop the workflow they refer
// to; warnings are advisory and the workflow is still emitted.

use serde::{Deserialize, Serialize};

use crate::glob::{any_match, classify_ref, RefName};
use crate::pipeline::PipelineRecord;
use crate::trigger::{TriggerKind, TriggerMetadata};
use crate::workflow::{CloneOpts, Constraint, WorkflowSource};

/// How severe a diagnostic is; errors drop the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticKind {
    /// The workflow file is not valid YAML for the workflow schema
    Parse,
    /// No constraint matched the trigger
    WorkflowSkipped,
    /// The workflow names no execution engine
    MissingEngine,
    /// Contradictory or incomplete configuration
    InvalidConfiguration,
}

/// A compiler finding attached to one workflow file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub workflow: String,
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    fn error(workflow: &str, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            workflow: workflow.to_string(),
            kind,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(workflow: &str, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            workflow: workflow.to_string(),
            kind,
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// A pipeline record with its workflow files parsed
#[derive(Debug, Clone)]
pub struct ParsedPipeline {
    pub trigger: TriggerMetadata,
    pub workflows: Vec<WorkflowSource>,
    pub diagnostics: Vec<Diagnostic>,
}

/// One workflow that survived compilation
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub name: String,
    pub engine: String,
    pub clone_opts: CloneOpts,
    /// The full parsed source, for engine-specific interpretation
    pub source: WorkflowSource,
}

#[derive(Debug, Clone)]
pub struct CompiledPipeline {
    pub trigger: TriggerMetadata,
    pub workflows: Vec<CompiledWorkflow>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parse each workflow file, attaching per-file errors.
/// A file that fails to parse is dropped; the rest proceed.
pub fn parse(record: PipelineRecord) -> ParsedPipeline {
    let mut workflows = Vec::with_capacity(record.workflows.len());
    let mut diagnostics = Vec::new();

    for file in record.workflows {
        match WorkflowSource::from_yaml(&file.contents) {
            Ok(mut wf) => {
                if wf.name.is_empty() {
                    wf.name = file
                        .name
                        .trim_end_matches(".yml")
                        .trim_end_matches(".yaml")
                        .to_string();
                }
                workflows.push(wf);
            }
            Err(err) => {
                diagnostics.push(Diagnostic::error(
                    &file.name,
                    DiagnosticKind::Parse,
                    format!("failed to parse workflow file: {err}"),
                ));
            }
        }
    }

    ParsedPipeline {
        trigger: record.trigger_metadata,
        workflows,
        diagnostics,
    }
}

/// Evaluate trigger matching and configuration validity for every parsed
/// workflow, emitting the compiled pipeline
pub fn compile(parsed: ParsedPipeline) -> CompiledPipeline {
    let mut workflows = Vec::new();
    let mut diagnostics = parsed.diagnostics;

    for wf in parsed.workflows {
        if !matches(&wf, &parsed.trigger) {
            diagnostics.push(Diagnostic::warning(
                &wf.name,
                DiagnosticKind::WorkflowSkipped,
                format!("no constraint matched {} trigger", parsed.trigger.kind),
            ));
            continue;
        }
        if wf.engine.is_empty() {
            diagnostics.push(Diagnostic::error(
                &wf.name,
                DiagnosticKind::MissingEngine,
                "workflow does not name an engine",
            ));
            continue;
        }
        if wf.steps.is_empty() {
            diagnostics.push(Diagnostic::error(
                &wf.name,
                DiagnosticKind::InvalidConfiguration,
                "workflow has no steps",
            ));
            continue;
        }

        let clone_opts = wf.clone_opts;
        if clone_opts.skip && clone_opts.submodules {
            diagnostics.push(Diagnostic::warning(
                &wf.name,
                DiagnosticKind::InvalidConfiguration,
                "clone.submodules has no effect when clone.skip is set",
            ));
        }
        if clone_opts.skip && clone_opts.depth > 0 {
            diagnostics.push(Diagnostic::warning(
                &wf.name,
                DiagnosticKind::InvalidConfiguration,
                "clone.depth has no effect when clone.skip is set",
            ));
        }

        workflows.push(CompiledWorkflow {
            name: wf.name.clone(),
            engine: wf.engine.clone(),
            clone_opts,
            source: wf,
        });
    }

    CompiledPipeline {
        trigger: parsed.trigger,
        workflows,
        diagnostics,
    }
}

/// Does this workflow run for this trigger?
/// Manual triggers always match; otherwise at least one constraint must.
pub fn matches(wf: &WorkflowSource, trigger: &TriggerMetadata) -> bool {
    if trigger.kind == TriggerKind::Manual {
        return true;
    }
    wf.when.iter().any(|c| constraint_matches(c, trigger))
}

fn constraint_matches(constraint: &Constraint, trigger: &TriggerMetadata) -> bool {
    let kind = trigger.kind.to_string();
    if !constraint.event.iter().any(|e| *e == kind) {
        return false;
    }

    match trigger.kind {
        TriggerKind::Push => {
            let Some(push) = &trigger.push else {
                return false;
            };
            // Branch refs are tested against `branch`, tag refs against `tag`.
            // A constraint with no ref patterns matches any push; one that only
            // names patterns for the other ref type matches nothing here.
            match classify_ref(&push.git_ref) {
                RefName::Branch(name) => {
                    if constraint.branch.is_empty() {
                        constraint.tag.is_empty()
                    } else {
                        any_match(&constraint.branch, name)
                    }
                }
                RefName::Tag(name) => {
                    if constraint.tag.is_empty() {
                        constraint.branch.is_empty()
                    } else {
                        any_match(&constraint.tag, name)
                    }
                }
            }
        }
        TriggerKind::PullRequest => {
            let Some(pr) = &trigger.pull_request else {
                return false;
            };
            constraint.branch.is_empty() || any_match(&constraint.branch, &pr.target_branch)
        }
        TriggerKind::Manual => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::WorkflowFile;
    use crate::trigger::{PullRequestTrigger, PushTrigger, TriggerRepo};

    fn push_trigger(git_ref: &str, sha: &str) -> TriggerMetadata {
        TriggerMetadata {
            kind: TriggerKind::Push,
            push: Some(PushTrigger {
                git_ref: git_ref.to_string(),
                old_sha: "0000".to_string(),
                new_sha: sha.to_string(),
            }),
            pull_request: None,
            manual: None,
            repo: repo(),
        }
    }

    fn pr_trigger(target: &str) -> TriggerMetadata {
        TriggerMetadata {
            kind: TriggerKind::PullRequest,
            push: None,
            pull_request: Some(PullRequestTrigger {
                source_branch: "feature".to_string(),
                target_branch: target.to_string(),
                source_sha: "abc".to_string(),
                action: "opened".to_string(),
            }),
            manual: None,
            repo: repo(),
        }
    }

    fn manual_trigger() -> TriggerMetadata {
        TriggerMetadata {
            kind: TriggerKind::Manual,
            push: None,
            pull_request: None,
            manual: None,
            repo: repo(),
        }
    }

    fn repo() -> TriggerRepo {
        TriggerRepo {
            knot: "knot.example.com".to_string(),
            did: "did:plc:abc".to_string(),
            repo: "widget".to_string(),
        }
    }

    fn record(trigger: TriggerMetadata, yaml: &str) -> PipelineRecord {
        PipelineRecord {
            trigger_metadata: trigger,
            workflows: vec![WorkflowFile {
                name: "ci.yml".to_string(),
                contents: yaml.to_string(),
            }],
        }
    }

    const MATCHING: &str = r#"
name: build
engine: nixery
when:
  - event: [push]
    branch: [main]
steps:
  - name: test
    command: make test
"#;

    #[test]
    fn test_push_matching_branch_is_emitted() {
        let compiled = compile(parse(record(push_trigger("refs/heads/main", "abc"), MATCHING)));
        assert_eq!(compiled.workflows.len(), 1);
        assert_eq!(compiled.workflows[0].name, "build");
        assert_eq!(compiled.workflows[0].engine, "nixery");
        assert!(compiled.diagnostics.is_empty());
    }

    #[test]
    fn test_push_non_matching_branch_is_skipped() {
        let compiled = compile(parse(record(push_trigger("refs/heads/dev", "abc"), MATCHING)));
        assert!(compiled.workflows.is_empty());
        assert_eq!(compiled.diagnostics.len(), 1);
        assert_eq!(
            compiled.diagnostics[0].kind,
            DiagnosticKind::WorkflowSkipped
        );
        assert_eq!(compiled.diagnostics[0].severity, Severity::Warning);
    }

    #[test]
    fn test_tag_ref_tests_tag_patterns() {
        let yaml = r#"
engine: nixery
when:
  - event: push
    tag: ["v*"]
steps:
  - command: make release
"#;
        let t = push_trigger("refs/tags/v1.0", "abc");
        assert_eq!(compile(parse(record(t, yaml))).workflows.len(), 1);

        // A tag-only constraint does not match branch pushes
        let t = push_trigger("refs/heads/main", "abc");
        assert!(compile(parse(record(t, yaml))).workflows.is_empty());

        let t = push_trigger("refs/tags/rc-1", "abc");
        assert!(compile(parse(record(t, yaml))).workflows.is_empty());
    }

    #[test]
    fn test_bare_push_constraint_matches_any_ref() {
        let yaml = r#"
engine: nixery
when:
  - event: push
steps:
  - command: make
"#;
        for git_ref in ["refs/heads/main", "refs/heads/dev", "refs/tags/v1.0"] {
            let compiled = compile(parse(record(push_trigger(git_ref, "abc"), yaml)));
            assert_eq!(compiled.workflows.len(), 1, "ref {git_ref}");
        }
    }

    #[test]
    fn test_manual_always_matches() {
        let compiled = compile(parse(record(manual_trigger(), MATCHING)));
        assert_eq!(compiled.workflows.len(), 1);
    }

    #[test]
    fn test_pull_request_matches_target_branch() {
        let yaml = r#"
engine: nixery
when:
  - event: pull_request
    branch: [main]
steps:
  - command: make test
"#;
        assert_eq!(compile(parse(record(pr_trigger("main"), yaml))).workflows.len(), 1);
        assert!(compile(parse(record(pr_trigger("dev"), yaml))).workflows.is_empty());
    }

    #[test]
    fn test_missing_engine_is_an_error() {
        let yaml = r#"
when:
  - event: push
steps:
  - command: make
"#;
        let compiled = compile(parse(record(push_trigger("refs/heads/main", "abc"), yaml)));
        assert!(compiled.workflows.is_empty());
        assert_eq!(compiled.diagnostics[0].kind, DiagnosticKind::MissingEngine);
        assert_eq!(compiled.diagnostics[0].severity, Severity::Error);
    }

    #[test]
    fn test_empty_steps_is_an_error() {
        let yaml = r#"
engine: nixery
when:
  - event: push
"#;
        let compiled = compile(parse(record(push_trigger("refs/heads/main", "abc"), yaml)));
        assert!(compiled.workflows.is_empty());
        assert_eq!(
            compiled.diagnostics[0].kind,
            DiagnosticKind::InvalidConfiguration
        );
    }

    #[test]
    fn test_clone_skip_with_submodules_warns_but_emits() {
        let yaml = r#"
engine: nixery
when:
  - event: push
clone:
  skip: true
  submodules: true
steps:
  - command: make
"#;
        let compiled = compile(parse(record(push_trigger("refs/heads/main", "abc"), yaml)));
        assert_eq!(compiled.workflows.len(), 1);
        assert!(compiled.workflows[0].clone_opts.skip);
        assert_eq!(compiled.diagnostics.len(), 1);
        assert_eq!(
            compiled.diagnostics[0].kind,
            DiagnosticKind::InvalidConfiguration
        );
        assert_eq!(compiled.diagnostics[0].severity, Severity::Warning);
    }

    #[test]
    fn test_unparseable_file_reports_and_drops() {
        let compiled = compile(parse(record(manual_trigger(), ": not yaml : [")));
        assert!(compiled.workflows.is_empty());
        assert_eq!(compiled.diagnostics[0].kind, DiagnosticKind::Parse);
        assert_eq!(compiled.diagnostics[0].workflow, "ci.yml");
    }

    #[test]
    fn test_workflow_name_falls_back_to_file_name() {
        let yaml = "engine: nixery\nsteps:\n  - command: make\n";
        let compiled = compile(parse(record(manual_trigger(), yaml)));
        assert_eq!(compiled.workflows[0].name, "ci");
    }
}
