// Workflow source model (YAML) and the executable step type
//
// A workflow file looks like:
//
//   name: build
//   engine: nixery
//   when:
//     - event: push          # scalar or list
//       branch: ["main", "release/**"]
//   dependencies:
//     nixpkgs: [gcc, gnumake]
//   environment:
//     CARGO_TERM_COLOR: always
//   clone:
//     depth: 1
//   steps:
//     - name: test
//       command: make test

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Deref;

/// A scalar-or-list of strings; `event: push` and `event: [push]` are the same
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatternList(pub Vec<String>);

impl<'de> Deserialize<'de> for PatternList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(s) => PatternList(vec![s]),
            OneOrMany::Many(v) => PatternList(v),
        })
    }
}

impl Deref for PatternList {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<S: Into<String>> FromIterator<S> for PatternList {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        PatternList(iter.into_iter().map(Into::into).collect())
    }
}

/// One trigger-match constraint; all named parts must hold for it to match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default)]
    pub event: PatternList,
    #[serde(default)]
    pub branch: PatternList,
    #[serde(default)]
    pub tag: PatternList,
}

/// Clone options; `skip` conflicts with `submodules` and a positive `depth`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CloneOpts {
    #[serde(default)]
    pub skip: bool,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub submodules: bool,
}

/// A user step as written in the workflow file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSource {
    #[serde(default)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// A parsed workflow file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSource {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub when: Vec<Constraint>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub steps: Vec<StepSource>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, rename = "clone")]
    pub clone_opts: CloneOpts,
}

impl WorkflowSource {
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }
}

/// Whether a step was injected by the engine or written by the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    System,
    User,
}

/// An executable step of a composed workflow.
/// Within a workflow, system steps always precede user steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    pub kind: StepKind,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl Step {
    pub fn system(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            kind: StepKind::System,
            environment: BTreeMap::new(),
        }
    }

    pub fn user(source: &StepSource) -> Self {
        Self {
            name: if source.name.is_empty() {
                source.command.clone()
            } else {
                source.name.clone()
            },
            command: source.command.clone(),
            kind: StepKind::User,
            environment: source.environment.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_workflow() {
        let yaml = r#"
name: build
engine: nixery
when:
  - event: push
    branch: ["main", "release/**"]
dependencies:
  nixpkgs: [gcc, gnumake]
environment:
  CARGO_TERM_COLOR: always
clone:
  depth: 5
  submodules: true
steps:
  - name: test
    command: make test
    environment:
      RUST_BACKTRACE: "1"
"#;
        let wf = WorkflowSource::from_yaml(yaml).unwrap();
        assert_eq!(wf.name, "build");
        assert_eq!(wf.engine, "nixery");
        assert_eq!(&*wf.when[0].event, ["push"]);
        assert_eq!(&*wf.when[0].branch, ["main", "release/**"]);
        assert_eq!(wf.dependencies["nixpkgs"], ["gcc", "gnumake"]);
        assert_eq!(wf.clone_opts.depth, 5);
        assert!(wf.clone_opts.submodules);
        assert_eq!(wf.steps[0].environment["RUST_BACKTRACE"], "1");
    }

    #[test]
    fn test_scalar_event_becomes_list() {
        let yaml = "when:\n  - event: push\n    branch: main\n";
        let wf = WorkflowSource::from_yaml(yaml).unwrap();
        assert_eq!(&*wf.when[0].event, ["push"]);
        assert_eq!(&*wf.when[0].branch, ["main"]);
        assert!(wf.when[0].tag.is_empty());
    }

    #[test]
    fn test_defaults_are_empty() {
        let wf = WorkflowSource::from_yaml("name: noop").unwrap();
        assert!(wf.when.is_empty());
        assert!(wf.steps.is_empty());
        assert!(!wf.clone_opts.skip);
        assert_eq!(wf.clone_opts.depth, 0);
    }

    #[test]
    fn test_unnamed_step_uses_command_as_name() {
        let source = StepSource {
            name: String::new(),
            command: "make check".into(),
            environment: BTreeMap::new(),
        };
        let step = Step::user(&source);
        assert_eq!(step.name, "make check");
        assert_eq!(step.kind, StepKind::User);
    }
}
