// System step composition: nix config, clone, dependency installs
//
// System steps always run before user steps. The clone step materializes the
// triggering commit into the shared workspace volume.

use spindle_core::{CloneOpts, Step, TriggerMetadata, WorkflowSource};

/// Workspace mount point inside step containers; also HOME
pub const WORKSPACE_DIR: &str = "/tangled/workspace";
/// Dependency-cache mount point (XDG_CACHE_HOME)
pub const CACHE_DIR: &str = "/tangled/cache";
/// Registry whose packages go into the base image instead of an install step
pub const DEFAULT_REGISTRY: &str = "nixpkgs";
/// Host alias reachable from inside dev containers
pub const DEV_HOST_ALIAS: &str = "host.docker.internal";

/// Base image for a workflow: a nixery image carrying a shell, git and the
/// workflow's nixpkgs dependencies
pub fn resolve_image(nixery_host: &str, source: &WorkflowSource) -> String {
    let mut parts = vec!["shell", "git"];
    if let Some(packages) = source.dependencies.get(DEFAULT_REGISTRY) {
        for package in packages {
            if !parts.contains(&package.as_str()) {
                parts.push(package);
            }
        }
    }
    format!("{nixery_host}/{}", parts.join("/"))
}

/// Enable the nix features the install steps rely on
pub fn nix_config_step() -> Step {
    Step::system(
        "configure nix",
        "mkdir -p /etc/nix && printf 'experimental-features = nix-command flakes\\n' >> /etc/nix/nix.conf",
    )
}

/// Fetch the triggering commit into the workspace. Returns None when the
/// workflow opts out of cloning.
pub fn clone_step(trigger: &TriggerMetadata, opts: &CloneOpts, dev: bool) -> Option<Step> {
    if opts.skip {
        return None;
    }

    let repo = &trigger.repo;
    let scheme = if dev { "http" } else { "https" };
    let host = if dev {
        // The knot listens on the host in dev; containers reach it through
        // the docker-network alias
        repo.knot.replacen("localhost", DEV_HOST_ALIAS, 1)
    } else {
        repo.knot.clone()
    };
    let url = format!("{scheme}://{host}/{}/{}", repo.did, repo.repo);

    let depth = if opts.depth > 0 { opts.depth } else { 1 };
    let mut fetch = format!("git fetch --depth={depth}");
    if opts.submodules {
        fetch.push_str(" --recurse-submodules=yes");
    }
    fetch.push_str(" origin");
    // Manual triggers carry no sha; fetch the remote HEAD instead
    if let Some(sha) = trigger.sha() {
        fetch.push(' ');
        fetch.push_str(sha);
    }

    let command = [
        "git init".to_string(),
        format!("git remote add origin {url}"),
        fetch,
        "git checkout FETCH_HEAD".to_string(),
    ]
    .join(" && ");

    Some(Step::system("clone", command))
}

/// One install step per non-default registry
pub fn dependency_steps(source: &WorkflowSource) -> Vec<Step> {
    source
        .dependencies
        .iter()
        .filter(|(registry, packages)| *registry != DEFAULT_REGISTRY && !packages.is_empty())
        .map(|(registry, packages)| {
            let refs = packages
                .iter()
                .map(|p| format!("{registry}#{p}"))
                .collect::<Vec<_>>()
                .join(" ");
            Step::system(
                format!("install {registry} dependencies"),
                format!("nix profile install {refs}"),
            )
        })
        .collect()
}

/// Full step sequence: system setup first, then the user's steps
pub fn compose_steps(source: &WorkflowSource, trigger: &TriggerMetadata, dev: bool) -> Vec<Step> {
    let mut steps = vec![nix_config_step()];
    steps.extend(clone_step(trigger, &source.clone_opts, dev));
    steps.extend(dependency_steps(source));
    steps.extend(source.steps.iter().map(Step::user));
    steps
}
