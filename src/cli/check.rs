//! `check`: validate a catalog without loading it.

use crate::config::Config;
use crate::runtime::pattern::{parse_either, GlobPattern, MatchPattern};
use crate::runtime::{DirectoryCatalog, ResourceCache, Script};

/// A problem found in one script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub script: String,
    pub message: String,
}

/// Every malformed pattern and uncached dependency of `script`.
pub fn check_script(script: &Script, cache: &ResourceCache) -> Vec<Problem> {
    let metadata = script.effective_metadata();
    let mut problems = Vec::new();
    let mut report = |message: String| {
        problems.push(Problem {
            script: script.name.clone(),
            message,
        })
    };

    for pattern in metadata.get("match").into_iter().flatten() {
        if let Err(e) = MatchPattern::parse(pattern) {
            report(format!("@match {}", e));
        }
    }
    for pattern in metadata.get("include").into_iter().flatten() {
        if let Err(e) = GlobPattern::parse(pattern) {
            report(format!("@include {}", e));
        }
    }
    for pattern in metadata.get("exclude").into_iter().flatten() {
        if let Err(e) = parse_either(pattern) {
            report(format!("@exclude {}", e));
        }
    }
    if script.kind.is_page() && !metadata.contains_key("match") && !metadata.contains_key("include")
    {
        report("page script has no @match or @include and never runs".to_string());
    }
    for (key, url) in crate::runtime::compiler::declared_dependencies(&metadata) {
        if !cache.path_for(&url).is_file() {
            report(format!("{} not cached: {}", key, url));
        }
    }
    problems
}

pub fn run_check(config: &Config) -> anyhow::Result<()> {
    let catalog = DirectoryCatalog::new(config.catalog_dir());
    let cache = ResourceCache::new(config.resources_dir());
    let scripts = catalog.load()?;

    let problems: Vec<Problem> = scripts
        .iter()
        .flat_map(|script| check_script(script, &cache))
        .collect();

    for problem in &problems {
        println!("{}: {}", problem.script, problem.message);
    }
    println!("{} scripts checked, {} problems", scripts.len(), problems.len());

    if problems.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("catalog has {} problems", problems.len())
    }
}
