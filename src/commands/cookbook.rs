//! Cookbook commands: manifest, deps, upload.

use anyhow::{Context as _, Result, bail};
use depot::RunListItem;
use manifest::{CookbookMetadata, DependencyGraph, ManifestBuilder, build_from_dir, scan_cookbook};
use std::path::{Path, PathBuf};

use crate::Context;
use crate::cli::DepotArgs;
use crate::config::ClientConfig;
use crate::ui;
use crate::upload::upload_cookbook;

pub fn manifest(dir: &Path, version: Option<&str>) -> Result<()> {
    let manifest = match version {
        Some(version) => {
            let metadata = CookbookMetadata::load(dir)?;
            let files = scan_cookbook(dir)?;
            ManifestBuilder::new(metadata.name.clone(), dir)
                .with_metadata(metadata)
                .build(&files, version)?
        }
        None => build_from_dir(dir)?,
    };
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

pub fn deps(ctx: &Context, repo: &Path, items: &[String]) -> Result<()> {
    let graph = load_graph(repo)?;
    let mut recipes = Vec::new();
    for item in items {
        match item.parse::<RunListItem>()? {
            RunListItem::Recipe(name) => recipes.push(name),
            RunListItem::Role(name) => bail!("role[{name}] needs a depot; deps only reads cookbooks"),
        }
    }

    let needed = graph.expand(&recipes)?;
    if !ctx.quiet {
        ui::header(&format!("{} needed", ui::plural(needed.len(), "cookbook")));
    }
    for name in needed {
        println!("{name}");
    }
    Ok(())
}

pub fn upload(ctx: &Context, config: &ClientConfig, depot: &DepotArgs, dirs: &[PathBuf]) -> Result<()> {
    let api = super::connect(depot, config)?;
    for (i, dir) in dirs.iter().enumerate() {
        let report = upload_cookbook(api.as_ref(), dir)
            .with_context(|| format!("uploading {}", dir.display()))?;
        if !ctx.quiet {
            ui::step(
                i + 1,
                dirs.len(),
                &format!(
                    "{} {}: {} uploaded, {} already on the depot",
                    report.cookbook,
                    report.version,
                    ui::plural(report.uploaded, "file"),
                    report.skipped
                ),
            );
        }
    }
    Ok(())
}

/// Dependency graph of every cookbook directory under `repo`.
fn load_graph(repo: &Path) -> Result<DependencyGraph> {
    let mut metadata = Vec::new();
    let entries = std::fs::read_dir(repo).with_context(|| format!("reading {}", repo.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            metadata.push(CookbookMetadata::load(&path)?);
        }
    }
    Ok(DependencyGraph::from_metadata(&metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_graph_reads_every_cookbook() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("apache2")).unwrap();
        fs::write(
            tmp.path().join("apache2/metadata.json"),
            r#"{"name": "apache2", "dependencies": {"logrotate": ">= 1.0"}}"#,
        )
        .unwrap();
        fs::create_dir_all(tmp.path().join("logrotate")).unwrap();
        fs::write(tmp.path().join("README.md"), "not a cookbook").unwrap();

        let graph = load_graph(tmp.path()).unwrap();
        let needed = graph.expand(["apache2::mod_ssl"]).unwrap();
        assert_eq!(needed.into_iter().collect::<Vec<_>>(), vec!["apache2", "logrotate"]);
    }
}
