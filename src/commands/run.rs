use anyhow::Result;

use crate::Context;
use crate::cli::RunArgs;
use crate::config::ClientConfig;
use crate::converge::RecipeCompiler;
use crate::facts::SystemFacts;
use crate::handlers::HandlerSet;
use crate::run::{ClientRunController, RunPhase};
use crate::ui;

pub fn run(ctx: &Context, args: RunArgs) -> Result<()> {
    let mut config = ClientConfig::load(ctx.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let handlers = HandlerSet::from_config(&config.handlers, config.json_report_dir());
    let mut controller = ClientRunController::new(
        config.clone(),
        Box::new(SystemFacts::new()),
        Box::new(RecipeCompiler::new()),
    )
    .with_handlers(handlers);
    if !config.solo {
        controller = controller.with_server(super::connect(&args.depot, &config)?);
    }

    match controller.run() {
        Ok(status) => {
            if !ctx.quiet {
                ui::success(&format!(
                    "Converged {} in {}",
                    status.node_name.as_deref().unwrap_or("node"),
                    ui::duration(status.elapsed_secs())
                ));
                ui::kv("Cache", &format!("{} updated", ui::plural(status.updated_files, "file")));
                ui::kv("Resources", &status.resources.to_string());
            }
            Ok(())
        }
        Err(e) => {
            let category = e.category();
            let phase = controller.failed_in().unwrap_or(RunPhase::Init);
            ui::error(&format!("Run failed in phase '{phase}': {e}"));
            ui::dim(&format!("{category}: {}", category.advice()));
            Err(e.into())
        }
    }
}

/// Command-line flags win over client.toml.
fn apply_overrides(config: &mut ClientConfig, args: &RunArgs) {
    if args.solo {
        config.solo = true;
    }
    if let Some(name) = &args.node_name {
        config.node_name = Some(name.clone());
    }
    if let Some(path) = &args.json_attribs {
        config.json_attribs = Some(path.to_string_lossy().to_string());
    }
    if !args.cookbook_path.is_empty() {
        config.cookbook_path = args
            .cookbook_path
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
    }
    if let Some(repo) = &args.depot.repo {
        config.repository = Some(repo.to_string_lossy().to_string());
        config.server_url = None;
    }
    if let Some(url) = &args.depot.server {
        config.server_url = Some(url.clone());
        config.repository = None;
    }
    if let Some(jobs) = args.jobs {
        config.sync_jobs = jobs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::DepotArgs;
    use std::path::PathBuf;

    #[test]
    fn test_flags_override_config() {
        let mut config = ClientConfig {
            server_url: Some("http://depot".into()),
            sync_jobs: 2,
            ..ClientConfig::default()
        };
        let args = RunArgs {
            solo: false,
            depot: DepotArgs {
                repo: Some(PathBuf::from("/srv/depot")),
                server: None,
            },
            node_name: Some("web1".into()),
            json_attribs: None,
            cookbook_path: Vec::new(),
            jobs: Some(8),
        };

        apply_overrides(&mut config, &args);

        assert_eq!(config.repository.as_deref(), Some("/srv/depot"));
        assert!(config.server_url.is_none());
        assert_eq!(config.node_name.as_deref(), Some("web1"));
        assert_eq!(config.sync_jobs, 8);
        config.validate().unwrap();
    }
}
