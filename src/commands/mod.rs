pub mod cookbook;
pub mod node;
pub mod run;

use crate::config::ClientConfig;
use crate::transport::{HttpServerApi, LocalServerApi, ServerApi};
use crate::cli::DepotArgs;
use anyhow::{Result, bail};
use depot::DepotConfig;

/// Open the depot named on the command line, falling back to client.toml.
pub fn connect(args: &DepotArgs, config: &ClientConfig) -> Result<Box<dyn ServerApi>> {
    if let Some(repo) = args.repo.clone().or_else(|| config.repository_dir()) {
        log::debug!("Using local depot at {}", repo.display());
        let server = DepotConfig::new(repo).open()?;
        return Ok(Box::new(LocalServerApi::new(server)));
    }
    if let Some(url) = args.server.as_ref().or(config.server_url.as_ref()) {
        log::debug!("Using depot at {url}");
        return Ok(Box::new(HttpServerApi::new(url.as_str(), config.retry.clone())));
    }
    bail!("no depot given; pass --repo or --server, or set repository or server_url in client.toml")
}

/// Open a local depot directory.
pub fn open_local(args: &DepotArgs, config: &ClientConfig) -> Result<depot::CookbookServer> {
    match args.repo.clone().or_else(|| config.repository_dir()) {
        Some(repo) => Ok(DepotConfig::new(repo).open()?),
        None => bail!("this command needs a local depot; pass --repo or set repository in client.toml"),
    }
}
