//! One client run, start to finish.
//!
//! ```text
//! Init → GatherFacts → DetermineIdentity → SoloBranch | ServerBranch
//!      → Converge → Complete | Failed
//! ```
//!
//! The server branch registers the client, builds and saves the node, asks
//! the depot which cookbooks the node needs, synchronizes the cache, and
//! saves the node again around convergence. The solo branch builds the node
//! locally and converges straight from the configured cookbook paths.
//!
//! Handlers run at the end either way. A failed run always returns its
//! original error.

use crate::cache::FsFileCache;
use crate::config::ClientConfig;
use crate::converge::Converger;
use crate::error::{Error, Result};
use crate::facts::{FactGatherer, node_name_from_facts};
use crate::handlers::{HandlerSet, RunStatus};
use crate::paths;
use crate::sync::CacheSynchronizer;
use crate::transport::ServerApi;
use depot::{Node, expand_run_list};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// Where a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    GatherFacts,
    DetermineIdentity,
    SoloBranch,
    ServerBranch,
    Converge,
    Complete,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::GatherFacts => "gather facts",
            Self::DetermineIdentity => "determine identity",
            Self::SoloBranch => "solo",
            Self::ServerBranch => "server",
            Self::Converge => "converge",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Drives a client run through its phases.
pub struct ClientRunController {
    config: ClientConfig,
    facts: Box<dyn FactGatherer>,
    converger: Box<dyn Converger>,
    handlers: HandlerSet,
    server: Option<Box<dyn ServerApi>>,
    cache: FsFileCache,
    phases: Vec<RunPhase>,
    node: Option<Node>,
}

impl ClientRunController {
    pub fn new(config: ClientConfig, facts: Box<dyn FactGatherer>, converger: Box<dyn Converger>) -> Self {
        let cache = FsFileCache::new(config.file_cache_dir());
        Self {
            config,
            facts,
            converger,
            handlers: HandlerSet::new(),
            server: None,
            cache,
            phases: vec![RunPhase::Init],
            node: None,
        }
    }

    /// Depot used by server runs.
    pub fn with_server(mut self, server: Box<dyn ServerApi>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerSet) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn phase(&self) -> RunPhase {
        self.phases.last().copied().unwrap_or(RunPhase::Init)
    }

    /// Every phase entered, in order.
    pub fn phases(&self) -> &[RunPhase] {
        &self.phases
    }

    /// The phase a failed run stopped in.
    pub fn failed_in(&self) -> Option<RunPhase> {
        match self.phases.as_slice() {
            [.., last, RunPhase::Failed] => Some(*last),
            _ => None,
        }
    }

    /// The node as the last run left it.
    pub fn node(&self) -> Option<&Node> {
        self.node.as_ref()
    }

    fn enter(&mut self, phase: RunPhase) {
        log::debug!("Entering phase: {phase}");
        self.phases.push(phase);
    }

    /// Run once. Handlers see the outcome; a failure is returned unchanged.
    pub fn run(&mut self) -> Result<RunStatus> {
        let mut status = RunStatus::start();
        match self.run_phases(&mut status) {
            Ok(()) => {
                self.enter(RunPhase::Complete);
                status.node = self.node.clone();
                status.finish();
                self.handlers.run_report(&status);
                Ok(status)
            }
            Err(e) => {
                self.enter(RunPhase::Failed);
                status.node = self.node.clone();
                status.fail(&e);
                self.handlers.run_exception(&status, &e);
                Err(e)
            }
        }
    }

    fn run_phases(&mut self, status: &mut RunStatus) -> Result<()> {
        self.enter(RunPhase::GatherFacts);
        let facts = self.facts.gather()?;

        self.enter(RunPhase::DetermineIdentity);
        let name = self
            .config
            .node_name
            .clone()
            .or_else(|| node_name_from_facts(&facts))
            .ok_or_else(|| {
                Error::config("cannot determine the node name; set node_name in client.toml")
            })?;
        log::info!("Starting run for node {name}");
        status.node_name = Some(name.clone());

        if self.config.solo {
            self.solo_run(&name, facts, status)
        } else {
            self.server_run(&name, facts, status)
        }
    }

    fn solo_run(&mut self, name: &str, facts: Map<String, Value>, status: &mut RunStatus) -> Result<()> {
        self.enter(RunPhase::SoloBranch);

        let mut node = Node::new(name);
        build_node(&mut node, &self.config, facts)?;
        status.run_list = node.run_list.clone();
        self.node = Some(node.clone());

        let roots: Vec<PathBuf> = self
            .config
            .cookbook_path
            .iter()
            .filter(|p| !p.trim().is_empty())
            .map(|p| paths::expand(p))
            .collect();
        if roots.is_empty() {
            return Err(Error::config("solo runs need at least one cookbook_path"));
        }

        let recipes = expand_run_list(&node.run_list, |role| {
            Err(Error::from(depot::Error::not_found("role", role)))
        })?;

        self.enter(RunPhase::Converge);
        let report = self.converger.converge(&mut node, &recipes, &roots);
        self.node = Some(node);
        status.resources = report?.resources.len();
        Ok(())
    }

    fn server_run(&mut self, name: &str, facts: Map<String, Value>, status: &mut RunStatus) -> Result<()> {
        self.enter(RunPhase::ServerBranch);
        let mut server = self
            .server
            .take()
            .ok_or_else(|| Error::config("no depot configured; set server_url or repository"))?;
        let result = self.run_against(server.as_mut(), name, facts, status);
        self.server = Some(server);
        result
    }

    fn run_against(
        &mut self,
        server: &mut dyn ServerApi,
        name: &str,
        facts: Map<String, Value>,
        status: &mut RunStatus,
    ) -> Result<()> {
        let client_name = self.config.client_name().unwrap_or(name).to_string();
        register(server, &self.config, &client_name)?;

        let mut node = server.load_node(name)?.unwrap_or_else(|| Node::new(name));
        build_node(&mut node, &self.config, facts)?;
        status.run_list = node.run_list.clone();
        persist(server, &mut node)?;
        self.node = Some(node.clone());

        let manifests = server.cookbooks_for_node(name)?;
        log::info!("Node {name} needs {} cookbook(s)", manifests.len());
        let sync = CacheSynchronizer::new(&self.cache, &*server)
            .with_jobs(self.config.sync_jobs)
            .sync_all(&manifests)?;
        status.updated_files = sync.updated.len();
        persist(server, &mut node)?;

        let recipes = expand_run_list(&node.run_list, |role| server.load_role(role))?;
        let roots = vec![self.cache.cookbook_root()];

        self.enter(RunPhase::Converge);
        let report = self.converger.converge(&mut node, &recipes, &roots);
        let saved = persist(server, &mut node);
        self.node = Some(node);
        status.resources = report?.resources.len();
        saved
    }
}

/// Make sure the client holds a credential and present it to the depot.
///
/// An existing key file means the client registered before.
fn register(server: &mut dyn ServerApi, config: &ClientConfig, client_name: &str) -> Result<()> {
    let key_path = config.client_key_path();
    let key = if key_path.exists() {
        log::debug!("Using client key {}", key_path.display());
        std::fs::read_to_string(&key_path)
            .map_err(|e| Error::io(&key_path, e))?
            .trim()
            .to_string()
    } else {
        log::info!("Registering client {client_name}");
        let client = server.register_client(client_name)?;
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        std::fs::write(&key_path, &client.private_key).map_err(|e| Error::io(&key_path, e))?;
        client.private_key
    };
    server.use_credentials(client_name, &key)
}

/// Apply this run's inputs to a node record.
///
/// Facts replace the automatic layer. Default and override are emptied so
/// attributes removed from cookbooks since the last run do not linger.
fn build_node(node: &mut Node, config: &ClientConfig, facts: Map<String, Value>) -> Result<()> {
    if let Some(path) = config.json_attribs_path() {
        log::debug!("Applying attributes from {}", path.display());
        let content = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let attrs: Map<String, Value> = serde_json::from_str(&content)?;
        node.consume_attributes(&attrs)?;
    }
    node.automatic = facts;
    node.reset_transient_attributes();
    Ok(())
}

/// Create the node on first save, update it afterwards.
fn persist(server: &dyn ServerApi, node: &mut Node) -> Result<()> {
    if node.exists_remotely {
        server.update_node(node)?;
    } else {
        log::info!("Creating node {} on the depot", node.name);
        server.create_node(node)?;
        node.exists_remotely = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converge::{ConvergeReport, RecipeCompiler};
    use crate::handlers::tests::Recorder;
    use crate::transport::tests::local_api;
    use crate::upload::{tests::cookbook, upload_cookbook};
    use depot::{Role, RunListItem};
    use serde_json::json;
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;
    use tempfile::TempDir;

    struct StaticFacts {
        facts: Map<String, Value>,
        calls: Rc<RefCell<usize>>,
    }

    impl StaticFacts {
        fn new(hostname: Option<&str>) -> Self {
            let mut facts = Map::new();
            facts.insert("platform".into(), json!("debian"));
            if let Some(host) = hostname {
                facts.insert("hostname".into(), json!(host));
            }
            Self {
                facts,
                calls: Rc::default(),
            }
        }
    }

    impl FactGatherer for StaticFacts {
        fn gather(&mut self) -> Result<Map<String, Value>> {
            *self.calls.borrow_mut() += 1;
            Ok(self.facts.clone())
        }
    }

    /// Records what it was asked to converge.
    #[derive(Default)]
    struct MockConverger {
        seen: Rc<RefCell<Vec<(Vec<String>, Vec<PathBuf>)>>>,
        fail: bool,
    }

    impl Converger for MockConverger {
        fn converge(&mut self, node: &mut Node, recipes: &[String], roots: &[PathBuf]) -> Result<ConvergeReport> {
            self.seen.borrow_mut().push((recipes.to_vec(), roots.to_vec()));
            node.default.insert("converged".into(), json!(true));
            if self.fail {
                return Err(Error::Convergence("resource failed".into()));
            }
            Ok(ConvergeReport::default())
        }
    }

    fn server_config(tmp: &Path) -> ClientConfig {
        ClientConfig {
            client_key: tmp.join("client.key").to_string_lossy().to_string(),
            file_cache_path: tmp.join("cache").to_string_lossy().to_string(),
            repository: Some(tmp.join("depot").to_string_lossy().to_string()),
            ..ClientConfig::default()
        }
    }

    fn publish_ntp(tmp: &TempDir) -> crate::transport::LocalServerApi {
        let api = local_api(tmp);
        let src = tmp.path().join("src");
        let ntp = cookbook(
            &src,
            "ntp",
            &[
                ("metadata.json", r#"{"name": "ntp", "version": "1.0.0", "dependencies": {"base": ">= 0.0.0"}}"#),
                ("recipes/default.rb", "include_recipe \"base\"\npackage \"ntp\"\n"),
                ("attributes/default.rb", "default[\"ntp\"][\"port\"] = 123\n"),
            ],
        );
        let base = cookbook(
            &src,
            "base",
            &[
                ("metadata.json", r#"{"name": "base", "version": "0.1.0"}"#),
                ("recipes/default.rb", "file \"/etc/motd\"\n"),
            ],
        );
        let unused = cookbook(&src, "mysql", &[("recipes/default.rb", "package \"mysql\"\n")]);
        for dir in [ntp, base, unused] {
            upload_cookbook(&api, &dir).unwrap();
        }
        api
    }

    fn with_run_list(api: &crate::transport::LocalServerApi, name: &str, items: &[&str]) {
        let mut node = Node::new(name);
        node.run_list = items.iter().map(|i| i.parse().unwrap()).collect();
        api.create_node(&node).unwrap();
    }

    #[test]
    fn test_server_run_end_to_end() {
        let tmp = TempDir::new().unwrap();
        let api = publish_ntp(&tmp);
        with_run_list(&api, "web1", &["recipe[ntp]"]);

        let config = server_config(tmp.path());
        let mut controller = ClientRunController::new(
            config.clone(),
            Box::new(StaticFacts::new(Some("web1"))),
            Box::new(RecipeCompiler::new()),
        )
        .with_server(Box::new(api));

        let status = controller.run().unwrap();

        assert!(status.success);
        assert_eq!(status.node_name.as_deref(), Some("web1"));
        assert_eq!(status.resources, 2);
        assert_eq!(controller.phase(), RunPhase::Complete);
        assert_eq!(
            controller.phases(),
            &[
                RunPhase::Init,
                RunPhase::GatherFacts,
                RunPhase::DetermineIdentity,
                RunPhase::ServerBranch,
                RunPhase::Converge,
                RunPhase::Complete
            ]
        );

        // Only the closure of the run list reaches the cache.
        let cache = tmp.path().join("cache/cookbooks");
        assert!(cache.join("ntp/recipes/default.rb").is_file());
        assert!(cache.join("base/recipes/default.rb").is_file());
        assert!(!cache.join("mysql").exists());

        // The key was written on registration.
        assert!(tmp.path().join("client.key").is_file());

        let node = controller.node().unwrap();
        assert!(node.exists_remotely);
        assert_eq!(node.automatic["platform"], "debian");
        assert_eq!(node.default["ntp"]["port"], 123);
    }

    #[test]
    fn test_second_run_reuses_key_and_updates_node() {
        let tmp = TempDir::new().unwrap();
        let api = publish_ntp(&tmp);
        with_run_list(&api, "web1", &["ntp"]);
        let config = server_config(tmp.path());

        let mut first = ClientRunController::new(
            config.clone(),
            Box::new(StaticFacts::new(Some("web1"))),
            Box::new(MockConverger::default()),
        )
        .with_server(Box::new(api));
        first.run().unwrap();
        let key = std::fs::read_to_string(tmp.path().join("client.key")).unwrap();

        // A fresh depot handle over the same repository: registering again
        // would fail with a conflict.
        let mut second = ClientRunController::new(
            config,
            Box::new(StaticFacts::new(Some("web1"))),
            Box::new(MockConverger::default()),
        )
        .with_server(Box::new(local_api(&tmp)));
        second.run().unwrap();

        assert_eq!(std::fs::read_to_string(tmp.path().join("client.key")).unwrap(), key);
    }

    #[test]
    fn test_first_run_creates_the_node() {
        let tmp = TempDir::new().unwrap();
        let api = publish_ntp(&tmp);
        let attribs = tmp.path().join("node.json");
        std::fs::write(&attribs, r#"{"run_list": ["recipe[ntp]"]}"#).unwrap();
        let config = ClientConfig {
            json_attribs: Some(attribs.to_string_lossy().to_string()),
            ..server_config(tmp.path())
        };
        assert!(api.load_node("web2").unwrap().is_none());

        let mut controller = ClientRunController::new(
            config,
            Box::new(StaticFacts::new(Some("web2"))),
            Box::new(MockConverger::default()),
        )
        .with_server(Box::new(api));
        let status = controller.run().unwrap();

        assert!(status.success);
        assert!(controller.node().unwrap().exists_remotely);
        assert_eq!(status.node.as_ref().unwrap().name, "web2");

        // Saves after the first one update the record in place.
        let saved = local_api(&tmp).load_node("web2").unwrap().unwrap();
        assert_eq!(saved.run_list, vec![RunListItem::Recipe("ntp".into())]);
        assert_eq!(saved.default["converged"], true);
        assert!(tmp.path().join("cache/cookbooks/ntp/recipes/default.rb").is_file());
    }

    #[test]
    fn test_stale_default_attributes_are_reset() {
        let tmp = TempDir::new().unwrap();
        let api = publish_ntp(&tmp);
        let mut node = Node::new("web1");
        node.run_list = vec![RunListItem::Recipe("base".into())];
        node.default.insert("removed".into(), json!("stale"));
        node.override_.insert("removed".into(), json!("stale"));
        api.create_node(&node).unwrap();

        let mut controller = ClientRunController::new(
            server_config(tmp.path()),
            Box::new(StaticFacts::new(Some("web1"))),
            Box::new(RecipeCompiler::new()),
        )
        .with_server(Box::new(api));
        controller.run().unwrap();

        let node = controller.node().unwrap();
        assert!(node.default.get("removed").is_none());
        assert!(node.override_.get("removed").is_none());
    }

    #[test]
    fn test_roles_expand_on_the_client() {
        let tmp = TempDir::new().unwrap();
        let api = publish_ntp(&tmp);
        api.server()
            .store_role(&Role {
                name: "timekeeper".into(),
                description: String::new(),
                run_list: vec![RunListItem::Recipe("ntp".into())],
                default_attributes: Map::new(),
                override_attributes: Map::new(),
            })
            .unwrap();
        with_run_list(&api, "web1", &["role[timekeeper]"]);

        let converger = MockConverger::default();
        let seen = converger.seen.clone();
        let mut controller = ClientRunController::new(
            server_config(tmp.path()),
            Box::new(StaticFacts::new(Some("web1"))),
            Box::new(converger),
        )
        .with_server(Box::new(api));
        controller.run().unwrap();

        let seen = seen.borrow();
        assert_eq!(seen[0].0, vec!["ntp"]);
        assert_eq!(seen[0].1, vec![tmp.path().join("cache/cookbooks")]);
    }

    #[test]
    fn test_missing_identity_is_configuration_error() {
        let tmp = TempDir::new().unwrap();
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut handlers = HandlerSet::new();
        handlers.add_exception(Recorder {
            name: "recorder",
            fail: false,
            calls: calls.clone(),
        });

        let mut controller = ClientRunController::new(
            server_config(tmp.path()),
            Box::new(StaticFacts::new(None)),
            Box::new(MockConverger::default()),
        )
        .with_handlers(handlers);

        let err = controller.run().unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
        assert_eq!(controller.phase(), RunPhase::Failed);
        assert_eq!(controller.failed_in(), Some(RunPhase::DetermineIdentity));
        assert_eq!(calls.borrow().len(), 1);
        assert!(calls.borrow()[0].starts_with("recorder:failure:-:"));
        assert!(!controller.phases().contains(&RunPhase::ServerBranch));
    }

    #[test]
    fn test_failure_reaches_every_handler_and_is_reraised() {
        let tmp = TempDir::new().unwrap();
        let api = publish_ntp(&tmp);
        with_run_list(&api, "web1", &["ntp"]);

        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut handlers = HandlerSet::new();
        for (name, fail) in [("broken", true), ("healthy", false)] {
            handlers.add_exception(Recorder {
                name,
                fail,
                calls: calls.clone(),
            });
            handlers.add_report(Recorder {
                name,
                fail,
                calls: calls.clone(),
            });
        }

        let mut controller = ClientRunController::new(
            server_config(tmp.path()),
            Box::new(StaticFacts::new(Some("web1"))),
            Box::new(MockConverger {
                fail: true,
                ..MockConverger::default()
            }),
        )
        .with_server(Box::new(api))
        .with_handlers(handlers);

        let err = controller.run().unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Convergence);
        assert!(err.to_string().contains("resource failed"));

        let calls = calls.borrow();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| c.contains(":failure:web1:")));
        // The node is still saved after a failed convergence.
        let node = controller.node().unwrap();
        assert_eq!(node.default["converged"], true);
    }

    #[test]
    fn test_unknown_cookbook_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let api = publish_ntp(&tmp);
        with_run_list(&api, "web1", &["ghost"]);

        let mut controller = ClientRunController::new(
            server_config(tmp.path()),
            Box::new(StaticFacts::new(Some("web1"))),
            Box::new(RecipeCompiler::new()),
        )
        .with_server(Box::new(api));

        let err = controller.run().unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_solo_run_converges_local_cookbooks() {
        let tmp = TempDir::new().unwrap();
        let books = tmp.path().join("cookbooks");
        cookbook(&books, "motd", &[("recipes/default.rb", "file \"/etc/motd\"\n")]);
        let attribs = tmp.path().join("node.json");
        std::fs::write(&attribs, r#"{"run_list": ["recipe[motd]"], "team": "ops"}"#).unwrap();

        let config = ClientConfig {
            solo: true,
            node_name: Some("box1".into()),
            cookbook_path: vec![books.to_string_lossy().to_string()],
            json_attribs: Some(attribs.to_string_lossy().to_string()),
            file_cache_path: tmp.path().join("cache").to_string_lossy().to_string(),
            ..ClientConfig::default()
        };
        let facts = StaticFacts::new(Some("ignored"));
        let fact_calls = facts.calls.clone();
        let mut controller =
            ClientRunController::new(config, Box::new(facts), Box::new(RecipeCompiler::new()));

        let status = controller.run().unwrap();

        assert_eq!(status.resources, 1);
        assert_eq!(*fact_calls.borrow(), 1);
        assert!(controller.phases().contains(&RunPhase::SoloBranch));
        let node = controller.node().unwrap();
        assert_eq!(node.name, "box1");
        assert_eq!(node.normal["team"], "ops");
        assert!(!node.exists_remotely);
    }

    #[test]
    fn test_solo_without_cookbook_path_fails_before_converge() {
        let tmp = TempDir::new().unwrap();
        let converger = MockConverger::default();
        let seen = converger.seen.clone();
        let config = ClientConfig {
            solo: true,
            node_name: Some("box1".into()),
            cookbook_path: vec!["  ".into()],
            file_cache_path: tmp.path().join("cache").to_string_lossy().to_string(),
            ..ClientConfig::default()
        };

        let mut controller = ClientRunController::new(config, Box::new(StaticFacts::new(None)), Box::new(converger));
        let err = controller.run().unwrap_err();

        assert_eq!(err.category(), crate::error::ErrorCategory::Configuration);
        assert!(seen.borrow().is_empty());
        assert!(!controller.phases().contains(&RunPhase::Converge));
    }
}
