use anyhow::Result;
use depot::{CookbookServer, Node, RunListItem};

use crate::Context;
use crate::cli::NodeCommand;
use crate::ui;

pub fn run(ctx: &Context, server: &CookbookServer, cmd: NodeCommand) -> Result<()> {
    match cmd {
        NodeCommand::List => {
            let nodes = server.nodes()?;
            if nodes.is_empty() && !ctx.quiet {
                ui::info("No nodes registered");
            }
            for (name, uri) in nodes {
                ui::kv(&name, &uri);
            }
            Ok(())
        }
        NodeCommand::Show { name } => {
            let node = server.node(&name)?;
            println!("{}", serde_json::to_string_pretty(&node)?);
            Ok(())
        }
        NodeCommand::RunList { name, set: None } => {
            for item in server.node(&name)?.run_list {
                println!("{item}");
            }
            Ok(())
        }
        NodeCommand::RunList {
            name,
            set: Some(items),
        } => {
            let run_list = parse_run_list(&items)?;
            set_run_list(server, &name, run_list)?;
            if !ctx.quiet {
                ui::success(&format!("Updated run list of {name}"));
            }
            Ok(())
        }
    }
}

fn parse_run_list(items: &[String]) -> Result<Vec<RunListItem>> {
    Ok(items
        .iter()
        .map(|item| item.parse())
        .collect::<depot::Result<_>>()?)
}

/// Replace a node's run list, creating the node if the depot has never seen it.
fn set_run_list(server: &CookbookServer, name: &str, run_list: Vec<RunListItem>) -> Result<()> {
    match server.node(name) {
        Ok(mut node) => {
            node.run_list = run_list;
            server.update_node(name, &node)?;
        }
        Err(e) if e.is_not_found() => {
            let mut node = Node::new(name);
            node.run_list = run_list;
            server.create_node(&node)?;
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot::DepotConfig;
    use tempfile::TempDir;

    #[test]
    fn test_set_run_list_creates_then_updates() {
        let tmp = TempDir::new().unwrap();
        let server = DepotConfig::new(tmp.path()).open().unwrap();

        set_run_list(&server, "web1", parse_run_list(&["ntp".into()]).unwrap()).unwrap();
        assert_eq!(server.node("web1").unwrap().run_list.len(), 1);

        let items = parse_run_list(&["role[web]".into(), "recipe[ntp::client]".into()]).unwrap();
        set_run_list(&server, "web1", items).unwrap();
        let node = server.node("web1").unwrap();
        assert_eq!(node.run_list[0], RunListItem::Role("web".into()));
        assert_eq!(node.run_list[1].to_string(), "recipe[ntp::client]");
    }

    #[test]
    fn test_parse_run_list_rejects_garbage() {
        assert!(parse_run_list(&["role[".into()]).is_err());
    }
}
