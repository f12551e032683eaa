//! Operator command dispatch for the `deckhand` binary.
//!
//! Startup order is fixed: tracing and config first, then the gates, then
//! the shared store, then one `load_all` pass before any command runs;
//! `unload_all` runs after the last command, which is the "no new work"
//! barrier reloads rely on.

use std::sync::Arc;

use anyhow::Result;
use deckhand_plugins::{
    list_plugin_manifests, render_plugin_list_report, render_plugin_load_summary,
    render_plugin_record, validate_plugin_manifest, PluginHost,
};
use deckhand_sandbox::{CommandGate, PathGate};
use deckhand_store::SharedStore;
use deckhand_tools::{build_tool_catalog, load_context_directory, ChatTool};
use serde_json::json;
use tracing::warn;

use crate::{cli::Cli, config};

pub async fn run(cli: Cli) -> Result<()> {
    let config = config::load_config(cli.config.as_deref())?;
    let db_path = cli.db.clone().unwrap_or(config.store.db_path.clone());
    let plugin_root = cli.plugin_root.clone().unwrap_or(config.plugins.root.clone());

    if cli.plugin_list {
        let report = list_plugin_manifests(&plugin_root)?;
        println!("{}", render_plugin_list_report(&report));
        return Ok(());
    }
    if let Some(manifest) = &cli.plugin_validate {
        let record = validate_plugin_manifest(manifest)?;
        println!("{}", render_plugin_record(&record));
        return Ok(());
    }

    let path_gate = PathGate::new(config.paths.clone())?;
    if let Some(path) = &cli.check_path {
        match path_gate.check_path(path) {
            Ok(real) => println!("path ok: real={}", real.display()),
            Err(denial) => {
                println!("path denied: {denial}");
                std::process::exit(1);
            }
        }
        return Ok(());
    }
    if let Some(dir) = &cli.context_dir {
        let files = load_context_directory(&path_gate, dir, &config.limits)?;
        println!("context load: dir={} files={}", dir, files.len());
        for file in &files {
            println!(
                "context file: path={} bytes={}",
                file.path.display(),
                file.content.len()
            );
        }
        return Ok(());
    }

    let command_gate = Arc::new(CommandGate::new(
        config::command_policy(&config.commands),
        path_gate.clone(),
    ));
    let path_gate = Arc::new(path_gate);

    let store = SharedStore::open(&db_path)?;
    let mut host = PluginHost::new(&plugin_root);
    let summary = host.load_all(&store);
    println!("{}", render_plugin_load_summary(&summary));

    let catalog = build_tool_catalog(
        command_gate,
        path_gate,
        config.limits.clone(),
        store.clone(),
        &host,
    );

    let mut failed = false;
    if let Some(program) = &cli.exec {
        let result = invoke_tool(
            &catalog,
            "run_command",
            json!({ "program": program, "args": cli.exec_args }),
        )
        .await?;
        failed = result;
    } else if let Some(path) = &cli.read {
        let result = invoke_tool(&catalog, "read_file", json!({ "path": path })).await?;
        failed = result;
    } else if cli.tools {
        for tool in &catalog {
            let definition = tool.definition();
            println!(
                "tool: name={} description={}",
                definition.name, definition.description
            );
        }
        for tool in host.tools() {
            println!(
                "plugin tool: name={} plugin={}@{}",
                tool.name, tool.plugin, tool.plugin_version
            );
        }
    } else {
        println!(
            "deckhand ready: {} tools loaded; use --exec, --read, or --tools",
            catalog.len()
        );
    }

    let unload = host.unload_all();
    for failure in &unload.destroy_failures {
        warn!(failure = %failure, "plugin destroy failed during shutdown");
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Runs one catalog tool and prints its JSON content; returns whether the
/// tool reported an error.
async fn invoke_tool(
    catalog: &[Box<dyn ChatTool>],
    name: &str,
    arguments: serde_json::Value,
) -> Result<bool> {
    let Some(tool) = catalog
        .iter()
        .find(|tool| tool.definition().name == name)
    else {
        anyhow::bail!("tool '{name}' is not registered");
    };
    let result = tool.execute(arguments).await;
    println!("{}", serde_json::to_string_pretty(&result.content)?);
    Ok(result.is_error)
}
