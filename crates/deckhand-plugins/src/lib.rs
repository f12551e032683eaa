//! Plugin manifest discovery, validation, and lifecycle management for the
//! Deckhand host.
//!
//! Plugins are external processes described by a JSON manifest. A manifest is
//! parsed into a typed record and exhaustively validated before any hook
//! executes; only plugins whose `init` hook completes inside the deadline are
//! promoted, whole, into the loaded registry.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::Write,
    path::{Component, Path, PathBuf},
    process::{Command, Output, Stdio},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use deckhand_store::{PluginStore, SharedStore, TablePrefix};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use wait_timeout::ChildExt;

#[cfg(test)]
use std::sync::{Mutex, OnceLock};

pub const PLUGIN_MANIFEST_SCHEMA_VERSION: u32 = 1;
pub const PLUGIN_MANIFEST_FILE_NAME: &str = "plugin.json";
pub const PLUGIN_HOOK_TIMEOUT_MS_DEFAULT: u64 = 5_000;
pub const PLUGIN_HOOK_TIMEOUT_MS_MAX: u64 = 60_000;
const PLUGIN_HOOK_PAYLOAD_SCHEMA_VERSION: u32 = 1;
const PLUGIN_TOOL_NAME_MIN_CHARS: usize = 3;
const PLUGIN_TOOL_NAME_MAX_CHARS: usize = 50;
const TOOL_CALL_REQUEST_KIND: &str = "tool-call";

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Raw manifest shape parsed from `plugin.json`.
pub struct PluginManifest {
    schema_version: u32,
    name: String,
    version: String,
    #[serde(default)]
    description: Option<String>,
    entrypoint: String,
    #[serde(default)]
    hooks: Vec<PluginHook>,
    #[serde(default)]
    tools: Vec<PluginToolRegistration>,
    #[serde(default)]
    help: Vec<PluginHelpEntry>,
    #[serde(default = "default_plugin_hook_timeout_ms")]
    timeout_ms: u64,
}

fn default_plugin_hook_timeout_ms() -> u64 {
    PLUGIN_HOOK_TIMEOUT_MS_DEFAULT
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
/// Lifecycle hooks a plugin may declare.
pub enum PluginHook {
    Init,
    Destroy,
}

impl PluginHook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Destroy => "destroy",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// A tool a plugin offers to the agent loop.
pub struct PluginToolRegistration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Operator-facing help entry carried by a plugin.
pub struct PluginHelpEntry {
    pub topic: String,
    pub text: String,
}

#[derive(Debug, Clone)]
/// A validated plugin: manifest content plus the resolved entrypoint.
pub struct PluginRecord {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub manifest_path: PathBuf,
    pub entrypoint: PathBuf,
    pub hooks: Vec<PluginHook>,
    pub tools: Vec<PluginToolRegistration>,
    pub help: Vec<PluginHelpEntry>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
/// A plugin tool tagged with its owning plugin, as exposed to the catalog.
pub struct RegisteredPluginTool {
    pub plugin: String,
    pub plugin_version: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub entrypoint: PathBuf,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Result of one plugin tool invocation.
pub struct PluginToolResult {
    pub content: Value,
    pub is_error: bool,
}

/// A fully initialized plugin held by the registry.
pub struct LoadedPlugin {
    pub record: PluginRecord,
    pub prefix: TablePrefix,
    store: PluginStore,
}

impl LoadedPlugin {
    pub fn store(&self) -> &PluginStore {
        &self.store
    }
}

#[derive(Debug, Clone)]
/// Public struct `PluginRejection` used across Deckhand components.
pub struct PluginRejection {
    pub manifest_path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
/// Public struct `PluginLoadSummary` used across Deckhand components.
pub struct PluginLoadSummary {
    pub discovered: usize,
    pub loaded: Vec<String>,
    pub rejected: Vec<PluginRejection>,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Default)]
/// Public struct `PluginUnloadSummary` used across Deckhand components.
pub struct PluginUnloadSummary {
    pub unloaded: Vec<String>,
    pub destroy_failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `PluginListEntry` used across Deckhand components.
pub struct PluginListEntry {
    pub manifest_path: PathBuf,
    pub name: String,
    pub version: String,
    pub tool_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `PluginListInvalidEntry` used across Deckhand components.
pub struct PluginListInvalidEntry {
    pub manifest_path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Public struct `PluginListReport` used across Deckhand components.
pub struct PluginListReport {
    pub list_root: PathBuf,
    pub entries: Vec<PluginListEntry>,
    pub invalid_entries: Vec<PluginListInvalidEntry>,
}

/// Owns the plugin root directory and the registry of loaded plugins.
pub struct PluginHost {
    root: PathBuf,
    registry: BTreeMap<String, LoadedPlugin>,
}

impl PluginHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lists candidate manifest paths in the plugin root: a subdirectory's
    /// `plugin.json`, or a flat `<name>.json`. Non-recursive, sorted, and
    /// restartable (each call re-reads the directory).
    pub fn discover(&self) -> Result<Vec<PathBuf>> {
        discover_manifest_paths(&self.root)
    }

    /// Loads every discovered plugin independently: parse, validate, run
    /// `init` under the manifest deadline, then register atomically. A
    /// failure at any step discards only that candidate; the loop continues.
    pub fn load_all(&mut self, shared: &SharedStore) -> PluginLoadSummary {
        let mut summary = PluginLoadSummary::default();
        let manifest_paths = match self.discover() {
            Ok(paths) => paths,
            Err(error) => {
                summary
                    .diagnostics
                    .push(format!("plugin discovery failed: {error:#}"));
                return summary;
            }
        };
        summary.discovered = manifest_paths.len();

        for manifest_path in manifest_paths {
            match self.load_candidate(&manifest_path, shared) {
                Ok(loaded) => {
                    let name = loaded.record.name.clone();
                    info!(
                        plugin = %name,
                        version = %loaded.record.version,
                        tools = loaded.record.tools.len(),
                        "plugin loaded"
                    );
                    self.registry.insert(name.clone(), loaded);
                    summary.loaded.push(name);
                }
                Err(error) => {
                    warn!(
                        manifest = %manifest_path.display(),
                        error = %format!("{error:#}"),
                        "plugin rejected"
                    );
                    summary.rejected.push(PluginRejection {
                        manifest_path,
                        reason: format!("{error:#}"),
                    });
                }
            }
        }

        summary
    }

    fn load_candidate(&self, manifest_path: &Path, shared: &SharedStore) -> Result<LoadedPlugin> {
        let record = validate_plugin_manifest(manifest_path)?;

        if self.registry.contains_key(&record.name) {
            bail!("plugin name '{}' is already loaded", record.name);
        }
        let registered_tool_names: HashSet<&str> = self
            .registry
            .values()
            .flat_map(|loaded| loaded.record.tools.iter())
            .map(|tool| tool.name.as_str())
            .collect();
        for tool in &record.tools {
            if registered_tool_names.contains(tool.name.as_str()) {
                bail!(
                    "tool name '{}' is already registered by another plugin",
                    tool.name
                );
            }
        }

        let prefix = TablePrefix::for_plugin(&record.name)?;
        let store = shared.plugin_handle(&record.name)?;

        if record.hooks.contains(&PluginHook::Init) {
            let response = run_plugin_hook(
                &record,
                PluginHook::Init,
                &serde_json::json!({ "table_prefix": prefix.as_str() }),
            )
            .with_context(|| format!("plugin '{}' init hook failed", record.name))?;
            apply_response_statements(&store, &response)
                .with_context(|| format!("plugin '{}' init statements failed", record.name))?;
        }

        Ok(LoadedPlugin {
            record,
            prefix,
            store,
        })
    }

    pub fn loaded(&self) -> impl Iterator<Item = &LoadedPlugin> {
        self.registry.values()
    }

    pub fn plugin(&self, name: &str) -> Option<&LoadedPlugin> {
        self.registry.get(name)
    }

    /// Flattened tool list across all loaded plugins, each entry tagged with
    /// its owner. Uniqueness is enforced at registration time.
    pub fn tools(&self) -> Vec<RegisteredPluginTool> {
        self.registry
            .values()
            .flat_map(|loaded| {
                loaded.record.tools.iter().map(|tool| RegisteredPluginTool {
                    plugin: loaded.record.name.clone(),
                    plugin_version: loaded.record.version.clone(),
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                    entrypoint: loaded.record.entrypoint.clone(),
                    timeout_ms: loaded.record.timeout_ms,
                })
            })
            .collect()
    }

    /// Help entries across all loaded plugins, prefixed with the owner name.
    pub fn help_entries(&self) -> Vec<(String, PluginHelpEntry)> {
        self.registry
            .values()
            .flat_map(|loaded| {
                loaded
                    .record
                    .help
                    .iter()
                    .map(|entry| (loaded.record.name.clone(), entry.clone()))
            })
            .collect()
    }

    /// Runs every loaded plugin's `destroy` hook under the manifest deadline,
    /// best-effort, then clears the registry. Destroy failures are logged and
    /// swallowed; shutdown must still complete.
    pub fn unload_all(&mut self) -> PluginUnloadSummary {
        let mut summary = PluginUnloadSummary::default();
        let registry = std::mem::take(&mut self.registry);
        for (name, loaded) in registry {
            if loaded.record.hooks.contains(&PluginHook::Destroy) {
                let outcome = run_plugin_hook(
                    &loaded.record,
                    PluginHook::Destroy,
                    &serde_json::json!({ "table_prefix": loaded.prefix.as_str() }),
                )
                .and_then(|response| apply_response_statements(&loaded.store, &response));
                if let Err(error) = outcome {
                    warn!(plugin = %name, error = %format!("{error:#}"), "plugin destroy failed");
                    summary.destroy_failures.push(format!("{name}: {error:#}"));
                }
            }
            info!(plugin = %name, "plugin unloaded");
            summary.unloaded.push(name);
        }
        summary
    }
}

/// Parses and statically validates a manifest, resolving the entrypoint.
/// No plugin code runs here; a record that fails validation never reaches
/// `init`.
pub fn validate_plugin_manifest(path: &Path) -> Result<PluginRecord> {
    let manifest = load_plugin_manifest(path)?;

    if manifest.schema_version != PLUGIN_MANIFEST_SCHEMA_VERSION {
        bail!(
            "unsupported plugin manifest schema '{}': expected {}",
            manifest.schema_version,
            PLUGIN_MANIFEST_SCHEMA_VERSION
        );
    }
    if manifest.name.trim().is_empty() {
        bail!("plugin manifest 'name' must not be empty");
    }
    TablePrefix::for_plugin(&manifest.name).map_err(|_| {
        anyhow!(
            "plugin name '{}' must be lowercase, start with a letter, and contain only letters, digits, or underscores",
            manifest.name
        )
    })?;
    if manifest.version.trim().is_empty() {
        bail!("plugin manifest 'version' must not be empty");
    }
    validate_unique_hooks(&manifest.hooks)?;
    validate_tool_registrations(&manifest.tools)?;
    validate_help_entries(&manifest.help)?;
    validate_timeout_ms(manifest.timeout_ms)?;
    let entrypoint = resolve_plugin_entrypoint(path, &manifest.entrypoint)?;

    Ok(PluginRecord {
        name: manifest.name,
        version: manifest.version,
        description: manifest
            .description
            .map(|description| description.trim().to_string())
            .filter(|description| !description.is_empty()),
        manifest_path: path.to_path_buf(),
        entrypoint,
        hooks: manifest.hooks,
        tools: manifest.tools,
        help: manifest.help,
        timeout_ms: manifest.timeout_ms,
    })
}

pub fn load_plugin_manifest(path: &Path) -> Result<PluginManifest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read plugin manifest {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse plugin manifest {}", path.display()))
}

/// Validates every manifest under `root` without loading anything.
pub fn list_plugin_manifests(root: &Path) -> Result<PluginListReport> {
    if !root.exists() {
        return Ok(PluginListReport {
            list_root: root.to_path_buf(),
            entries: vec![],
            invalid_entries: vec![],
        });
    }
    if !root.is_dir() {
        bail!("plugin root '{}' is not a directory", root.display());
    }

    let mut entries = Vec::new();
    let mut invalid_entries = Vec::new();
    for manifest_path in discover_manifest_paths(root)? {
        match validate_plugin_manifest(&manifest_path) {
            Ok(record) => entries.push(PluginListEntry {
                manifest_path: record.manifest_path,
                name: record.name,
                version: record.version,
                tool_count: record.tools.len(),
            }),
            Err(error) => invalid_entries.push(PluginListInvalidEntry {
                manifest_path,
                error: format!("{error:#}"),
            }),
        }
    }
    entries.sort_by(|left, right| {
        left.name
            .cmp(&right.name)
            .then_with(|| left.version.cmp(&right.version))
            .then_with(|| left.manifest_path.cmp(&right.manifest_path))
    });
    invalid_entries.sort_by(|left, right| left.manifest_path.cmp(&right.manifest_path));

    Ok(PluginListReport {
        list_root: root.to_path_buf(),
        entries,
        invalid_entries,
    })
}

pub fn render_plugin_list_report(report: &PluginListReport) -> String {
    let mut lines = vec![format!(
        "plugin list: root={} count={} invalid={}",
        report.list_root.display(),
        report.entries.len(),
        report.invalid_entries.len()
    )];
    for entry in &report.entries {
        lines.push(format!(
            "plugin: name={} version={} tools={} manifest={}",
            entry.name,
            entry.version,
            entry.tool_count,
            entry.manifest_path.display()
        ));
    }
    for invalid in &report.invalid_entries {
        lines.push(format!(
            "invalid: manifest={} error={}",
            invalid.manifest_path.display(),
            invalid.error
        ));
    }
    lines.join("\n")
}

pub fn render_plugin_record(record: &PluginRecord) -> String {
    let mut hooks = record
        .hooks
        .iter()
        .map(|hook| hook.as_str().to_string())
        .collect::<Vec<_>>();
    hooks.sort();
    let mut tools = record
        .tools
        .iter()
        .map(|tool| tool.name.clone())
        .collect::<Vec<_>>();
    tools.sort();
    format!(
        "plugin validate: path={} name={} version={} entrypoint={} timeout_ms={} hooks={} tools={}",
        record.manifest_path.display(),
        record.name,
        record.version,
        record.entrypoint.display(),
        record.timeout_ms,
        if hooks.is_empty() {
            "none".to_string()
        } else {
            hooks.join(",")
        },
        if tools.is_empty() {
            "none".to_string()
        } else {
            tools.join(",")
        }
    )
}

pub fn render_plugin_load_summary(summary: &PluginLoadSummary) -> String {
    let mut lines = vec![format!(
        "plugin load: discovered={} loaded={} rejected={}",
        summary.discovered,
        summary.loaded.len(),
        summary.rejected.len()
    )];
    for name in &summary.loaded {
        lines.push(format!("loaded: {name}"));
    }
    for rejection in &summary.rejected {
        lines.push(format!(
            "rejected: manifest={} reason={}",
            rejection.manifest_path.display(),
            rejection.reason
        ));
    }
    for diagnostic in &summary.diagnostics {
        lines.push(format!("diagnostic: {diagnostic}"));
    }
    lines.join("\n")
}

fn discover_manifest_paths(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    let read_dir =
        fs::read_dir(root).with_context(|| format!("failed to read plugin root {}", root.display()))?;
    for entry in read_dir {
        let entry =
            entry.with_context(|| format!("failed to inspect plugin root {}", root.display()))?;
        let path = entry.path();
        if path.is_dir() {
            let manifest_path = path.join(PLUGIN_MANIFEST_FILE_NAME);
            if manifest_path.is_file() {
                paths.push(manifest_path);
            }
            continue;
        }
        if path.extension().and_then(|extension| extension.to_str()) == Some("json")
            && path.is_file()
        {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn validate_unique_hooks(hooks: &[PluginHook]) -> Result<()> {
    let mut seen = HashSet::new();
    for hook in hooks {
        if !seen.insert(hook) {
            bail!("plugin manifest 'hooks' contains duplicate entries");
        }
    }
    Ok(())
}

fn validate_tool_registrations(tools: &[PluginToolRegistration]) -> Result<()> {
    let mut seen = HashSet::new();
    for tool in tools {
        validate_tool_name(&tool.name)?;
        if !seen.insert(tool.name.clone()) {
            bail!(
                "plugin manifest tools contain duplicate name '{}'",
                tool.name
            );
        }
        if tool.description.trim().is_empty() {
            bail!(
                "plugin manifest tool '{}' description must not be empty",
                tool.name
            );
        }
        validate_tool_parameters_schema(&tool.name, &tool.parameters)?;
    }
    Ok(())
}

fn validate_tool_name(name: &str) -> Result<()> {
    let length = name.chars().count();
    if !(PLUGIN_TOOL_NAME_MIN_CHARS..=PLUGIN_TOOL_NAME_MAX_CHARS).contains(&length) {
        bail!(
            "plugin tool name '{}' must be between {} and {} characters",
            name,
            PLUGIN_TOOL_NAME_MIN_CHARS,
            PLUGIN_TOOL_NAME_MAX_CHARS
        );
    }
    let mut characters = name.chars();
    let Some(first) = characters.next() else {
        bail!("plugin tool name must not be empty");
    };
    if !first.is_ascii_lowercase() {
        bail!(
            "plugin tool name '{}' must start with a lowercase letter",
            name
        );
    }
    if !characters.all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    }) {
        bail!(
            "plugin tool name '{}' must contain only lowercase letters, digits, or underscores",
            name
        );
    }
    Ok(())
}

fn validate_tool_parameters_schema(name: &str, schema: &Value) -> Result<()> {
    let schema_object = schema
        .as_object()
        .ok_or_else(|| anyhow!("plugin tool '{}' parameters must be a JSON object", name))?;
    let schema_type = schema_object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            anyhow!(
                "plugin tool '{}' parameters must include string field 'type'",
                name
            )
        })?;
    if schema_type != "object" {
        bail!(
            "plugin tool '{}' parameters field 'type' must be 'object'",
            name
        );
    }
    if let Some(properties) = schema_object.get("properties") {
        if !properties.is_object() {
            bail!(
                "plugin tool '{}' parameters field 'properties' must be a JSON object",
                name
            );
        }
    }
    Ok(())
}

fn validate_help_entries(entries: &[PluginHelpEntry]) -> Result<()> {
    for entry in entries {
        if entry.topic.trim().is_empty() {
            bail!("plugin manifest help topics must not be empty");
        }
        if entry.text.trim().is_empty() {
            bail!(
                "plugin manifest help entry '{}' text must not be empty",
                entry.topic
            );
        }
    }
    Ok(())
}

fn validate_timeout_ms(timeout_ms: u64) -> Result<()> {
    if timeout_ms == 0 {
        bail!("plugin manifest 'timeout_ms' must be greater than 0");
    }
    if timeout_ms > PLUGIN_HOOK_TIMEOUT_MS_MAX {
        bail!(
            "plugin manifest 'timeout_ms' must be <= {}",
            PLUGIN_HOOK_TIMEOUT_MS_MAX
        );
    }
    Ok(())
}

fn resolve_plugin_entrypoint(manifest_path: &Path, entrypoint: &str) -> Result<PathBuf> {
    let trimmed = entrypoint.trim();
    if trimmed.is_empty() {
        bail!("plugin manifest 'entrypoint' must not be empty");
    }
    let relative = Path::new(trimmed);
    if relative.is_absolute() {
        bail!("plugin manifest entrypoint '{}' must be relative", trimmed);
    }
    for component in relative.components() {
        match component {
            Component::ParentDir => {
                bail!(
                    "plugin manifest entrypoint '{}' must not contain parent traversals",
                    trimmed
                );
            }
            Component::Prefix(_) | Component::RootDir => {
                bail!("plugin manifest entrypoint '{}' must be relative", trimmed);
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    let manifest_dir = manifest_path.parent().ok_or_else(|| {
        anyhow!(
            "plugin manifest path '{}' has no parent directory",
            manifest_path.display()
        )
    })?;
    let manifest_dir = manifest_dir.canonicalize().with_context(|| {
        format!(
            "failed to resolve plugin directory {}",
            manifest_dir.display()
        )
    })?;
    let candidate = manifest_dir.join(relative);
    let resolved = candidate.canonicalize().with_context(|| {
        format!("failed to resolve plugin entrypoint {}", candidate.display())
    })?;
    if !resolved.starts_with(&manifest_dir) {
        bail!(
            "plugin entrypoint '{}' resolves outside the plugin directory",
            trimmed
        );
    }
    if !resolved.is_file() {
        bail!(
            "plugin entrypoint '{}' is not a regular file",
            resolved.display()
        );
    }
    Ok(resolved)
}

/// Executes one registered plugin tool. Response-carried statements run
/// through the plugin's isolation handle before the content is returned.
pub fn execute_plugin_tool(
    tool: &RegisteredPluginTool,
    store: &PluginStore,
    arguments: &Value,
) -> Result<PluginToolResult> {
    let request = serde_json::json!({
        "schema_version": PLUGIN_HOOK_PAYLOAD_SCHEMA_VERSION,
        "hook": TOOL_CALL_REQUEST_KIND,
        "plugin": tool.plugin,
        "version": tool.plugin_version,
        "tool": {
            "name": tool.name,
            "arguments": arguments,
        },
    });
    let request_json = serde_json::to_string(&request)
        .context("failed to serialize plugin tool request payload")?;
    let response = run_plugin_entrypoint(&tool.entrypoint, &request_json, tool.timeout_ms)?;
    apply_response_statements(store, &response)
        .with_context(|| format!("plugin tool '{}' statements failed", tool.name))?;

    let object = response
        .as_object()
        .ok_or_else(|| anyhow!("plugin tool '{}' response must be a JSON object", tool.name))?;
    let content = object.get("content").cloned().ok_or_else(|| {
        anyhow!(
            "plugin tool '{}' response must include field 'content'",
            tool.name
        )
    })?;
    let is_error = object
        .get("is_error")
        .map(|value| {
            value.as_bool().ok_or_else(|| {
                anyhow!(
                    "plugin tool '{}' field 'is_error' must be a boolean",
                    tool.name
                )
            })
        })
        .transpose()?
        .unwrap_or(false);

    Ok(PluginToolResult { content, is_error })
}

fn run_plugin_hook(record: &PluginRecord, hook: PluginHook, data: &Value) -> Result<Value> {
    let request = serde_json::json!({
        "schema_version": PLUGIN_HOOK_PAYLOAD_SCHEMA_VERSION,
        "hook": hook.as_str(),
        "plugin": record.name,
        "version": record.version,
        "data": data,
    });
    let request_json = serde_json::to_string(&request)
        .context("failed to serialize plugin hook request payload")?;
    run_plugin_entrypoint(&record.entrypoint, &request_json, record.timeout_ms)
}

fn run_plugin_entrypoint(entrypoint: &Path, request_json: &str, timeout_ms: u64) -> Result<Value> {
    let started_at = Instant::now();
    let output = run_plugin_process_with_timeout(entrypoint, request_json, timeout_ms)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.is_empty() {
            bail!(
                "plugin process exited with non-zero status {}",
                output.status
            );
        }
        bail!(
            "plugin process exited with non-zero status {}: {}",
            output.status,
            stderr
        );
    }
    let response_raw =
        String::from_utf8(output.stdout).context("plugin process output is not valid UTF-8")?;
    if response_raw.trim().is_empty() {
        bail!("plugin process returned empty response");
    }
    let response = serde_json::from_str::<Value>(&response_raw)
        .context("plugin process response must be valid JSON")?;
    if !response.is_object() {
        bail!("plugin process response must be a JSON object");
    }
    tracing::debug!(
        entrypoint = %entrypoint.display(),
        duration_ms = started_at.elapsed().as_millis() as u64,
        "plugin process completed"
    );
    Ok(response)
}

/// Applies the optional `statements` array of a hook or tool response through
/// the plugin's isolation handle. Returns how many statements ran.
fn apply_response_statements(store: &PluginStore, response: &Value) -> Result<usize> {
    let Some(statements) = response.get("statements") else {
        return Ok(0);
    };
    let statements = statements
        .as_array()
        .ok_or_else(|| anyhow!("plugin response field 'statements' must be an array"))?;
    let mut applied = 0;
    for statement in statements {
        let sql = statement
            .as_str()
            .ok_or_else(|| anyhow!("plugin response statements must be strings"))?;
        store.execute(sql, [])?;
        applied += 1;
    }
    Ok(applied)
}

#[cfg(test)]
fn plugin_process_test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .expect("plugin process test lock")
}

fn format_plugin_stdin_payload(request_json: &str) -> String {
    let mut payload = String::with_capacity(request_json.len() + 1);
    payload.push_str(request_json);
    payload.push('\n');
    payload
}

fn shell_fallback_candidates() -> &'static [&'static str] {
    #[cfg(unix)]
    {
        &["/bin/sh", "sh"]
    }
    #[cfg(not(unix))]
    {
        &["sh"]
    }
}

fn run_plugin_process_with_timeout(
    entrypoint: &Path,
    request_json: &str,
    timeout_ms: u64,
) -> Result<Output> {
    #[cfg(test)]
    let _guard = plugin_process_test_guard();

    let spawn_child = |command: &mut Command| {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    };
    let mut child = match spawn_child(&mut Command::new(entrypoint)) {
        Ok(child) => child,
        Err(error) => {
            let mut fallback_errors = Vec::new();
            let mut spawned = None;
            for candidate in shell_fallback_candidates() {
                let mut fallback = Command::new(candidate);
                fallback.arg(entrypoint);
                match spawn_child(&mut fallback) {
                    Ok(child) => {
                        spawned = Some(child);
                        break;
                    }
                    Err(candidate_error) => {
                        fallback_errors.push(format!("{candidate}: {candidate_error}"));
                    }
                }
            }
            match spawned {
                Some(child) => child,
                None => {
                    return Err(anyhow!(
                        "failed to spawn plugin process {}: {} (fallback attempts failed: {})",
                        entrypoint.display(),
                        error,
                        fallback_errors.join("; ")
                    ));
                }
            }
        }
    };

    {
        let stdin_payload = format_plugin_stdin_payload(request_json);
        let stdin = child
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("failed to open plugin process stdin"))?;
        stdin
            .write_all(stdin_payload.as_bytes())
            .context("failed to write plugin payload to process stdin")?;
        stdin
            .flush()
            .context("failed to flush plugin payload to process stdin")?;
    }
    child.stdin.take();

    let timeout = Duration::from_millis(timeout_ms);
    if child
        .wait_timeout(timeout)
        .context("failed while waiting for plugin process")?
        .is_none()
    {
        let _ = child.kill();
        let _ = child.wait();
        bail!("plugin process timed out after {} ms", timeout_ms);
    }

    child
        .wait_with_output()
        .context("failed to collect plugin process output")
}
