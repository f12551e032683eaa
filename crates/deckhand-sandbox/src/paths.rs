//! File-access gate: prefix allowlists, unsafe-prefix vetoes, sensitive
//! pattern screening, and symlink-aware path resolution.

use std::{
    io::Read,
    path::{Component, Path, PathBuf},
};

use aho_corasick::AhoCorasick;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Filename fragments denied regardless of location, matched ASCII
/// case-insensitively against both the logical and the resolved path.
pub const SENSITIVE_PATH_PATTERNS: &[&str] = &[
    ".env",
    ".gnupg",
    ".netrc",
    ".pgpass",
    ".ssh",
    "credentials",
    "htpasswd",
    "id_dsa",
    "id_ed25519",
    "id_rsa",
    "private.key",
    "shadow",
];

/// Extensions accepted by the readable-content check. Extensionless names
/// (conventional build and manifest files) bypass the extension rule but not
/// the binary sniff.
pub const TEXT_FILE_EXTENSIONS: &[&str] = &[
    "cfg", "conf", "csv", "ini", "json", "list", "log", "md", "properties", "service", "sh",
    "socket", "timer", "toml", "txt", "yaml", "yml",
];

const BINARY_SNIFF_BYTES: usize = 512;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
/// Static path policy: where reads are permitted, which nested prefixes veto
/// that permission, and which substrings are always denied.
pub struct PathPolicy {
    pub allowed_prefixes: Vec<PathBuf>,
    pub unsafe_prefixes: Vec<PathBuf>,
    pub sensitive_patterns: Vec<String>,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self {
            allowed_prefixes: vec![
                PathBuf::from("/var/log"),
                PathBuf::from("/opt"),
                PathBuf::from("/etc"),
            ],
            unsafe_prefixes: vec![
                PathBuf::from("/etc/ssl/private"),
                PathBuf::from("/var/log/private"),
            ],
            sensitive_patterns: SENSITIVE_PATH_PATTERNS
                .iter()
                .map(|pattern| (*pattern).to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid path policy: {reason}")]
pub struct InvalidPathPolicy {
    reason: String,
}

#[derive(Debug, Error)]
/// A path the gate refused, carrying the specific rule that rejected it.
pub enum AccessDenied {
    #[error("path '{path}' is outside the allowed directories")]
    OutsideAllowed { path: PathBuf },
    #[error("path '{path}' is under unsafe prefix '{prefix}'")]
    UnsafePrefix { path: PathBuf, prefix: PathBuf },
    #[error("path '{path}' matches sensitive pattern '{pattern}'")]
    SensitivePattern { path: PathBuf, pattern: String },
    #[error("file '{path}' appears to be binary")]
    BinaryContent { path: PathBuf },
    #[error("file extension '{extension}' of '{path}' is not on the text allowlist")]
    ExtensionNotAllowed { path: PathBuf, extension: String },
    #[error("failed to inspect '{path}': {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
/// Public struct `PathGate` used across Deckhand components.
pub struct PathGate {
    policy: PathPolicy,
    sensitive: AhoCorasick,
}

impl PathGate {
    pub fn new(policy: PathPolicy) -> Result<Self, InvalidPathPolicy> {
        let sensitive = AhoCorasick::builder()
            .ascii_case_insensitive(true)
            .build(&policy.sensitive_patterns)
            .map_err(|error| InvalidPathPolicy {
                reason: format!("failed to build sensitive-pattern matcher: {error}"),
            })?;
        Ok(Self { policy, sensitive })
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    /// Validates `raw` and returns the resolved (symlink-followed) path.
    ///
    /// Both the lexically normalized form and the resolved form are screened:
    /// a traversal sequence can be disguised by symlinks in either direction,
    /// so neither representation is trusted alone. Accepted paths are stable
    /// under re-checking.
    pub fn check_path(&self, raw: &str) -> Result<PathBuf, AccessDenied> {
        let input = PathBuf::from(raw);
        let absolute = if input.is_absolute() {
            input
        } else {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(input),
                Err(source) => {
                    return Err(AccessDenied::Inspect {
                        path: input,
                        source,
                    });
                }
            }
        };

        let logical = normalize_lexically(&absolute);
        let real = resolve_symlinks_best_effort(&logical)?;

        self.screen_sensitive(&logical)?;
        self.screen_sensitive(&real)?;
        self.screen_unsafe(&logical)?;
        self.screen_unsafe(&real)?;

        let allowed = self.policy.allowed_prefixes.iter().any(|prefix| {
            let canonical_prefix = resolve_symlinks_best_effort(prefix)
                .unwrap_or_else(|_| prefix.clone());
            real.starts_with(prefix) || real.starts_with(&canonical_prefix)
        });
        if !allowed {
            warn!(path = %real.display(), "path gate denied read outside allowed prefixes");
            return Err(AccessDenied::OutsideAllowed { path: real });
        }

        Ok(real)
    }

    /// Rejects binary files and non-text extensions. Separate from
    /// `check_path` so existence probes do not require opening the file.
    pub fn check_readable_content(&self, path: &Path) -> Result<(), AccessDenied> {
        if let Some(extension) = path.extension() {
            let extension = extension.to_string_lossy().to_ascii_lowercase();
            if !TEXT_FILE_EXTENSIONS.contains(&extension.as_str()) {
                return Err(AccessDenied::ExtensionNotAllowed {
                    path: path.to_path_buf(),
                    extension,
                });
            }
        }

        let mut file = std::fs::File::open(path).map_err(|source| AccessDenied::Inspect {
            path: path.to_path_buf(),
            source,
        })?;
        let mut head = [0u8; BINARY_SNIFF_BYTES];
        let read = file.read(&mut head).map_err(|source| AccessDenied::Inspect {
            path: path.to_path_buf(),
            source,
        })?;
        if head[..read].contains(&0) {
            return Err(AccessDenied::BinaryContent {
                path: path.to_path_buf(),
            });
        }

        Ok(())
    }

    fn screen_sensitive(&self, path: &Path) -> Result<(), AccessDenied> {
        let haystack = path.to_string_lossy();
        if let Some(matched) = self.sensitive.find(haystack.as_ref()) {
            let pattern = self
                .policy
                .sensitive_patterns
                .get(matched.pattern().as_usize())
                .cloned()
                .unwrap_or_default();
            warn!(path = %path.display(), pattern = %pattern, "path gate denied sensitive path");
            return Err(AccessDenied::SensitivePattern {
                path: path.to_path_buf(),
                pattern,
            });
        }
        Ok(())
    }

    fn screen_unsafe(&self, path: &Path) -> Result<(), AccessDenied> {
        for prefix in &self.policy.unsafe_prefixes {
            if path.starts_with(prefix) {
                warn!(path = %path.display(), prefix = %prefix.display(), "path gate denied unsafe prefix");
                return Err(AccessDenied::UnsafePrefix {
                    path: path.to_path_buf(),
                    prefix: prefix.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Resolves `.` and `..` segments without touching the filesystem. `..` at
/// the root stays at the root, matching realpath semantics.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    normalized
}

/// Canonicalizes `path`, resolving symlinks through the deepest existing
/// ancestor and re-appending the missing suffix, so not-yet-existing targets
/// can still be screened (existence probes, read-before-write checks).
fn resolve_symlinks_best_effort(path: &Path) -> Result<PathBuf, AccessDenied> {
    match std::fs::canonicalize(path) {
        Ok(real) => return Ok(real),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(AccessDenied::Inspect {
                path: path.to_path_buf(),
                source,
            });
        }
    }

    let mut missing_suffix: Vec<std::ffi::OsString> = Vec::new();
    let mut cursor = path;
    while !cursor.exists() {
        if let Some(file_name) = cursor.file_name() {
            missing_suffix.push(file_name.to_os_string());
        }
        cursor = match cursor.parent() {
            Some(parent) => parent,
            None => return Ok(path.to_path_buf()),
        };
    }

    let mut real = match std::fs::canonicalize(cursor) {
        Ok(real) => real,
        Err(_) => return Ok(path.to_path_buf()),
    };
    for component in missing_suffix.iter().rev() {
        real.push(component);
    }
    Ok(real)
}
