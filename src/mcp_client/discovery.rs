//! Server discovery - locate and parse the tool-server config file.
//!
//! Candidates are tried in a fixed order and the first file that parses wins.
//! A file that exists but fails to parse is skipped with a warning so a
//! broken project-local file never masks a good one in the home directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{expand_tilde, interpolate_env_vars};

use super::errors::McpError;
use super::registry::QUALIFIER;
use super::types::{ServerConfig, ServerDescriptor};

/// Conventional servers config file name.
pub const SERVERS_FILE_NAME: &str = "mcp-servers.json";

/// Environment variable holding an explicit servers config path.
pub const SERVERS_ENV_VAR: &str = "TOOLRELAY_SERVERS";

/// Directory under the user home holding the fallback servers config.
const HOME_DIR_NAME: &str = ".toolrelay";

// ─── Search ──────────────────────────────────────────────────────────────────

/// Inputs to the config search. Built from the process environment in
/// production and by hand in tests.
#[derive(Debug, Clone, Default)]
pub struct ServerSearch {
    pub explicit: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
    pub cwd: Option<PathBuf>,
    pub home: Option<PathBuf>,
}

impl ServerSearch {
    /// Capture the search inputs from the running process.
    pub fn from_environment(explicit: Option<&Path>) -> Self {
        Self {
            explicit: explicit.map(Path::to_path_buf),
            env_path: std::env::var_os(SERVERS_ENV_VAR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            cwd: std::env::current_dir().ok(),
            home: dirs::home_dir(),
        }
    }

    /// Every candidate path, in priority order, without duplicates.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = Vec::new();
        let mut push = |p: PathBuf| {
            if !out.contains(&p) {
                out.push(p);
            }
        };

        if let Some(p) = &self.explicit {
            push(p.clone());
        }
        if let Some(p) = &self.env_path {
            push(p.clone());
        }
        if let Some(cwd) = &self.cwd {
            push(cwd.join(SERVERS_FILE_NAME));
        }
        if let Some(home) = &self.home {
            push(home.join(HOME_DIR_NAME).join(SERVERS_FILE_NAME));
        }
        if let Some(cwd) = &self.cwd {
            for parent in cwd.ancestors().skip(1) {
                push(parent.join(SERVERS_FILE_NAME));
            }
        }
        out
    }

    /// Run the search. Re-reads the file system on every call.
    pub fn resolve(&self) -> Result<Vec<ServerDescriptor>, McpError> {
        let candidates = self.candidates();

        for path in &candidates {
            if !path.is_file() {
                continue;
            }
            let raw = match std::fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read servers config");
                    continue;
                }
            };
            match parse_servers_file(&raw) {
                Ok(servers) => {
                    let descriptors = into_descriptors(servers);
                    if descriptors.is_empty() {
                        tracing::warn!(path = %path.display(), "servers config has no enabled servers");
                    } else {
                        tracing::info!(
                            path = %path.display(),
                            count = descriptors.len(),
                            "loaded servers config"
                        );
                    }
                    return Ok(descriptors);
                }
                Err(reason) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %reason,
                        "servers config failed to parse, continuing search"
                    );
                }
            }
        }

        Err(McpError::ConfigNotFound {
            searched: candidates,
        })
    }
}

/// Resolve the enabled tool servers using the process environment.
pub fn resolve_servers(explicit_override: Option<&Path>) -> Result<Vec<ServerDescriptor>, McpError> {
    ServerSearch::from_environment(explicit_override).resolve()
}

/// Pick the named servers out of a resolved list, preserving request order.
pub fn select_servers(
    available: &[ServerDescriptor],
    names: &[String],
) -> Result<Vec<ServerDescriptor>, McpError> {
    names
        .iter()
        .map(|name| {
            available
                .iter()
                .find(|d| &d.name == name)
                .cloned()
                .ok_or_else(|| McpError::UnknownServer {
                    name: name.clone(),
                    known: available.iter().map(|d| d.name.clone()).collect(),
                })
        })
        .collect()
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

/// Parse a servers file into a name-ordered map.
///
/// Accepts a bare `name → config` object or one wrapped under `mcpServers`
/// or `servers`.
fn parse_servers_file(raw: &str) -> Result<BTreeMap<String, ServerConfig>, String> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let obj = value
        .as_object()
        .ok_or_else(|| "top level is not a JSON object".to_string())?;

    let inner = ["mcpServers", "servers"]
        .iter()
        .find_map(|key| obj.get(*key).filter(|v| v.is_object()))
        .cloned()
        .unwrap_or(value);

    serde_json::from_value(inner).map_err(|e| e.to_string())
}

/// Enabled servers only. A name containing the qualifier would make
/// `server__tool` split two ways, so such servers are dropped here.
fn into_descriptors(servers: BTreeMap<String, ServerConfig>) -> Vec<ServerDescriptor> {
    servers
        .into_iter()
        .filter(|(_, cfg)| cfg.enabled)
        .filter(|(name, _)| {
            let usable = !name.contains(QUALIFIER);
            if !usable {
                tracing::warn!(
                    server = %name,
                    separator = QUALIFIER,
                    "server name contains the tool separator, skipping"
                );
            }
            usable
        })
        .map(|(name, cfg)| ServerDescriptor::from_config(&name, interpolate_server(cfg)))
        .collect()
}

fn interpolate_server(cfg: ServerConfig) -> ServerConfig {
    let expand = |s: &str| expand_tilde(&interpolate_env_vars(s));
    ServerConfig {
        command: expand(&cfg.command),
        args: cfg.args.iter().map(|a| expand(a)).collect(),
        env: cfg
            .env
            .into_iter()
            .map(|(k, v)| (k, interpolate_env_vars(&v)))
            .collect(),
        cwd: cfg.cwd.as_deref().map(expand),
        enabled: cfg.enabled,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ONE_SERVER: &str = r#"{"files": {"command": "files-server", "args": ["--root", "/tmp"]}}"#;

    fn search_in(cwd: &Path) -> ServerSearch {
        ServerSearch {
            cwd: Some(cwd.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_explicit_override_wins() {
        let tmp = TempDir::new().unwrap();
        let explicit = tmp.path().join("custom.json");
        std::fs::write(&explicit, r#"{"explicit": {"command": "a"}}"#).unwrap();
        std::fs::write(tmp.path().join(SERVERS_FILE_NAME), ONE_SERVER).unwrap();

        let search = ServerSearch {
            explicit: Some(explicit),
            ..search_in(tmp.path())
        };
        let servers = search.resolve().unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "explicit");
    }

    #[test]
    fn test_env_path_beats_cwd() {
        let tmp = TempDir::new().unwrap();
        let env_file = tmp.path().join("from-env.json");
        std::fs::write(&env_file, r#"{"env": {"command": "a"}}"#).unwrap();
        std::fs::write(tmp.path().join(SERVERS_FILE_NAME), ONE_SERVER).unwrap();

        let search = ServerSearch {
            env_path: Some(env_file),
            ..search_in(tmp.path())
        };
        assert_eq!(search.resolve().unwrap()[0].name, "env");
    }

    #[test]
    fn test_cwd_file_is_found() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(SERVERS_FILE_NAME), ONE_SERVER).unwrap();

        let servers = search_in(tmp.path()).resolve().unwrap();
        assert_eq!(servers[0].name, "files");
        assert_eq!(servers[0].args, vec!["--root", "/tmp"]);
    }

    #[test]
    fn test_home_fallback() {
        let cwd = TempDir::new().unwrap();
        let home = TempDir::new().unwrap();
        std::fs::create_dir(home.path().join(HOME_DIR_NAME)).unwrap();
        std::fs::write(
            home.path().join(HOME_DIR_NAME).join(SERVERS_FILE_NAME),
            r#"{"home": {"command": "h"}}"#,
        )
        .unwrap();

        let search = ServerSearch {
            home: Some(home.path().to_path_buf()),
            ..search_in(cwd.path())
        };
        assert_eq!(search.resolve().unwrap()[0].name, "home");
    }

    #[test]
    fn test_parent_directory_walk() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(tmp.path().join(SERVERS_FILE_NAME), ONE_SERVER).unwrap();

        let servers = search_in(&nested).resolve().unwrap();
        assert_eq!(servers[0].name, "files");
    }

    #[test]
    fn test_unparseable_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("child");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join(SERVERS_FILE_NAME), "{not json").unwrap();
        std::fs::write(tmp.path().join(SERVERS_FILE_NAME), ONE_SERVER).unwrap();

        let servers = search_in(&nested).resolve().unwrap();
        assert_eq!(servers[0].name, "files");
    }

    #[test]
    fn test_nothing_found_lists_searched_paths() {
        let tmp = TempDir::new().unwrap();
        let explicit = tmp.path().join("missing.json");
        let search = ServerSearch {
            explicit: Some(explicit.clone()),
            ..Default::default()
        };
        match search.resolve().unwrap_err() {
            McpError::ConfigNotFound { searched } => assert_eq!(searched, vec![explicit]),
            other => panic!("expected ConfigNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_disabled_servers_filtered_and_sorted() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(SERVERS_FILE_NAME),
            r#"{
                "zeta": {"command": "z"},
                "alpha": {"command": "a"},
                "off": {"command": "o", "enabled": false}
            }"#,
        )
        .unwrap();

        let names: Vec<_> = search_in(tmp.path())
            .resolve()
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn test_server_name_with_separator_is_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(SERVERS_FILE_NAME),
            r#"{
                "a": {"command": "a"},
                "a__b": {"command": "ab"},
                "web_search": {"command": "w"}
            }"#,
        )
        .unwrap();

        let available = search_in(tmp.path()).resolve().unwrap();
        let names: Vec<_> = available.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a", "web_search"]);

        let err = select_servers(&available, &["a__b".to_string()]).unwrap_err();
        assert!(matches!(err, McpError::UnknownServer { .. }));
    }

    #[test]
    fn test_zero_enabled_servers_is_empty_list() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(SERVERS_FILE_NAME),
            r#"{"off": {"command": "o", "enabled": false}}"#,
        )
        .unwrap();
        assert!(search_in(tmp.path()).resolve().unwrap().is_empty());
    }

    #[test]
    fn test_wrapped_mcp_servers_object() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(SERVERS_FILE_NAME),
            r#"{"mcpServers": {"wrapped": {"command": "w"}}}"#,
        )
        .unwrap();
        assert_eq!(search_in(tmp.path()).resolve().unwrap()[0].name, "wrapped");
    }

    #[test]
    fn test_env_interpolation_in_fields() {
        std::env::remove_var("__TOOLRELAY_TEST_UNSET_ROOT__");
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(SERVERS_FILE_NAME),
            r#"{"fs": {
                "command": "server",
                "args": ["${__TOOLRELAY_TEST_UNSET_ROOT__:-/data}"],
                "env": {"TOKEN": "${__TOOLRELAY_TEST_UNSET_ROOT__:-none}"}
            }}"#,
        )
        .unwrap();

        let servers = search_in(tmp.path()).resolve().unwrap();
        assert_eq!(servers[0].args, vec!["/data"]);
        assert_eq!(servers[0].env["TOKEN"], "none");
    }

    #[test]
    fn test_select_servers_unknown_name() {
        let available = vec![ServerDescriptor::from_config(
            "files",
            serde_json::from_str(r#"{"command": "f"}"#).unwrap(),
        )];
        let err = select_servers(&available, &["nope".to_string()]).unwrap_err();
        assert!(matches!(err, McpError::UnknownServer { .. }));
        assert_eq!(select_servers(&available, &["files".to_string()]).unwrap().len(), 1);
    }
}
