//! Loading an application directory into a [`ConfigSnapshot`].
//!
//! `config/app.json` goes through the `config` crate so that `MELOY__*` environment
//! variables can override single keys (`MELOY__PORT=9000`, `MELOY__CACHE__MAX_ENTRIES=1000`).
//! Server pools and route documents are plain JSON. Every document may carry
//! `/* block */` and whole-line `// comments`, which are stripped before parsing.
use std::{
    fs,
    path::{Path, PathBuf},
};

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::config::models::{AppConfig, ConfigSnapshot, RouteDocument, RouteSource, ServerPool};

pub const APP_CONFIG_FILE: &str = "config/app.json";
pub const SERVERS_FILE: &str = "config/servers.json";
pub const APIS_DIR: &str = "apis";

const MOCK_SUFFIX: &str = ".mock.json";

static BLOCK_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("block comment regex is valid"));

static LINE_COMMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*//.*$").expect("line comment regex is valid"));

/// Errors for a single document inside the application directory
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Remove `/* ... */` blocks and lines whose first non-blank characters are `//`.
pub fn strip_comments(text: &str) -> String {
    let without_blocks = BLOCK_COMMENT_RE.replace_all(text, "");
    LINE_COMMENT_RE.replace_all(&without_blocks, "").into_owned()
}

fn read_document(path: &Path) -> Result<String, LoadError> {
    if !path.exists() {
        return Err(LoadError::NotFound(path.to_path_buf()));
    }
    fs::read_to_string(path)
        .map(|text| strip_comments(&text))
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Load a full snapshot of the application directory.
pub async fn load_snapshot(app_dir: impl AsRef<Path>) -> Result<ConfigSnapshot> {
    load_snapshot_sync(app_dir)
}

/// Load a full snapshot synchronously.
///
/// Only `config/app.json` is mandatory. A broken `servers.json` is logged and
/// treated as an empty pool list; broken route documents are logged and skipped.
pub fn load_snapshot_sync(app_dir: impl AsRef<Path>) -> Result<ConfigSnapshot> {
    let app_dir = app_dir.as_ref();

    let app = load_app_config(app_dir)?;

    let servers = match load_servers(app_dir) {
        Ok(servers) => servers,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load server pools, continuing without upstreams");
            Vec::new()
        }
    };

    let routes = load_routes(app_dir);

    Ok(ConfigSnapshot {
        app,
        servers,
        routes,
    })
}

/// Load `config/app.json` layered with `MELOY__*` environment overrides.
pub fn load_app_config(app_dir: &Path) -> Result<AppConfig> {
    let path = app_dir.join(APP_CONFIG_FILE);
    let text = read_document(&path)?;

    let settings = Config::builder()
        .add_source(File::from_str(&text, FileFormat::Json))
        .add_source(
            Environment::with_prefix("MELOY")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    let app: AppConfig = settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))?;

    Ok(app)
}

/// Load `config/servers.json`.
pub fn load_servers(app_dir: &Path) -> Result<Vec<ServerPool>, LoadError> {
    let path = app_dir.join(SERVERS_FILE);
    let text = read_document(&path)?;
    serde_json::from_str(&text).map_err(|e| LoadError::Parse {
        path,
        message: e.to_string(),
    })
}

/// Recursively load every route document under `apis/`, in file-name order.
pub fn load_routes(app_dir: &Path) -> Vec<RouteSource> {
    let mut routes = Vec::new();
    collect_routes(&app_dir.join(APIS_DIR), &mut routes);
    routes
}

fn collect_routes(dir: &Path, routes: &mut Vec<RouteSource>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Cannot read route directory");
            return;
        }
    };

    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();

    for path in paths {
        if path.is_dir() {
            collect_routes(&path, routes);
            continue;
        }

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(MOCK_SUFFIX) || !name.ends_with(".json") {
            continue;
        }

        match load_route_file(&path) {
            Ok(source) => routes.push(source),
            Err(e) => tracing::error!(error = %e, "Skipping route document"),
        }
    }
}

/// Load one route document and its optional `*.mock.json` sibling.
pub fn load_route_file(path: &Path) -> Result<RouteSource, LoadError> {
    let text = read_document(path)?;
    let document: RouteDocument = serde_json::from_str(&text).map_err(|e| LoadError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mock_path = mock_path_for(path);
    let mock = if mock_path.is_file() {
        match fs::read_to_string(&mock_path) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(file = %mock_path.display(), error = %e, "Cannot read mock data");
                None
            }
        }
    } else {
        None
    };

    Ok(RouteSource {
        file: path.to_path_buf(),
        document,
        mock,
    })
}

fn mock_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = name.strip_suffix(".json").unwrap_or(name);
    path.with_file_name(format!("{stem}{MOCK_SUFFIX}"))
}
