use std::{collections::HashMap, net::SocketAddr};

use http::Method;

use crate::{
    config::models::{AppConfig, RouteDocument, RouteSource, ServerPool},
    core::{access::IpNetwork, units},
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Application configuration validator (`config/app.json`)
pub struct AppConfigValidator;

impl AppConfigValidator {
    /// Validate the whole application configuration, collecting every problem
    pub fn validate(config: &AppConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr()) {
            errors.push(e);
        }

        if let Err(e) = Self::validate_tls(config) {
            errors.push(e);
        }

        for (index, user) in config.users.iter().enumerate() {
            if user.kind != "account" {
                errors.push(ValidationError::InvalidField {
                    field: format!("users[{index}].type"),
                    message: format!("Unsupported user type '{}', expected 'account'", user.kind),
                });
            }
            if user.username.is_empty() || user.password.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("users[{index}].username/password"),
                });
            }
        }

        errors.extend(Self::validate_clients("allow.clients", &config.allow.clients));
        errors.extend(Self::validate_clients("deny.clients", &config.deny.clients));
        errors.extend(Self::validate_clients(
            "admin.allow.clients",
            &config.admin.allow.clients,
        ));

        if config.cache.sweep_interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "cache.sweep_interval_secs".to_string(),
                message: "Sweep interval must be greater than 0".to_string(),
            });
        }

        if config.stats.flush_interval_secs == 0 {
            errors.push(ValidationError::InvalidField {
                field: "stats.flush_interval_secs".to_string(),
                message: "Flush interval must be greater than 0".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "'host' must be an IP address (e.g. '0.0.0.0' or '127.0.0.1')".to_string(),
            });
        }
        Ok(())
    }

    fn validate_tls(config: &AppConfig) -> ValidationResult<()> {
        let has_cert = !config.ssl.cert.is_empty();
        let has_key = !config.ssl.key.is_empty();

        if has_cert != has_key {
            return Err(ValidationError::InvalidTls {
                message: "Both 'ssl.cert' and 'ssl.key' must be provided together".to_string(),
            });
        }

        if has_cert && !std::path::Path::new(&config.ssl.cert).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Certificate file '{}' does not exist", config.ssl.cert),
            });
        }

        if has_key && !std::path::Path::new(&config.ssl.key).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Key file '{}' does not exist", config.ssl.key),
            });
        }

        Ok(())
    }

    fn validate_clients(field: &str, clients: &[String]) -> Vec<ValidationError> {
        clients
            .iter()
            .filter_map(|client| {
                IpNetwork::parse(client)
                    .err()
                    .map(|message| ValidationError::InvalidField {
                        field: format!("{field}: {client}"),
                        message,
                    })
            })
            .collect()
    }
}

/// Server pool validator (`config/servers.json`)
pub struct ServerPoolValidator;

impl ServerPoolValidator {
    pub fn validate(pools: &[ServerPool]) -> ValidationResult<()> {
        let mut errors = Vec::new();
        let mut seen = HashMap::new();

        for (index, pool) in pools.iter().enumerate() {
            if pool.code.is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("servers[{index}].code"),
                });
            } else if let Some(previous) = seen.insert(pool.code.as_str(), index) {
                errors.push(ValidationError::InvalidField {
                    field: format!("servers[{index}].code"),
                    message: format!(
                        "Duplicate server code '{}' (also used by servers[{previous}])",
                        pool.code
                    ),
                });
            }

            for (host_index, host) in pool.hosts.iter().enumerate() {
                if let Err(message) = validate_upstream_url(&host.address) {
                    errors.push(ValidationError::InvalidField {
                        field: format!("servers[{index}].hosts[{host_index}].address"),
                        message,
                    });
                }
            }

            if let Err(e) = units::parse_duration(&pool.request.timeout) {
                errors.push(ValidationError::InvalidField {
                    field: format!("servers[{index}].request.timeout"),
                    message: e.to_string(),
                });
            }
            if let Err(e) = units::parse_size(&pool.request.max_size) {
                errors.push(ValidationError::InvalidField {
                    field: format!("servers[{index}].request.maxSize"),
                    message: e.to_string(),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: format_multiple_errors(errors),
            })
        }
    }
}

/// Route document validator (`apis/**/*.json`)
pub struct RouteDocumentValidator;

impl RouteDocumentValidator {
    /// Validate a single route document
    pub fn validate(document: &RouteDocument) -> ValidationResult<()> {
        let mut errors = Vec::new();
        let path = document.effective_path();

        if path.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "path/pattern".to_string(),
            });
        } else if !path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("route path: {path}"),
                message: "Route paths must start with '/'".to_string(),
            });
        }

        if document.address.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{path}' address"),
            });
        }

        if document.methods.is_empty() {
            errors.push(ValidationError::MissingField {
                field: format!("route '{path}' methods"),
            });
        }

        for method in &document.methods {
            if Method::from_bytes(method.to_uppercase().as_bytes()).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{path}' methods"),
                    message: format!("'{method}' is not a valid HTTP method"),
                });
            }
        }

        if let Err(e) = units::parse_duration(&document.timeout) {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' timeout"),
                message: e.to_string(),
            });
        }

        if let Err(e) = units::parse_size(&document.max_size) {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' maxSize"),
                message: e.to_string(),
            });
        }

        for header in &document.headers {
            if http::HeaderName::from_bytes(header.name.as_bytes()).is_err()
                || http::HeaderValue::from_str(&header.value).is_err()
            {
                errors.push(ValidationError::InvalidField {
                    field: format!("route '{path}' headers"),
                    message: format!("Invalid header '{}: {}'", header.name, header.value),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: format_multiple_errors(errors),
            })
        }
    }

    /// Report documents that declare the same path; the later file wins at load time
    pub fn check_route_conflicts(routes: &[RouteSource]) -> Result<(), Vec<ValidationError>> {
        let mut seen: HashMap<&str, &RouteSource> = HashMap::new();
        let mut errors = Vec::new();

        for source in routes {
            let path = source.document.effective_path();
            if let Some(previous) = seen.insert(path, source) {
                errors.push(ValidationError::RouteConflict {
                    message: format!(
                        "'{path}' is declared by both '{}' and '{}'",
                        previous.file.display(),
                        source.file.display()
                    ),
                });
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

fn validate_upstream_url(url_str: &str) -> Result<(), String> {
    match url::Url::parse(url_str) {
        Ok(url) => {
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(format!(
                    "URL scheme must be http or https, got '{}'",
                    url.scheme()
                ));
            }
            if url.host().is_none() {
                return Err("URL must have a host".to_string());
            }
            Ok(())
        }
        Err(e) => Err(format!("Invalid URL format: {e}")),
    }
}

/// Format multiple validation errors into a single message
pub fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
    if errors.is_empty() {
        return "No errors".to_string();
    }

    if errors.len() == 1 {
        return errors[0].to_string();
    }

    let mut message = format!("Found {} validation errors:\n", errors.len());
    for (i, error) in errors.iter().enumerate() {
        message.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    message
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::models::{HostConfig, UserConfig};

    fn valid_route() -> RouteDocument {
        RouteDocument {
            path: "/echo".to_string(),
            address: "%{server.api}%{api.path}".to_string(),
            methods: vec!["get".to_string(), "POST".to_string()],
            timeout: "2s".to_string(),
            max_size: "1mb".to_string(),
            ..RouteDocument::default()
        }
    }

    #[test]
    fn default_app_config_is_valid() {
        assert!(AppConfigValidator::validate(&AppConfig::default()).is_ok());
    }

    #[test]
    fn rejects_hostname_as_listen_host() {
        let config = AppConfig::builder().host("localhost").build();
        assert!(AppConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn rejects_half_tls_pair() {
        let mut config = AppConfig::default();
        config.ssl.cert = "cert.pem".to_string();
        let err = AppConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("ssl.key"));
    }

    #[test]
    fn collects_all_app_errors() {
        let mut config = AppConfig::builder()
            .allow_client("10.0.0.0/33")
            .deny_client("not-an-ip")
            .build();
        config.users.push(UserConfig {
            kind: "token".to_string(),
            username: String::new(),
            password: String::new(),
        });

        let err = AppConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Found 4 validation errors"));
    }

    #[test]
    fn accepts_cidr_clients() {
        let config = AppConfig::builder()
            .allow_client("192.168.0.0/16")
            .deny_client("::1")
            .build();
        assert!(AppConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn server_pools_need_codes_and_http_hosts() {
        let pools = vec![
            ServerPool {
                code: "api".to_string(),
                hosts: vec![HostConfig {
                    address: "ftp://example.com".to_string(),
                    weight: 1,
                }],
                ..ServerPool::default()
            },
            ServerPool {
                code: "api".to_string(),
                ..ServerPool::default()
            },
        ];

        let err = ServerPoolValidator::validate(&pools).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Duplicate server code"));
        assert!(message.contains("scheme"));
    }

    #[test]
    fn valid_route_passes() {
        assert!(RouteDocumentValidator::validate(&valid_route()).is_ok());
    }

    #[test]
    fn pattern_only_route_is_valid() {
        let route = RouteDocument {
            path: String::new(),
            pattern: "/user/:id".to_string(),
            ..valid_route()
        };
        assert!(RouteDocumentValidator::validate(&route).is_ok());
    }

    #[test]
    fn rejects_relative_path_and_bad_units() {
        let route = RouteDocument {
            path: "echo".to_string(),
            timeout: "soon".to_string(),
            max_size: "huge".to_string(),
            ..valid_route()
        };

        let err = RouteDocumentValidator::validate(&route).unwrap_err();
        assert!(err.to_string().contains("Found 3 validation errors"));
    }

    #[test]
    fn rejects_invalid_method_token() {
        let route = RouteDocument {
            methods: vec!["GE T".to_string()],
            ..valid_route()
        };
        assert!(RouteDocumentValidator::validate(&route).is_err());
    }

    #[test]
    fn detects_duplicate_paths() {
        let a = RouteSource {
            file: PathBuf::from("apis/a.json"),
            document: valid_route(),
            mock: None,
        };
        let b = RouteSource {
            file: PathBuf::from("apis/b.json"),
            ..a.clone()
        };

        let errors = RouteDocumentValidator::check_route_conflicts(&[a, b]).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ValidationError::RouteConflict { .. }));
    }
}
