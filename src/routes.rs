//! Reverse-proxy route generation
//!
//! Each routable application gets one Traefik dynamic-configuration file,
//! `<app>.toml`, in the directory the proxy watches. Maps are ordered so the
//! rendered document is byte-identical for identical input.

use crate::config::{AppDefaults, Config};
use crate::models::AppRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const HEADER: &str = "# Managed by hoist. Changes are overwritten on the next deploy.\n";

/// Rendered route file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDef {
    /// File name, e.g. `shop.toml`
    pub name: String,
    pub host: String,
    pub content: String,
}

pub fn route_file_name(app: &str) -> String {
    format!("{}.toml", app)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub http: HttpConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    pub routers: BTreeMap<String, Router>,
    pub services: BTreeMap<String, Service>,
    pub middlewares: BTreeMap<String, Middleware>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Router {
    pub rule: String,
    pub service: String,
    #[serde(rename = "entryPoints")]
    pub entry_points: Vec<String>,
    pub middlewares: Vec<String>,
    pub tls: Tls,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Tls {
    #[serde(rename = "certResolver")]
    pub cert_resolver: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "loadBalancer")]
    pub load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub servers: Vec<Server>,
    #[serde(rename = "healthCheck")]
    pub health_check: HealthCheck,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Server {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthCheck {
    pub path: String,
    pub interval: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Middleware {
    #[serde(rename = "rateLimit")]
    pub rate_limit: RateLimit,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimit {
    pub average: u32,
    pub burst: u32,
}

pub struct RouteGenerator {
    base_domain: String,
    entry_point: String,
    cert_resolver: String,
    defaults: AppDefaults,
}

impl RouteGenerator {
    pub fn new(config: &Config) -> Self {
        Self {
            base_domain: config.proxy.base_domain.clone(),
            entry_point: config.proxy.entry_point.clone(),
            cert_resolver: config.proxy.cert_resolver.clone(),
            defaults: config.defaults.clone(),
        }
    }

    pub fn host(&self, app: &str) -> String {
        format!("{}.{}", app, self.base_domain)
    }

    /// Route for the primary process; `None` when it has no port
    pub fn emit_proxy_route(&self, app: &AppRecord) -> anyhow::Result<Option<RouteDef>> {
        let Some(port) = app.primary_port() else {
            return Ok(None);
        };

        let limits = app.config_overrides.resolve(&self.defaults);
        let host = self.host(&app.name);
        let middleware = format!("{}-ratelimit", app.name);

        let router = Router {
            rule: format!("Host(`{}`)", host),
            service: app.name.clone(),
            entry_points: vec![self.entry_point.clone()],
            middlewares: vec![middleware.clone()],
            tls: Tls {
                cert_resolver: self.cert_resolver.clone(),
            },
        };
        let service = Service {
            load_balancer: LoadBalancer {
                servers: vec![Server {
                    url: format!("http://localhost:{}", port),
                }],
                health_check: HealthCheck {
                    path: limits.health_check_path,
                    interval: format!("{}s", limits.health_check_interval_secs),
                },
            },
        };
        let rate_limit = Middleware {
            rate_limit: RateLimit {
                average: limits.rate_limit_average,
                burst: limits.rate_limit_burst,
            },
        };

        let doc = DynamicConfig {
            http: HttpConfig {
                routers: BTreeMap::from([(app.name.clone(), router)]),
                services: BTreeMap::from([(app.name.clone(), service)]),
                middlewares: BTreeMap::from([(middleware, rate_limit)]),
            },
        };

        let body = toml::to_string(&doc)?;
        Ok(Some(RouteDef {
            name: route_file_name(&app.name),
            host,
            content: format!("{}{}", HEADER, body),
        }))
    }
}
