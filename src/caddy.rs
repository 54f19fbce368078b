//! Caddy admin-API routing: idempotent upsert/delete of reverse-proxy routes.
//!
//! Route identity is the primary hostname (`domains[0]`). Planning is pure
//! over the fetched route list so idempotency can be tested without HTTP.

use serde_json::{Value, json};
use std::time::Duration;
use tracing::info;

use crate::error::{Error, Result};

const ROUTES_PATH: &str = "/config/apps/http/servers/srv0/routes";

/// Proxy capability consumed by the orchestrator and supervisor.
pub trait Proxy {
    /// Route `domains` to `localhost:{port}`; repeat calls are no-ops.
    fn upsert(&mut self, domains: &[String], port: u16) -> Result<()>;
    /// Remove the route whose identifying host matches.
    fn delete(&mut self, hostname: &str) -> Result<()>;
    /// Assert the admin API answers at all.
    fn check_availability(&mut self) -> Result<()>;
}

/// What an upsert must do to the stored route list.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutePlan {
    /// The stored route already matches; leave the config untouched.
    NoChange,
    /// Replace the route at `index` with `route`.
    Patch { index: usize, route: Value },
    /// Append `route` to the route list.
    Append { route: Value },
}

/// The exact route shape Caddy stores for one application instance.
pub fn route_json(domains: &[String], port: u16) -> Value {
    json!({
        "match": [{ "host": domains }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": format!("localhost:{}", port) }]
        }]
    })
}

fn identifying_host(route: &Value) -> Option<&str> {
    route
        .get("match")?
        .get(0)?
        .get("host")?
        .get(0)?
        .as_str()
}

/// Decide how to reconcile the stored routes with the desired state.
pub fn plan_upsert(routes: &[Value], domains: &[String], port: u16) -> RoutePlan {
    let desired = route_json(domains, port);
    let primary = domains[0].as_str();
    for (index, route) in routes.iter().enumerate() {
        if identifying_host(route) == Some(primary) {
            if *route == desired {
                return RoutePlan::NoChange;
            }
            return RoutePlan::Patch {
                index,
                route: desired,
            };
        }
    }
    RoutePlan::Append { route: desired }
}

/// Find the index of the route identified by `hostname`.
pub fn find_route(routes: &[Value], hostname: &str) -> Option<usize> {
    routes
        .iter()
        .position(|route| identifying_host(route) == Some(hostname))
}

/// Blocking client for one host's Caddy admin endpoint.
pub struct CaddyAdmin {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl CaddyAdmin {
    /// Point at an admin endpoint, e.g. `http://127.0.0.1:2019`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn routes_url(&self) -> String {
        format!("{}{}", self.base_url, ROUTES_PATH)
    }

    fn fetch_routes(&self) -> Result<Vec<Value>> {
        let response = self
            .client
            .get(self.routes_url())
            .send()
            .map_err(|err| Error::CaddyUnavailable(err.to_string()))?;
        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::CaddyUpdate {
                status: response.status().as_u16(),
                body: response.text().unwrap_or_default(),
            });
        }
        let body: Value = response.json()?;
        match body {
            Value::Array(routes) => Ok(routes),
            Value::Null => Ok(Vec::new()),
            other => Err(Error::CaddyUpdate {
                status: 200,
                body: format!("unexpected route list shape: {}", other),
            }),
        }
    }

    fn expect_success(response: reqwest::blocking::Response) -> Result<()> {
        if response.status().is_success() {
            return Ok(());
        }
        Err(Error::CaddyUpdate {
            status: response.status().as_u16(),
            body: response.text().unwrap_or_default(),
        })
    }
}

impl Proxy for CaddyAdmin {
    fn upsert(&mut self, domains: &[String], port: u16) -> Result<()> {
        if domains.is_empty() {
            info!("no domains bound; skipping proxy route update");
            return Ok(());
        }
        let routes = self.fetch_routes()?;
        match plan_upsert(&routes, domains, port) {
            RoutePlan::NoChange => Ok(()),
            RoutePlan::Patch { index, route } => {
                let url = format!("{}/{}", self.routes_url(), index);
                let response = self
                    .client
                    .patch(url)
                    .json(&route)
                    .send()
                    .map_err(|err| Error::CaddyUnavailable(err.to_string()))?;
                Self::expect_success(response)
            }
            RoutePlan::Append { route } => {
                let response = self
                    .client
                    .post(self.routes_url())
                    .json(&route)
                    .send()
                    .map_err(|err| Error::CaddyUnavailable(err.to_string()))?;
                Self::expect_success(response)
            }
        }
    }

    fn delete(&mut self, hostname: &str) -> Result<()> {
        let routes = self.fetch_routes()?;
        let Some(index) = find_route(&routes, hostname) else {
            return Ok(());
        };
        let url = format!("{}/{}", self.routes_url(), index);
        let response = self
            .client
            .delete(url)
            .send()
            .map_err(|err| Error::CaddyUnavailable(err.to_string()))?;
        Self::expect_success(response)
    }

    fn check_availability(&mut self) -> Result<()> {
        let url = format!("{}/config/", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| {
                Error::CaddyUnavailable(format!(
                    "{}; is Caddy installed and its admin API listening on 2019?",
                    err
                ))
            })?;
        if !response.status().is_success() {
            return Err(Error::CaddyUnavailable(format!(
                "admin API answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domains(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn upsert_plan_appends_when_absent() {
        let plan = plan_upsert(&[], &domains(&["chat.example.com"]), 10001);
        assert!(matches!(plan, RoutePlan::Append { .. }));
    }

    #[test]
    fn upsert_plan_patches_changed_port() {
        let stored = vec![route_json(&domains(&["chat.example.com"]), 10001)];
        let plan = plan_upsert(&stored, &domains(&["chat.example.com"]), 10002);
        match plan {
            RoutePlan::Patch { index, route } => {
                assert_eq!(index, 0);
                assert_eq!(
                    route["handle"][0]["upstreams"][0]["dial"],
                    "localhost:10002"
                );
            }
            other => panic!("expected patch, got {:?}", other),
        }
    }

    #[test]
    fn repeated_upsert_plan_is_a_no_op() {
        let first = plan_upsert(&[], &domains(&["chat.example.com", "www.example.com"]), 10001);
        let RoutePlan::Append { route } = first else {
            panic!("expected append");
        };
        let stored = vec![route.clone()];
        let again = plan_upsert(&stored, &domains(&["chat.example.com", "www.example.com"]), 10001);
        assert_eq!(again, RoutePlan::NoChange);
        // The stored config is byte-identical after the second upsert.
        assert_eq!(stored[0], route);
    }

    #[test]
    fn reordered_domains_rewrite_the_host_list() {
        let stored = vec![route_json(&domains(&["a.example.com", "b.example.com"]), 10001)];
        let plan = plan_upsert(&stored, &domains(&["a.example.com", "c.example.com"]), 10001);
        match plan {
            RoutePlan::Patch { route, .. } => {
                assert_eq!(route["match"][0]["host"][1], "c.example.com");
            }
            other => panic!("expected patch, got {:?}", other),
        }
    }

    #[test]
    fn find_route_uses_identifying_host_only() {
        let stored = vec![
            route_json(&domains(&["a.example.com", "shared.example.com"]), 10001),
            route_json(&domains(&["b.example.com"]), 10002),
        ];
        assert_eq!(find_route(&stored, "b.example.com"), Some(1));
        // A secondary hostname does not identify a route.
        assert_eq!(find_route(&stored, "shared.example.com"), None);
    }
}
