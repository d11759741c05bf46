//! OpenStack REST client
//!
//! Authenticates against Keystone v3 with a password scoped to a project, picks
//! the public `network` and `compute` endpoints for the configured region out of
//! the service catalog, and talks to Neutron and Nova with the issued token. A
//! token rejected with 401 triggers one re-authentication.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    FloatingIp, KeyPair, ListFilter, Network, NetworkProvider, Router, SecurityGroup,
    SecurityGroupRule, Server, Subnet, SubnetSpec,
};
use crate::config::OpenStackCredentials;
use crate::{Error, Result};

const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const NEUTRON_VERSION: &str = "/v2.0";

#[derive(Clone, Copy, Debug)]
enum Service {
    Network,
    Compute,
}

impl Service {
    fn catalog_type(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Compute => "compute",
        }
    }
}

#[derive(Clone, Debug)]
struct Session {
    token: String,
    network_url: String,
    compute_url: String,
}

impl Session {
    fn endpoint(&self, service: Service) -> &str {
        match service {
            Service::Network => &self.network_url,
            Service::Compute => &self.compute_url,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

impl Token {
    fn public_endpoint(&self, service: Service, region: &str) -> Result<String> {
        self.catalog
            .iter()
            .filter(|entry| entry.type_ == service.catalog_type())
            .flat_map(|entry| entry.endpoints.iter())
            .find(|ep| {
                ep.interface == "public"
                    && (ep.region.as_deref() == Some(region)
                        || ep.region_id.as_deref() == Some(region))
            })
            .map(|ep| ep.url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                Error::setup(format!(
                    "service catalog has no public {} endpoint in region {region}",
                    service.catalog_type()
                ))
            })
    }
}

/// Keystone identity endpoint for an auth URL given with or without `/v3`
fn identity_url(auth_url: &str) -> String {
    let base = auth_url.trim_end_matches('/');
    if base.ends_with("/v3") {
        base.to_string()
    } else {
        format!("{base}/v3")
    }
}

/// Neutron endpoints are registered with or without the API version
fn neutron_url(endpoint: &str) -> String {
    if endpoint.ends_with(NEUTRON_VERSION) {
        endpoint.to_string()
    } else {
        format!("{endpoint}{NEUTRON_VERSION}")
    }
}

/// Take `key` out of a response body and decode it
fn decode<T: DeserializeOwned>(mut body: Value, key: &str) -> Result<T> {
    let inner = body
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| Error::serialization(format!("response has no '{key}' field")))?;
    Ok(serde_json::from_value(inner)?)
}

/// Turn a provider 404 into a typed not-found error
fn absent<'a>(kind: &'static str, id: &'a str) -> impl FnOnce(Error) -> Error + 'a {
    move |e| match e {
        Error::Provider { status: 404, .. } => Error::not_found(kind, id),
        other => other,
    }
}

/// [`NetworkProvider`] over the OpenStack public APIs
pub struct OpenStackClient {
    http: reqwest::Client,
    credentials: OpenStackCredentials,
    session: RwLock<Option<Session>>,
}

impl OpenStackClient {
    /// Create a client; authentication happens on the first request
    pub fn new(credentials: OpenStackCredentials) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("infra-harness/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            credentials,
            session: RwLock::new(None),
        })
    }

    async fn authenticate(&self) -> Result<Session> {
        let c = &self.credentials;
        let url = format!("{}/auth/tokens", identity_url(&c.auth_url));
        let body = json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": c.user_name,
                            "domain": {"name": c.domain_name},
                            "password": c.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": c.tenant_name,
                        "domain": {"name": c.domain_name},
                    }
                }
            }
        });

        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(Error::provider(
                status.as_u16(),
                format!("keystone authentication failed: {message}"),
            ));
        }

        let token = resp
            .headers()
            .get(SUBJECT_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::provider(status.as_u16(), "keystone returned no token"))?;
        let issued: TokenResponse = resp.json().await?;

        let session = Session {
            token,
            network_url: neutron_url(&issued.token.public_endpoint(Service::Network, &c.region)?),
            compute_url: issued.token.public_endpoint(Service::Compute, &c.region)?,
        };
        info!(
            user = %c.user_name,
            project = %c.tenant_name,
            region = %c.region,
            "Authenticated with Keystone"
        );
        Ok(session)
    }

    async fn session(&self) -> Result<Session> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        let mut guard = self.session.write().await;
        if let Some(session) = guard.clone() {
            return Ok(session);
        }
        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Send one request and return the JSON body (`Null` when there is none)
    async fn call(
        &self,
        service: Service,
        method: Method,
        path: &str,
        query: &[(&'static str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut reauthenticated = false;
        loop {
            let session = self.session().await?;
            let url = format!("{}{path}", session.endpoint(service));
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(AUTH_TOKEN_HEADER, &session.token)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            let resp = request.send().await?;
            let status = resp.status();
            if status == StatusCode::UNAUTHORIZED && !reauthenticated {
                debug!(path = %path, "Token rejected, re-authenticating");
                *self.session.write().await = None;
                reauthenticated = true;
                continue;
            }
            if !status.is_success() {
                let message = resp.text().await.unwrap_or_default();
                return Err(Error::provider(
                    status.as_u16(),
                    format!("{method} {path}: {message}"),
                ));
            }

            let text = resp.text().await?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text)?);
        }
    }

    async fn neutron(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        self.call(Service::Network, method, path, &[], body).await
    }

    async fn neutron_list<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &ListFilter,
    ) -> Result<Vec<T>> {
        let path = format!("/{}", collection.replace('_', "-"));
        let body = self
            .call(Service::Network, Method::GET, &path, &filter.query(), None)
            .await?;
        decode(body, collection)
    }
}

#[async_trait]
impl NetworkProvider for OpenStackClient {
    async fn create_network(&self, name: &str) -> Result<Network> {
        let body = json!({"network": {"name": name, "admin_state_up": true}});
        decode(
            self.neutron(Method::POST, "/networks", Some(&body)).await?,
            "network",
        )
    }

    async fn create_subnet(&self, name: &str, network_id: &str, spec: &SubnetSpec) -> Result<Subnet> {
        let mut subnet = json!({
            "name": name,
            "network_id": network_id,
            "cidr": spec.cidr,
            "ip_version": 4,
        });
        if let Some(gateway_ip) = &spec.gateway_ip {
            subnet["gateway_ip"] = json!(gateway_ip);
        }
        if let Some(pool) = &spec.allocation_pool {
            subnet["allocation_pools"] = json!([pool]);
        }
        let body = json!({ "subnet": subnet });
        decode(
            self.neutron(Method::POST, "/subnets", Some(&body)).await?,
            "subnet",
        )
    }

    async fn create_router(&self, name: &str, gateway_network_id: Option<String>) -> Result<Router> {
        let mut router = json!({"name": name, "admin_state_up": true});
        if let Some(network_id) = gateway_network_id {
            router["external_gateway_info"] = json!({"network_id": network_id});
        }
        let body = json!({ "router": router });
        decode(
            self.neutron(Method::POST, "/routers", Some(&body)).await?,
            "router",
        )
    }

    async fn add_router_interface(&self, router_id: &str, subnet_id: &str) -> Result<()> {
        let body = json!({"subnet_id": subnet_id});
        self.neutron(
            Method::PUT,
            &format!("/routers/{router_id}/add_router_interface"),
            Some(&body),
        )
        .await
        .map_err(absent("router", router_id))?;
        Ok(())
    }

    async fn remove_router_interface(&self, router_id: &str, subnet_id: &str) -> Result<()> {
        let body = json!({"subnet_id": subnet_id});
        self.neutron(
            Method::PUT,
            &format!("/routers/{router_id}/remove_router_interface"),
            Some(&body),
        )
        .await
        .map_err(absent("router interface", subnet_id))?;
        Ok(())
    }

    async fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup> {
        let body = json!({"security_group": {"name": name, "description": description}});
        decode(
            self.neutron(Method::POST, "/security-groups", Some(&body)).await?,
            "security_group",
        )
    }

    async fn get_network(&self, id: &str) -> Result<Network> {
        let body = self
            .neutron(Method::GET, &format!("/networks/{id}"), None)
            .await
            .map_err(absent("network", id))?;
        decode(body, "network")
    }

    async fn get_subnet(&self, id: &str) -> Result<Subnet> {
        let body = self
            .neutron(Method::GET, &format!("/subnets/{id}"), None)
            .await
            .map_err(absent("subnet", id))?;
        decode(body, "subnet")
    }

    async fn get_router(&self, id: &str) -> Result<Router> {
        let body = self
            .neutron(Method::GET, &format!("/routers/{id}"), None)
            .await
            .map_err(absent("router", id))?;
        decode(body, "router")
    }

    async fn get_security_group(&self, id: &str) -> Result<SecurityGroup> {
        let body = self
            .neutron(Method::GET, &format!("/security-groups/{id}"), None)
            .await
            .map_err(absent("security group", id))?;
        decode(body, "security_group")
    }

    async fn get_keypair(&self, name: &str) -> Result<KeyPair> {
        let body = self
            .call(
                Service::Compute,
                Method::GET,
                &format!("/os-keypairs/{name}"),
                &[],
                None,
            )
            .await
            .map_err(absent("keypair", name))?;
        decode(body, "keypair")
    }

    async fn list_networks(&self, filter: &ListFilter) -> Result<Vec<Network>> {
        self.neutron_list("networks", filter).await
    }

    async fn list_security_groups(&self, filter: &ListFilter) -> Result<Vec<SecurityGroup>> {
        self.neutron_list("security_groups", filter).await
    }

    async fn list_security_group_rules(&self, filter: &ListFilter) -> Result<Vec<SecurityGroupRule>> {
        self.neutron_list("security_group_rules", filter).await
    }

    async fn list_servers(&self, filter: &ListFilter) -> Result<Vec<Server>> {
        let mut query = Vec::new();
        if let Some(name) = &filter.name {
            query.push(("name", name.clone()));
        }
        let body = self
            .call(Service::Compute, Method::GET, "/servers/detail", &query, None)
            .await?;
        let servers: Vec<Server> = decode(body, "servers")?;
        // Nova treats the name filter as a regular expression
        Ok(servers
            .into_iter()
            .filter(|s| filter.name.as_deref().map_or(true, |n| s.name == n))
            .collect())
    }

    async fn list_floating_ips(&self, filter: &ListFilter) -> Result<Vec<FloatingIp>> {
        self.neutron_list("floatingips", filter).await
    }

    async fn delete_network(&self, id: &str) -> Result<()> {
        self.neutron(Method::DELETE, &format!("/networks/{id}"), None)
            .await
            .map_err(absent("network", id))?;
        Ok(())
    }

    async fn delete_subnet(&self, id: &str) -> Result<()> {
        self.neutron(Method::DELETE, &format!("/subnets/{id}"), None)
            .await
            .map_err(absent("subnet", id))?;
        Ok(())
    }

    async fn delete_router(&self, id: &str) -> Result<()> {
        self.neutron(Method::DELETE, &format!("/routers/{id}"), None)
            .await
            .map_err(absent("router", id))?;
        Ok(())
    }

    async fn delete_security_group(&self, id: &str) -> Result<()> {
        self.neutron(Method::DELETE, &format!("/security-groups/{id}"), None)
            .await
            .map_err(absent("security group", id))?;
        Ok(())
    }
}
