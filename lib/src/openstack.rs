//! `Cloud` over the OpenStack Keystone v2, Nova v2 and Glance v1 HTTP APIs.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::{
    header::{HeaderMap, HeaderValue, LOCATION},
    Client, Response,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::cloud::{Cloud, Flavor, Image, Instance, InstanceRequest, Status};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub tenant_id: Option<String>,
    pub tenant_name: Option<String>,
    pub auth_url: String,
}

impl Credentials {
    /// Fails naming the environment variable the missing value would come from.
    pub fn new(
        username: Option<String>,
        password: Option<String>,
        tenant_id: Option<String>,
        tenant_name: Option<String>,
        auth_url: Option<String>,
    ) -> Result<Self> {
        if tenant_id.is_none() && tenant_name.is_none() {
            return Err(Error::MissingCredential("OS_TENANT_NAME"));
        }
        Ok(Credentials {
            username: username.ok_or(Error::MissingCredential("OS_USERNAME"))?,
            password: password.ok_or(Error::MissingCredential("OS_PASSWORD"))?,
            auth_url: auth_url.ok_or(Error::MissingCredential("OS_AUTH_URL"))?,
            tenant_id,
            tenant_name,
        })
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    auth: TokenAuth<'a>,
}

#[derive(Serialize)]
struct TokenAuth<'a> {
    #[serde(rename = "passwordCredentials")]
    password_credentials: PasswordCredentials<'a>,
    #[serde(rename = "tenantId", skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
    #[serde(rename = "tenantName", skip_serializing_if = "Option::is_none")]
    tenant_name: Option<&'a str>,
}

#[derive(Serialize)]
struct PasswordCredentials<'a> {
    username: &'a str,
    password: &'a str,
}

impl<'a> From<&'a Credentials> for TokenRequest<'a> {
    fn from(credentials: &'a Credentials) -> Self {
        TokenRequest {
            auth: TokenAuth {
                password_credentials: PasswordCredentials {
                    username: &credentials.username,
                    password: &credentials.password,
                },
                tenant_id: credentials.tenant_id.as_deref(),
                tenant_name: credentials.tenant_name.as_deref(),
            },
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access: Access,
}

#[derive(Deserialize)]
struct Access {
    token: Token,
    #[serde(rename = "serviceCatalog")]
    service_catalog: Vec<Service>,
}

#[derive(Deserialize)]
struct Token {
    id: String,
}

#[derive(Deserialize)]
struct Service {
    #[serde(rename = "type")]
    service_type: String,
    endpoints: Vec<Endpoint>,
}

#[derive(Deserialize)]
struct Endpoint {
    #[serde(rename = "publicURL")]
    public_url: Option<String>,
    #[serde(rename = "adminURL")]
    admin_url: Option<String>,
}

impl Access {
    fn endpoint(&self, service_type: &'static str, admin: bool) -> Result<String> {
        let endpoint = self
            .service_catalog
            .iter()
            .find(|service| service.service_type == service_type)
            .and_then(|service| service.endpoints.first())
            .ok_or(Error::MissingEndpoint(service_type))?;

        let url = if admin {
            endpoint.admin_url.as_ref().or(endpoint.public_url.as_ref())
        } else {
            endpoint.public_url.as_ref()
        };

        url.map(|url| url.trim_end_matches('/').to_string())
            .ok_or(Error::MissingEndpoint(service_type))
    }
}

#[derive(Deserialize)]
struct ImagesBody {
    images: Vec<Image>,
}

#[derive(Deserialize)]
struct ImageBody {
    image: Image,
}

#[derive(Deserialize)]
struct FlavorsBody {
    flavors: Vec<Flavor>,
}

#[derive(Deserialize)]
struct ServerBody {
    server: Instance,
}

#[derive(Deserialize)]
struct CreatedServer {
    server: CreatedServerId,
}

#[derive(Deserialize)]
struct CreatedServerId {
    id: Uuid,
}

#[derive(Deserialize)]
struct SnapshotBody {
    image_id: Uuid,
}

/// An authenticated session. Holds the token and the endpoints it was issued for.
pub struct OpenStack {
    client: Client,
    compute: String,
    image: String,
}

impl OpenStack {
    pub async fn authenticate(credentials: &Credentials) -> Result<Self> {
        let url = format!("{}/tokens", credentials.auth_url.trim_end_matches('/'));
        info!("authenticating {} against {}", credentials.username, url);

        let response = Client::new()
            .post(&url)
            .json(&TokenRequest::from(credentials))
            .send()
            .await?;
        let access = check("POST", response).await?.json::<TokenResponse>().await?.access;

        let compute = access.endpoint("compute", false)?;
        let image = glance_root(&access.endpoint("image", true)?);
        debug!("compute endpoint: {}, image endpoint: {}", compute, image);

        let mut token = HeaderValue::from_str(&access.token.id)
            .map_err(|_| Error::InvalidToken)?;
        token.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert("X-Auth-Token", token);

        let client = Client::builder()
            .default_headers(headers)
            .gzip(true)
            .build()?;

        Ok(OpenStack {
            client,
            compute,
            image,
        })
    }

    fn compute_url(&self, path: &str) -> String {
        format!("{}/{}", self.compute, path)
    }

    async fn get<T: DeserializeOwned>(&self, url: String) -> Result<T> {
        debug!("GET {}", url);
        let response = self.client.get(&url).send().await?;
        Ok(check("GET", response).await?.json::<T>().await?)
    }

    async fn post<B: Serialize>(&self, url: String, body: &B) -> Result<Response> {
        debug!("POST {}", url);
        let response = self.client.post(&url).json(body).send().await?;
        check("POST", response).await
    }

    async fn server_action(&self, id: Uuid, action: serde_json::Value) -> Result<Response> {
        self.post(self.compute_url(&format!("servers/{}/action", id)), &action)
            .await
    }
}

async fn check(method: &'static str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(Error::Api {
        method,
        url,
        status: status.as_u16(),
        body,
    })
}

/// Glance catalog entries sometimes carry the API version; v1 paths are added here.
fn glance_root(endpoint: &str) -> String {
    endpoint
        .trim_end_matches("/v1")
        .trim_end_matches("/v2")
        .to_string()
}

fn image_id_from_location(location: &str) -> Option<Uuid> {
    location
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(|id| Uuid::parse_str(id).ok())
}

fn server_body(request: &InstanceRequest) -> serde_json::Value {
    let security_groups: Vec<serde_json::Value> = request
        .security_groups
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();

    let mut server = json!({
        "name": request.name,
        "imageRef": request.image,
        "flavorRef": request.flavor,
        "key_name": request.keypair,
        "security_groups": security_groups,
        "metadata": request.metadata,
    });
    if let Some(user_data) = &request.user_data {
        server["user_data"] = json!(base64::encode(user_data));
    }

    json!({ "server": server })
}

#[async_trait]
impl Cloud for OpenStack {
    async fn list_images(&self) -> Result<Vec<Image>> {
        let body: ImagesBody = self.get(self.compute_url("images/detail")).await?;
        Ok(body.images)
    }

    async fn get_image(&self, id: Uuid) -> Result<Image> {
        let body: ImageBody = self.get(self.compute_url(&format!("images/{}", id))).await?;
        Ok(body.image)
    }

    async fn find_flavor(&self, name: &str) -> Result<Flavor> {
        let body: FlavorsBody = self.get(self.compute_url("flavors")).await?;
        body.flavors
            .into_iter()
            .find(|flavor| flavor.name == name)
            .ok_or_else(|| Error::NoFlavor(name.to_string()))
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance> {
        info!("create instance {}", request.name);
        let response = self
            .post(self.compute_url("servers"), &server_body(request))
            .await?;
        let created: CreatedServer = response.json().await?;

        Ok(Instance {
            id: created.server.id,
            name: request.name.clone(),
            status: Status::Build,
            addresses: HashMap::new(),
        })
    }

    async fn get_instance(&self, id: Uuid) -> Result<Instance> {
        let body: ServerBody = self.get(self.compute_url(&format!("servers/{}", id))).await?;
        Ok(body.server)
    }

    async fn delete_instance(&self, id: Uuid) -> Result<()> {
        let url = self.compute_url(&format!("servers/{}", id));
        info!("DELETE {}", url);
        let response = self.client.delete(&url).send().await?;
        check("DELETE", response).await?;
        Ok(())
    }

    async fn reboot_instance(&self, id: Uuid) -> Result<()> {
        info!("reboot instance {}", id);
        self.server_action(id, json!({ "reboot": { "type": "SOFT" } }))
            .await?;
        Ok(())
    }

    async fn upload_image(&self, name: &str, file: &Path) -> Result<Image> {
        let data = tokio::fs::read(file).await?;
        let url = format!("{}/v1/images", self.image);
        info!("upload {} ({} bytes) to {}", file.display(), data.len(), url);

        let response = self
            .client
            .post(&url)
            .header("x-image-meta-name", name)
            .header("x-image-meta-container_format", "bare")
            .header("x-image-meta-disk_format", "qcow2")
            .header("Content-Type", "application/octet-stream")
            .body(data)
            .send()
            .await?;
        let body: ImageBody = check("POST", response).await?.json().await?;
        Ok(body.image)
    }

    async fn delete_image(&self, id: Uuid) -> Result<()> {
        let url = self.compute_url(&format!("images/{}", id));
        info!("DELETE {}", url);
        let response = self.client.delete(&url).send().await?;
        check("DELETE", response).await?;
        Ok(())
    }

    async fn snapshot_instance(&self, id: Uuid, name: &str) -> Result<Uuid> {
        info!("snapshot instance {} as {}", id, name);
        let response = self
            .server_action(id, json!({ "createImage": { "name": name, "metadata": {} } }))
            .await?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|location| location.to_str().ok())
            .and_then(image_id_from_location);
        match location {
            Some(image_id) => Ok(image_id),
            None => Ok(response.json::<SnapshotBody>().await?.image_id),
        }
    }

    async fn set_image_metadata(
        &self,
        id: Uuid,
        metadata: &HashMap<String, String>,
    ) -> Result<()> {
        self.post(
            self.compute_url(&format!("images/{}/metadata", id)),
            &json!({ "metadata": metadata }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CATALOG: &str = r#"{
        "access": {
            "token": {"id": "secret", "expires": "2014-06-01T00:00:00Z"},
            "serviceCatalog": [
                {"type": "compute", "name": "nova", "endpoints": [
                    {"publicURL": "https://nova.example.com:8774/v2/tenant/", "adminURL": "https://admin:8774/v2/tenant"}
                ]},
                {"type": "image", "name": "glance", "endpoints": [
                    {"publicURL": "https://glance.example.com:9292/v1"}
                ]}
            ]
        }
    }"#;

    #[test]
    fn endpoints_come_from_the_catalog() {
        let access = serde_json::from_str::<TokenResponse>(CATALOG).unwrap().access;
        assert_eq!(access.token.id, "secret");
        assert_eq!(
            access.endpoint("compute", false).unwrap(),
            "https://nova.example.com:8774/v2/tenant"
        );
        assert_eq!(
            glance_root(&access.endpoint("image", true).unwrap()),
            "https://glance.example.com:9292"
        );
        assert!(matches!(
            access.endpoint("volume", false),
            Err(Error::MissingEndpoint("volume"))
        ));
    }

    #[test]
    fn token_request_skips_missing_tenant_fields() {
        let credentials = Credentials::new(
            Some("qe".into()),
            Some("hunter2".into()),
            None,
            Some("pulp".into()),
            Some("https://keystone:5000/v2.0".into()),
        )
        .unwrap();
        let body = serde_json::to_value(TokenRequest::from(&credentials)).unwrap();
        assert_eq!(
            body,
            json!({"auth": {
                "passwordCredentials": {"username": "qe", "password": "hunter2"},
                "tenantName": "pulp"
            }})
        );
    }

    #[test]
    fn missing_credentials_name_the_variable() {
        let err = Credentials::new(None, None, Some("t".into()), None, None).unwrap_err();
        assert_eq!(err.to_string(), "OS_USERNAME environment variable must be set");
    }

    #[test]
    fn snapshot_id_is_read_from_the_location() {
        let id = Uuid::new_v4();
        let location = format!("https://nova.example.com/v2/tenant/images/{}", id);
        assert_eq!(image_id_from_location(&location), Some(id));
        assert_eq!(image_id_from_location("https://nova/images/"), None);
    }

    #[test]
    fn server_body_encodes_user_data() {
        let image = Uuid::new_v4();
        let request = InstanceRequest {
            name: "pulp-server".into(),
            image,
            flavor: "3".into(),
            security_groups: vec!["pulp".into()],
            keypair: "qe-key".into(),
            user_data: Some(b"#cloud-config\n".to_vec()),
            metadata: HashMap::new(),
        };
        let body = server_body(&request);
        assert_eq!(body["server"]["imageRef"], json!(image.to_string()));
        assert_eq!(body["server"]["security_groups"], json!([{"name": "pulp"}]));
        assert_eq!(body["server"]["user_data"], json!("I2Nsb3VkLWNvbmZpZwo="));
    }
}
