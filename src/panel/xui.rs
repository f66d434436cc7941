use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use totp_rs::{Algorithm, Secret, TOTP};

use super::{Client, Inbound, InboundSettings, LocatedClient, PanelApi, PanelError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct XuiCredentials {
    pub host: String,
    pub username: String,
    pub password: String,
    /// Legacy `loginSecret` some panels are configured with
    pub login_secret: Option<String>,
    /// Base32 TOTP secret for panels with two-factor login
    pub totp_secret: Option<String>,
}

/// Authenticated session against one 3x-ui panel. The session cookie lives
/// in the client's cookie store; `login` replaces it.
pub struct XuiPanel {
    http: reqwest::Client,
    creds: XuiCredentials,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    msg: String,
    obj: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ClientTraffic {
    #[serde(rename = "inboundId")]
    inbound_id: i64,
}

impl XuiPanel {
    pub fn new(creds: XuiCredentials) -> Result<Self, PanelError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { http, creds })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.creds.host.trim_end_matches('/'), path)
    }

    fn two_factor_code(&self) -> Result<Option<String>, PanelError> {
        let Some(secret) = &self.creds.totp_secret else {
            return Ok(None);
        };
        let bytes = Secret::Encoded(secret.clone())
            .to_bytes()
            .map_err(|e| PanelError::Auth(format!("bad totp secret: {:?}", e)))?;
        let totp = TOTP::new_unchecked(Algorithm::SHA1, 6, 1, 30, bytes);
        let code = totp
            .generate_current()
            .map_err(|e| PanelError::Auth(format!("totp clock: {}", e)))?;
        Ok(Some(code))
    }

    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<Option<T>, PanelError> {
        let envelope: Envelope<T> = req.send().await?.error_for_status()?.json().await?;
        if !envelope.success {
            return Err(PanelError::Rejected(envelope.msg));
        }
        Ok(envelope.obj)
    }

    fn client_settings(client: &Client) -> Result<String, PanelError> {
        Ok(serde_json::to_string(&InboundSettings {
            clients: vec![client.clone()],
        })?)
    }

    async fn get_inbound(&self, inbound_id: i64) -> Result<Option<Inbound>, PanelError> {
        let req = self
            .http
            .get(self.url(&format!("panel/api/inbounds/get/{}", inbound_id)));
        self.call(req).await
    }
}

#[async_trait]
impl PanelApi for XuiPanel {
    async fn login(&self) -> Result<(), PanelError> {
        let mut form = vec![
            ("username", self.creds.username.clone()),
            ("password", self.creds.password.clone()),
        ];
        if let Some(secret) = &self.creds.login_secret {
            form.push(("loginSecret", secret.clone()));
        }
        if let Some(code) = self.two_factor_code()? {
            debug!("Sending two-factor code to {}", self.creds.host);
            form.push(("twoFactorCode", code));
        }

        let req = self.http.post(self.url("login")).form(&form);
        self.call::<serde_json::Value>(req)
            .await
            .map_err(|e| PanelError::Auth(e.to_string()))?;
        info!("Logged in to panel {}", self.creds.host);
        Ok(())
    }

    async fn list_inbounds(&self) -> Result<Vec<Inbound>, PanelError> {
        let req = self.http.get(self.url("panel/api/inbounds/list"));
        Ok(self.call(req).await?.unwrap_or_default())
    }

    async fn add_client(&self, inbound_id: i64, client: &Client) -> Result<(), PanelError> {
        let body = json!({ "id": inbound_id, "settings": Self::client_settings(client)? });
        let req = self
            .http
            .post(self.url("panel/api/inbounds/addClient"))
            .json(&body);
        self.call::<serde_json::Value>(req).await?;
        Ok(())
    }

    async fn update_client(
        &self,
        inbound_id: i64,
        client_id: &str,
        client: &Client,
    ) -> Result<(), PanelError> {
        let body = json!({ "id": inbound_id, "settings": Self::client_settings(client)? });
        let req = self
            .http
            .post(self.url(&format!("panel/api/inbounds/updateClient/{}", client_id)))
            .json(&body);
        self.call::<serde_json::Value>(req).await?;
        Ok(())
    }

    async fn get_client_by_email(&self, email: &str) -> Result<Option<LocatedClient>, PanelError> {
        let req = self
            .http
            .get(self.url(&format!("panel/api/inbounds/getClientTraffics/{}", email)));
        let Some(traffic) = self.call::<ClientTraffic>(req).await? else {
            return Ok(None);
        };

        // The traffic record has no uuid or sub id; the inbound settings do.
        let Some(inbound) = self.get_inbound(traffic.inbound_id).await? else {
            return Ok(None);
        };
        Ok(inbound
            .settings
            .clients
            .into_iter()
            .find(|c| c.email == email)
            .map(|client| LocatedClient {
                inbound_id: inbound.id,
                client,
            }))
    }

    async fn delete_client(&self, inbound_id: i64, client_id: &str) -> Result<(), PanelError> {
        let req = self.http.post(self.url(&format!(
            "panel/api/inbounds/{}/delClient/{}",
            inbound_id, client_id
        )));
        self.call::<serde_json::Value>(req).await?;
        Ok(())
    }
}
