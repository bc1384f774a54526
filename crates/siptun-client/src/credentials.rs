//! Proxy and TLS identity material handed to links at creation time

use siptun_transport::{ClientCertificate, HttpProxy};

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub http_proxy_host: Option<String>,
    pub http_proxy_port: u16,
    pub http_proxy_username: Option<String>,
    pub http_proxy_password: Option<String>,
    pub client_certificate: Option<ClientCertificate>,
    pub username: Option<String>,
    pub domain: Option<String>,
}

impl Credentials {
    /// Configured proxy, if a host and port are both set
    pub fn http_proxy(&self) -> Option<HttpProxy> {
        let host = self.http_proxy_host.as_deref().filter(|h| !h.is_empty())?;
        if self.http_proxy_port == 0 {
            return None;
        }
        Some(HttpProxy::new(host, self.http_proxy_port).with_credentials(
            self.http_proxy_username.clone(),
            self.http_proxy_password.clone(),
        ))
    }

    /// `sip:user@domain` expected by the server for mutual authentication
    pub fn identity(&self) -> Option<String> {
        match (self.username.as_deref(), self.domain.as_deref()) {
            (Some(user), Some(domain)) if !user.is_empty() && !domain.is_empty() => {
                Some(format!("sip:{}@{}", user, domain))
            }
            _ => None,
        }
    }
}
