use zenoh::Session;

use crate::config::ZenohConfig;
use crate::error::{Error, Result};

/// User/password pair for Zenoh's user-password transport authentication.
#[derive(Clone)]
pub struct SessionAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SessionAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn insert(config: &mut zenoh::Config, key: &str, value: &impl serde::Serialize) -> Result<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| Error::Config(format!("Failed to serialize '{}': {}", key, e)))?;

    config
        .insert_json5(key, &json)
        .map_err(|e| Error::Config(format!("Failed to set '{}': {}", key, e)))
}

/// Build the Zenoh configuration for a session.
pub fn build_config(config: &ZenohConfig, auth: Option<&SessionAuth>) -> Result<zenoh::Config> {
    config.validate()?;

    let mut zenoh_config = zenoh::Config::default();
    insert(&mut zenoh_config, "mode", &config.mode)?;

    if !config.connect.is_empty() {
        insert(&mut zenoh_config, "connect/endpoints", &config.connect)?;
    }

    if !config.listen.is_empty() {
        insert(&mut zenoh_config, "listen/endpoints", &config.listen)?;
    }

    if let Some(tls) = &config.tls {
        let prefix = "transport/link/tls";
        if let Some(ca) = &tls.root_ca_certificate {
            insert(&mut zenoh_config, &format!("{prefix}/root_ca_certificate"), ca)?;
        }
        if let (Some(cert), Some(key)) = (&tls.connect_certificate, &tls.connect_private_key) {
            insert(&mut zenoh_config, &format!("{prefix}/connect_certificate"), cert)?;
            insert(&mut zenoh_config, &format!("{prefix}/connect_private_key"), key)?;
        }
        insert(&mut zenoh_config, &format!("{prefix}/enable_mtls"), &tls.is_mutual())?;
        insert(
            &mut zenoh_config,
            &format!("{prefix}/verify_name_on_connect"),
            &tls.verify_name_on_connect,
        )?;
    }

    if let Some(auth) = auth {
        insert(&mut zenoh_config, "transport/auth/usrpwd/user", &auth.username)?;
        insert(&mut zenoh_config, "transport/auth/usrpwd/password", &auth.password)?;
    }

    Ok(zenoh_config)
}

/// Open a Zenoh session using the provided configuration.
pub async fn open_session(config: &ZenohConfig, auth: Option<&SessionAuth>) -> Result<Session> {
    let zenoh_config = build_config(config, auth)?;

    tracing::debug!(
        mode = %config.mode,
        connect = ?config.connect,
        listen = ?config.listen,
        tls = config.tls.is_some(),
        authenticated = auth.is_some(),
        "Opening Zenoh session"
    );

    let session = zenoh::open(zenoh_config).await?;

    tracing::debug!(zid = %session.zid(), "Zenoh session open");

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;

    #[test]
    fn test_build_config_rejects_bad_mode() {
        let config = ZenohConfig {
            mode: "broker".to_string(),
            connect: vec!["tcp/localhost:7447".to_string()],
            listen: Vec::new(),
            tls: None,
        };
        assert!(build_config(&config, None).is_err());
    }

    #[test]
    fn test_build_config_with_auth() {
        let config = ZenohConfig {
            mode: "client".to_string(),
            connect: vec!["tcp/localhost:7447".to_string()],
            listen: Vec::new(),
            tls: None,
        };
        let auth = SessionAuth {
            username: "device".to_string(),
            password: "secret".to_string(),
        };
        assert!(build_config(&config, Some(&auth)).is_ok());
    }

    #[test]
    fn test_build_config_maps_tls() {
        let config = ZenohConfig {
            mode: "client".to_string(),
            connect: vec!["tls/broker.local:7447".to_string()],
            listen: Vec::new(),
            tls: Some(TlsConfig {
                root_ca_certificate: Some("/etc/envlink/ca.pem".to_string()),
                connect_certificate: Some("/etc/envlink/client.pem".to_string()),
                connect_private_key: Some("/etc/envlink/client.key".to_string()),
                verify_name_on_connect: false,
            }),
        };

        let zenoh_config = build_config(&config, None).unwrap();
        let get = |key: &str| {
            zenoh_config
                .get_json(&format!("transport/link/tls/{}", key))
                .unwrap()
        };

        assert!(get("root_ca_certificate").contains("/etc/envlink/ca.pem"));
        assert!(get("connect_certificate").contains("/etc/envlink/client.pem"));
        assert!(get("connect_private_key").contains("/etc/envlink/client.key"));
        assert_eq!(get("enable_mtls"), "true");
        assert_eq!(get("verify_name_on_connect"), "false");
    }

    #[test]
    fn test_auth_debug_redacts_password() {
        let auth = SessionAuth {
            username: "device".to_string(),
            password: "secret".to_string(),
        };
        let debug = format!("{:?}", auth);
        assert!(debug.contains("device"));
        assert!(!debug.contains("secret"));
    }
}
