//! Embedded TURN listener, started alongside the node when configured.
//! Static credentials only; anything smarter belongs in a dedicated
//! deployment.

use crate::config::TurnConfig;
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use webrtc::turn::auth::{generate_auth_key, AuthHandler};
use webrtc::turn::relay::relay_static::RelayAddressGeneratorStatic;
use webrtc::turn::server::config::{ConnConfig, ServerConfig};
use webrtc::turn::server::Server;
use webrtc::turn::Error;
use webrtc::util::vnet::net::Net;

struct StaticAuthHandler {
    credentials: HashMap<String, Vec<u8>>,
}

impl AuthHandler for StaticAuthHandler {
    fn auth_handle(
        &self,
        username: &str,
        _realm: &str,
        _src_addr: SocketAddr,
    ) -> Result<Vec<u8>, Error> {
        self.credentials
            .get(username)
            .cloned()
            .ok_or(Error::ErrFakeErr)
    }
}

pub async fn start(conf: &TurnConfig) -> Result<Server> {
    let mut credentials = HashMap::new();
    for entry in &conf.users {
        let (user, pass) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("turn user entry {entry:?} is not user=password"))?;
        credentials.insert(
            user.to_owned(),
            generate_auth_key(user, &conf.realm, pass),
        );
    }

    let conn = Arc::new(
        UdpSocket::bind(&conf.address)
            .await
            .with_context(|| format!("binding turn listener on {}", conf.address))?,
    );

    let server = Server::new(ServerConfig {
        conn_configs: vec![ConnConfig {
            conn,
            relay_addr_generator: Box::new(RelayAddressGeneratorStatic {
                relay_address: conf.public_ip.parse()?,
                address: "0.0.0.0".to_owned(),
                net: Arc::new(Net::new(None)),
            }),
        }],
        realm: conf.realm.clone(),
        auth_handler: Arc::new(StaticAuthHandler { credentials }),
        channel_bind_timeout: std::time::Duration::from_secs(0),
        alloc_close_notify: None,
    })
    .await?;

    tracing::info!(listen = %conf.address, "started turn server");
    Ok(server)
}
