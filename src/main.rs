mod auth;
mod config;
mod hub;
mod messages;
mod origin;
mod pump;
mod server;

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use thiserror::Error;

use auth::{Authenticator, Claims, CookieAuthenticator};
use config::Config;
use hub::Hub;
use pump::Pump;
use server::Server;

#[derive(Error, Debug)]
enum TlsError {
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse certificate: {0}")]
    Certificate(std::io::Error),
    #[error("no certificate found in {}", .0.display())]
    NoCertificate(PathBuf),
    #[error("failed to parse private key: {0}")]
    Key(std::io::Error),
    #[error("no private key found in {}", .0.display())]
    NoKey(PathBuf),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Makes sure both PEM files are usable before handing them to warp,
/// which would otherwise fail only once the server is already starting.
fn check_tls_files(cert_path: &Path, key_path: &Path) -> Result<(), TlsError> {
    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Certificate)?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(cert_path.to_path_buf()));
    }

    match rustls_pemfile::private_key(&mut open(key_path)?) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(TlsError::NoKey(key_path.to_path_buf())),
        Err(e) => Err(TlsError::Key(e)),
    }
}

fn tls_files(config: &Config) -> Option<(PathBuf, PathBuf)> {
    let (cert, key) = (config.tls_cert.as_ref()?, config.tls_key.as_ref()?);
    match check_tls_files(cert, key) {
        Ok(()) => Some((cert.clone(), key.clone())),
        Err(e) => {
            error!("Failed to load TLS config, falling back to HTTP/WS: {e}");
            None
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();

    if let (Some(name), Some(secret)) = (&config.issue_cookie, &config.auth_secret) {
        let claims = Claims {
            name: name.clone(),
            avatar_url: config.avatar_url.clone(),
        };
        match CookieAuthenticator::new(secret.as_bytes()).sign(&claims) {
            Ok(cookie) => println!("{}={cookie}", auth::AUTH_COOKIE),
            Err(e) => error!("Failed to issue cookie: {e}"),
        }
        return;
    }

    let auth: Arc<dyn Authenticator> = match &config.auth_secret {
        Some(secret) => Arc::new(CookieAuthenticator::new(secret.as_bytes())),
        None => {
            warn!("AUTH_SECRET is not set; using an ephemeral in-memory secret");
            Arc::new(CookieAuthenticator::ephemeral())
        }
    };
    let tls = tls_files(&config);

    let (hub, hub_task) = Hub::spawn(config.hub());
    let pump = Pump::new(hub.clone(), config.pump());
    let routes =
        Server::new(hub.clone(), pump, auth, tls.is_some()).routes(config.static_dir.clone());

    let shutdown = {
        let hub = hub.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {e}");
            }
            info!("Shutting down");
            hub.shutdown();
        }
    };

    match tls {
        Some((cert, key)) => {
            info!("Starting secure server (HTTPS/WSS) on {}", config.addr);
            let (_, serving) = warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .bind_with_graceful_shutdown(config.addr, shutdown);
            serving.await;
        }
        None => {
            match warp::serve(routes).try_bind_with_graceful_shutdown(config.addr, shutdown) {
                Ok((addr, serving)) => {
                    info!("Server listening on {addr}");
                    serving.await;
                }
                Err(e) => {
                    error!("Failed to bind to {}: {e}", config.addr);
                    hub.shutdown();
                }
            }
        }
    }

    if let Err(e) = hub_task.await {
        error!("Hub task failed: {e}");
    }
}
