use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use log::warn;
use serde_json::json;
use warp::http::StatusCode;
use warp::ws::Ws;
use warp::{Filter, Rejection, Reply};

use crate::auth::{Authenticator, AUTH_COOKIE};
use crate::hub::HubHandle;
use crate::origin::is_allowed_origin;
use crate::pump::Pump;

#[derive(Clone)]
pub struct Server {
    hub: HubHandle,
    pump: Pump,
    auth: Arc<dyn Authenticator>,
    tls: bool,
}

impl Server {
    pub fn new(hub: HubHandle, pump: Pump, auth: Arc<dyn Authenticator>, tls: bool) -> Self {
        Server {
            hub,
            pump,
            auth,
            tls,
        }
    }

    pub fn routes(
        self,
        static_dir: PathBuf,
    ) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let server = Arc::new(self);
        let with_server = warp::any().map(move || Arc::clone(&server));

        let room = warp::path("room")
            .and(warp::path::end())
            .and(warp::ws())
            .and(warp::header::optional::<String>("origin"))
            .and(warp::header::optional::<String>("host"))
            .and(warp::cookie::optional(AUTH_COOKIE))
            .and(with_server.clone())
            .and_then(ws_handler);

        let health = warp::path("health")
            .and(warp::path::end())
            .and(warp::get())
            .and(with_server)
            .and_then(health_handler);

        room.or(health)
            .or(warp::fs::dir(static_dir))
            .with(warp::log("chatterbox::http"))
    }
}

async fn ws_handler(
    ws: Ws,
    origin: Option<String>,
    host: Option<String>,
    cookie: Option<String>,
    server: Arc<Server>,
) -> Result<Box<dyn Reply>, Rejection> {
    if !is_allowed_origin(origin.as_deref(), host.as_deref(), server.tls) {
        warn!("Refusing upgrade from origin {origin:?} for host {host:?}");
        return Ok(Box::new(warp::reply::with_status(
            "origin not allowed",
            StatusCode::FORBIDDEN,
        )));
    }

    let identity = match server.auth.authenticate(cookie.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!("Refusing unauthenticated upgrade: {e}");
            return Ok(Box::new(warp::reply::with_status(
                "unauthenticated",
                StatusCode::FORBIDDEN,
            )));
        }
    };

    let pump = server.pump.clone();
    Ok(Box::new(ws.on_upgrade(move |socket| async move {
        let (writer, reader) = socket.split();
        pump.run(identity, reader, writer).await;
    })))
}

async fn health_handler(server: Arc<Server>) -> Result<impl Reply, Rejection> {
    let reply = match server.hub.members().await {
        Ok(members) => warp::reply::with_status(
            warp::reply::json(&json!({ "status": "ok", "members": members.len() })),
            StatusCode::OK,
        ),
        Err(e) => warp::reply::with_status(
            warp::reply::json(&json!({ "status": e.to_string() })),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
    };
    Ok(reply)
}
