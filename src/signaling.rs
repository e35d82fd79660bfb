//! HTTP surface: the WebSocket acceptor for interactive peers and the REST
//! API for broadcasters.
//!
//! Every request is gated on the `Origin` header matching the configured
//! origin (403 otherwise) and on the presence of a `Host` header (400).

use crate::error::SignalingError;
use crate::peer::{PeerId, PeerSession};
use crate::protocol::{self, MediaSource, TransportDirection};
use crate::room::RoomId;
use crate::server::Server;
use actix_web::http::header;
use actix_web::web::{Data, Json, Path, Payload, Query, ServiceConfig};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use mediasoup::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::IpAddr;

pub fn configure(cfg: &mut ServiceConfig) {
    cfg.route("/ws", web::get().to(ws_index))
        .route("/rooms/{room_id}", web::get().to(get_room))
        .route(
            "/rooms/{room_id}/broadcasters",
            web::post().to(create_broadcaster),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{peer_id}",
            web::delete().to(delete_broadcaster),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{peer_id}/join",
            web::post().to(join_broadcaster),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{peer_id}/transports",
            web::post().to(create_broadcaster_transport),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{peer_id}/transports/{transport_id}/connect",
            web::post().to(connect_broadcaster_transport),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{peer_id}/producers",
            web::post().to(create_broadcaster_producer),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{peer_id}/consumers",
            web::post().to(create_broadcaster_consumer),
        )
        .route(
            "/rooms/{room_id}/broadcasters/{peer_id}/consumers/{consumer_id}/resume",
            web::post().to(resume_broadcaster_consumer),
        );
}

/// Validate the `Origin` header against the configured origin and require a
/// `Host` header.
pub fn check_origin(request: &HttpRequest, expected: &str) -> Result<(), SignalingError> {
    if request.headers().get(header::HOST).is_none() {
        return Err(SignalingError::TypeError("missing Host header".to_string()));
    }

    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| SignalingError::Forbidden("missing Origin header".to_string()))?;

    if origin_matches(origin, expected) {
        Ok(())
    } else {
        Err(SignalingError::Forbidden(format!(
            "origin \"{origin}\" not allowed"
        )))
    }
}

/// The configured value may be a bare domain or a full origin; accept the
/// exact string as well as `http(s)://<domain>` forms of a bare domain.
fn origin_matches(origin: &str, expected: &str) -> bool {
    if origin == expected {
        return true;
    }

    origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .map(|rest| {
            let host = rest.split(':').next().unwrap_or(rest);
            host == expected
        })
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    room_id: Option<String>,
    peer_id: Option<String>,
    consumer_replicas: Option<u32>,
    use_pipe_transports: Option<bool>,
}

async fn ws_index(
    request: HttpRequest,
    query: Query<WsQuery>,
    server: Data<Server>,
    stream: Payload,
) -> Result<HttpResponse, SignalingError> {
    check_origin(&request, &server.config().domain)?;

    let room_id = query
        .room_id
        .clone()
        .ok_or_else(|| SignalingError::TypeError("missing roomId query parameter".to_string()))?;
    let peer_id = query
        .peer_id
        .clone()
        .ok_or_else(|| SignalingError::TypeError("missing peerId query parameter".to_string()))?;

    let room = server
        .get_or_create_room(
            RoomId::from(room_id),
            query.consumer_replicas.unwrap_or(0),
            query.use_pipe_transports.unwrap_or(false),
        )
        .await?;

    let remote_addr = request
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();

    ws::WsResponseBuilder::new(
        PeerSession::new(PeerId::from(peer_id), remote_addr, room),
        &request,
        stream,
    )
    .frame_size(protocol::MAX_MESSAGE_SIZE)
    .start()
    .map_err(|error| SignalingError::Server(error.to_string()))
}

async fn get_room(
    request: HttpRequest,
    path: Path<String>,
    server: Data<Server>,
) -> Result<HttpResponse, SignalingError> {
    check_origin(&request, &server.config().domain)?;

    let room = server
        .get_or_create_room(RoomId::from(path.into_inner()), 0, false)
        .await?;

    Ok(HttpResponse::Ok().json(json!({
        "routerRtpCapabilities": room.router_rtp_capabilities(),
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateBroadcasterBody {
    peer_id: String,
    display_name: String,
    #[serde(default)]
    device: Value,
}

async fn create_broadcaster(
    request: HttpRequest,
    path: Path<String>,
    body: Json<CreateBroadcasterBody>,
    server: Data<Server>,
) -> Result<HttpResponse, SignalingError> {
    check_origin(&request, &server.config().domain)?;

    let room_id = RoomId::from(path.into_inner());
    let room = server.get_or_create_room(room_id.clone(), 0, false).await?;

    let body = body.into_inner();
    let peers = room.create_broadcaster(
        PeerId::from(body.peer_id.clone()),
        body.display_name,
        body.device,
    )?;

    Ok(HttpResponse::Created()
        .insert_header((
            header::LOCATION,
            format!("/rooms/{room_id}/broadcasters/{}", body.peer_id),
        ))
        .json(json!({ "peers": peers })))
}

async fn delete_broadcaster(
    request: HttpRequest,
    path: Path<(String, String)>,
    server: Data<Server>,
) -> Result<HttpResponse, SignalingError> {
    check_origin(&request, &server.config().domain)?;

    let (room_id, peer_id) = path.into_inner();
    let room = existing_room(&server, room_id).await?;
    room.delete_broadcaster(&PeerId::from(peer_id))?;

    Ok(HttpResponse::NoContent().finish())
}

async fn join_broadcaster(
    request: HttpRequest,
    path: Path<(String, String)>,
    server: Data<Server>,
) -> Result<HttpResponse, SignalingError> {
    check_origin(&request, &server.config().domain)?;

    let (room_id, peer_id) = path.into_inner();
    let room = existing_room(&server, room_id).await?;
    let peers = room.join_broadcaster(&PeerId::from(peer_id))?;

    Ok(HttpResponse::Ok().json(json!({ "peers": peers })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransportBody {
    direction: TransportDirection,
    #[serde(default)]
    comedia: bool,
    #[serde(default = "default_rtcp_mux")]
    rtcp_mux: bool,
}

fn default_rtcp_mux() -> bool {
    true
}

async fn create_broadcaster_transport(
    request: HttpRequest,
    path: Path<(String, String)>,
    body: Json<CreateTransportBody>,
    server: Data<Server>,
) -> Result<HttpResponse, SignalingError> {
    check_origin(&request, &server.config().domain)?;

    let (room_id, peer_id) = path.into_inner();
    let room = existing_room(&server, room_id).await?;

    let response = room
        .broadcaster_create_transport(
            &PeerId::from(peer_id),
            body.direction,
            body.comedia,
            body.rtcp_mux,
        )
        .await?;

    Ok(HttpResponse::Created().json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportBody {
    ip: IpAddr,
    port: u16,
    rtcp_port: Option<u16>,
}

async fn connect_broadcaster_transport(
    request: HttpRequest,
    path: Path<(String, String, TransportId)>,
    body: Json<ConnectTransportBody>,
    server: Data<Server>,
) -> Result<HttpResponse, SignalingError> {
    check_origin(&request, &server.config().domain)?;

    let (room_id, peer_id, transport_id) = path.into_inner();
    let room = existing_room(&server, room_id).await?;

    room.broadcaster_connect_transport(
        &PeerId::from(peer_id),
        &transport_id,
        body.ip,
        body.port,
        body.rtcp_port,
    )
    .await?;

    Ok(HttpResponse::Ok().json(json!({})))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateProducerBody {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    app_data: ProducerAppDataBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerAppDataBody {
    source: MediaSource,
}

async fn create_broadcaster_producer(
    request: HttpRequest,
    path: Path<(String, String)>,
    body: Json<CreateProducerBody>,
    server: Data<Server>,
) -> Result<HttpResponse, SignalingError> {
    check_origin(&request, &server.config().domain)?;

    let (room_id, peer_id) = path.into_inner();
    let room = existing_room(&server, room_id).await?;

    let body = body.into_inner();
    let producer_id = room
        .broadcaster_produce(
            &PeerId::from(peer_id),
            &body.transport_id,
            body.kind,
            body.rtp_parameters,
            body.app_data.source,
        )
        .await?;

    Ok(HttpResponse::Created().json(json!({ "producerId": producer_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConsumerBody {
    transport_id: TransportId,
    producer_id: ProducerId,
    #[serde(default)]
    paused: bool,
    rtp_capabilities: RtpCapabilities,
}

async fn create_broadcaster_consumer(
    request: HttpRequest,
    path: Path<(String, String)>,
    body: Json<CreateConsumerBody>,
    server: Data<Server>,
) -> Result<HttpResponse, SignalingError> {
    check_origin(&request, &server.config().domain)?;

    let (room_id, peer_id) = path.into_inner();
    let room = existing_room(&server, room_id).await?;

    let body = body.into_inner();
    let consumer_id = room
        .broadcaster_consume(
            &PeerId::from(peer_id),
            &body.transport_id,
            &body.producer_id,
            body.rtp_capabilities,
            body.paused,
        )
        .await?;

    Ok(HttpResponse::Created().json(json!({ "consumerId": consumer_id })))
}

async fn resume_broadcaster_consumer(
    request: HttpRequest,
    path: Path<(String, String, ConsumerId)>,
    server: Data<Server>,
) -> Result<HttpResponse, SignalingError> {
    check_origin(&request, &server.config().domain)?;

    let (room_id, peer_id, consumer_id) = path.into_inner();
    let room = existing_room(&server, room_id).await?;

    room.broadcaster_resume_consumer(&PeerId::from(peer_id), &consumer_id)
        .await?;

    Ok(HttpResponse::Ok().json(json!({})))
}

async fn existing_room(server: &Server, room_id: String) -> Result<crate::room::Room, SignalingError> {
    let room_id = RoomId::from(room_id);
    server
        .room(&room_id)
        .await
        .ok_or_else(|| SignalingError::NotFound(format!("room with id \"{room_id}\" not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn origin_must_match_configuration() {
        assert!(origin_matches("https://conference.example.com", "conference.example.com"));
        assert!(origin_matches(
            "https://conference.example.com:4443",
            "conference.example.com"
        ));
        assert!(origin_matches("http://localhost", "localhost"));
        assert!(origin_matches(
            "https://conference.example.com",
            "https://conference.example.com"
        ));

        assert!(!origin_matches("https://evil.example.com", "conference.example.com"));
        assert!(!origin_matches("conference.example.com.evil", "conference.example.com"));
    }

    #[test]
    fn missing_origin_is_forbidden() {
        let request = TestRequest::default()
            .insert_header((header::HOST, "conference.example.com"))
            .to_http_request();

        let result = check_origin(&request, "conference.example.com");

        assert!(matches!(result, Err(SignalingError::Forbidden(_))));
    }

    #[test]
    fn missing_host_is_a_bad_request() {
        let request = TestRequest::default().to_http_request();

        let result = check_origin(&request, "conference.example.com");

        assert!(matches!(result, Err(SignalingError::TypeError(_))));
    }

    #[test]
    fn matching_origin_passes() {
        let request = TestRequest::default()
            .insert_header((header::HOST, "conference.example.com"))
            .insert_header((header::ORIGIN, "https://conference.example.com"))
            .to_http_request();

        assert!(check_origin(&request, "conference.example.com").is_ok());
    }
}
