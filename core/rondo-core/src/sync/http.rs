//! Blocking HTTP implementation of the `SyncClient` boundary.
//!
//! Inserts POST to the table endpoint, updates PATCH the row, reads GET with
//! query parameters. Non-2xx responses carry one of the backend's fixed
//! error tokens in the body. This client never retries; callers own retry
//! policy.

use std::sync::Arc;
use std::time::Duration;

use rondo_protocol::{
    Invitee, Notification, RequestMessageId, ResponseCode, Session, SessionStatus, InviteeStatus,
    UNASSIGNED_ID,
};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::sync::{
    InstantMessageRequest, InviteeUpdate, JoinAccepted, JoinRequest, NewSession, OpFailure,
    OpResult, SessionHandle, SessionUpdate, SyncClient,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const APPLICATION_KEY_HEADER: &str = "X-Application-Key";

pub struct HttpSyncClient {
    client: reqwest::blocking::Client,
    base_url: String,
    application_key: String,
    device: i32,
    clock: Arc<dyn Clock>,
}

impl HttpSyncClient {
    pub fn new(
        base_url: &str,
        application_key: &str,
        device: i32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, String> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| format!("failed to build http client: {err}"))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            application_key: application_key.to_string(),
            device,
            clock,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn insert_session(&self, session: &Session) -> OpResult<Session> {
        let response = self
            .client
            .post(self.url("/tables/session"))
            .header(APPLICATION_KEY_HEADER, &self.application_key)
            .json(session)
            .send()
            .map_err(transport)?;
        decode_row(response)
    }

    fn update_session(&self, session: &Session) -> OpResult<()> {
        let response = self
            .client
            .patch(self.url(&format!("/tables/session/{}", session.id)))
            .header(APPLICATION_KEY_HEADER, &self.application_key)
            .json(session)
            .send()
            .map_err(transport)?;
        decode_unit(response)
    }

    fn insert_invitee(&self, invitee: &Invitee) -> OpResult<Invitee> {
        let response = self
            .client
            .post(self.url("/tables/invitee"))
            .header(APPLICATION_KEY_HEADER, &self.application_key)
            .json(invitee)
            .send()
            .map_err(transport)?;
        decode_row(response)
    }

    fn update_invitee(&self, invitee: &Invitee) -> OpResult<()> {
        let response = self
            .client
            .patch(self.url(&format!("/tables/invitee/{}", invitee.id)))
            .header(APPLICATION_KEY_HEADER, &self.application_key)
            .json(invitee)
            .send()
            .map_err(transport)?;
        decode_unit(response)
    }

    fn session_row(&self, req: &SessionUpdate, request: RequestMessageId, status: SessionStatus) -> Session {
        Session {
            id: req.session_id,
            timestamp: self.clock.now(),
            name: req.name.clone(),
            channel: req.channel.clone(),
            latitude: req.latitude,
            longitude: req.longitude,
            address: req.address.clone(),
            device: self.device,
            short_device_id: req.short_device_id.clone(),
            request_message_id: request.as_i32(),
            session_status_id: status as i32,
            request_data_id: UNASSIGNED_ID,
            request_data: String::new(),
        }
    }

    fn invitee_row(&self, req: &InviteeUpdate, request: RequestMessageId, status: InviteeStatus) -> Invitee {
        Invitee {
            id: req.invitee_id,
            sid: req.session_id,
            timestamp: self.clock.now(),
            name: req.name.clone(),
            channel: req.channel.clone(),
            latitude: req.latitude,
            longitude: req.longitude,
            address: String::new(),
            device: self.device,
            request_message_id: request.as_i32(),
            invitee_status_id: status as i32,
            inviter_short_device_id: req.inviter_short_device_id.clone(),
            request_data_id: UNASSIGNED_ID,
            request_data: req.data.clone(),
        }
    }
}

impl SyncClient for HttpSyncClient {
    fn network_available(&self) -> bool {
        // HEAD against the service root; any response at all means the
        // transport is up, backend-level errors included.
        match self.client.head(self.url("/")).send() {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "connectivity probe failed");
                false
            }
        }
    }

    fn start_session(&self, req: &NewSession) -> OpResult<SessionHandle> {
        let session = Session {
            id: UNASSIGNED_ID,
            timestamp: self.clock.now(),
            name: req.name.clone(),
            channel: req.channel.clone(),
            latitude: req.latitude,
            longitude: req.longitude,
            address: req.address.clone(),
            device: self.device,
            short_device_id: req.short_device_id.clone(),
            request_message_id: RequestMessageId::SessionStart.as_i32(),
            // The insert script assigns the real status.
            session_status_id: SessionStatus::NotSet as i32,
            request_data_id: UNASSIGNED_ID,
            request_data: String::new(),
        };

        let inserted = self.insert_session(&session)?;
        Ok(SessionHandle {
            session_id: inserted.id,
        })
    }

    fn register_invitee(&self, req: &JoinRequest) -> OpResult<JoinAccepted> {
        let invitee = Invitee {
            id: UNASSIGNED_ID,
            sid: req.session_id,
            timestamp: self.clock.now(),
            name: req.name.clone(),
            channel: req.channel.clone(),
            latitude: req.latitude,
            longitude: req.longitude,
            address: req.address.clone(),
            device: self.device,
            request_message_id: RequestMessageId::InviteeJoin.as_i32(),
            invitee_status_id: InviteeStatus::NotSet as i32,
            inviter_short_device_id: req.inviter_short_device_id.clone(),
            request_data_id: UNASSIGNED_ID,
            request_data: String::new(),
        };

        // The insert script hands inviter-side data back on the inserted
        // row: the round-up point in Latitude/Longitude and the inviter's
        // name in RequestData.
        let inserted = self.insert_invitee(&invitee)?;
        Ok(JoinAccepted {
            session_id: req.session_id,
            invitee_id: inserted.id,
            round_up_latitude: inserted.latitude,
            round_up_longitude: inserted.longitude,
            inviter_name: inserted.request_data,
        })
    }

    fn update_invitee_location(&self, req: &InviteeUpdate) -> OpResult<()> {
        let row = self.invitee_row(
            req,
            RequestMessageId::InviteeLocationUpdate,
            InviteeStatus::InviteeIsEnRoute,
        );
        self.update_invitee(&row)
    }

    fn mark_arrived(&self, req: &InviteeUpdate) -> OpResult<()> {
        let row = self.invitee_row(
            req,
            RequestMessageId::InviteeHasArrived,
            InviteeStatus::InviteeHasArrived,
        );
        self.update_invitee(&row)
    }

    fn cancel_invitee(&self, req: &InviteeUpdate) -> OpResult<()> {
        let row = self.invitee_row(
            req,
            RequestMessageId::InviteeCancel,
            InviteeStatus::InviteeHasCancelled,
        );
        self.update_invitee(&row)
    }

    fn update_invitee_channel_uri(&self, req: &InviteeUpdate) -> OpResult<()> {
        let row = self.invitee_row(
            req,
            RequestMessageId::UpdateInviteeChannelUri,
            InviteeStatus::InviteeHasAccepted,
        );
        self.update_invitee(&row)
    }

    fn cancel_session(&self, req: &SessionUpdate) -> OpResult<()> {
        let row = self.session_row(
            req,
            RequestMessageId::SessionCancel,
            SessionStatus::SessionCancelledByInviter,
        );
        self.update_session(&row)
    }

    fn close_session(&self, req: &SessionUpdate) -> OpResult<()> {
        let row = self.session_row(
            req,
            RequestMessageId::SessionHasEnded,
            SessionStatus::SessionHasEnded,
        );
        self.update_session(&row)
    }

    fn move_round_up_point(&self, req: &SessionUpdate) -> OpResult<()> {
        let row = self.session_row(
            req,
            RequestMessageId::RoundUpLocationChange,
            SessionStatus::SessionActive,
        );
        self.update_session(&row)
    }

    fn update_inviter_channel_uri(&self, req: &SessionUpdate) -> OpResult<()> {
        // Only an active session ever needs its channel uri refreshed.
        let row = self.session_row(
            req,
            RequestMessageId::UpdateInviterChannelUri,
            SessionStatus::SessionActive,
        );
        self.update_session(&row)
    }

    fn send_instant_message(&self, req: &InstantMessageRequest) -> OpResult<()> {
        if req.invitee_id == UNASSIGNED_ID {
            // Inviter-sent: ride the session row.
            let row = Session {
                id: req.session_id,
                timestamp: self.clock.now(),
                name: req.from_name.clone(),
                channel: req.channel.clone(),
                latitude: 0.0,
                longitude: 0.0,
                address: String::new(),
                device: self.device,
                short_device_id: req.inviter_short_device_id.clone(),
                request_message_id: RequestMessageId::InstantMessage.as_i32(),
                session_status_id: SessionStatus::SessionActive as i32,
                request_data_id: UNASSIGNED_ID,
                request_data: req.text.clone(),
            };
            self.update_session(&row)
        } else {
            let update = InviteeUpdate {
                invitee_id: req.invitee_id,
                session_id: req.session_id,
                channel: req.channel.clone(),
                latitude: 0.0,
                longitude: 0.0,
                inviter_short_device_id: req.inviter_short_device_id.clone(),
                name: req.from_name.clone(),
                data: req.text.clone(),
            };
            let row = self.invitee_row(
                &update,
                RequestMessageId::InstantMessage,
                InviteeStatus::InviteeIsEnRoute,
            );
            self.update_invitee(&row)
        }
    }

    fn is_session_alive(&self, session_id: i64) -> OpResult<bool> {
        if session_id == UNASSIGNED_ID {
            return Ok(false);
        }

        let response = self
            .client
            .get(self.url(&format!("/tables/session/{session_id}")))
            .header(APPLICATION_KEY_HEADER, &self.application_key)
            .send()
            .map_err(transport)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let session: Session = decode_row(response)?;
        Ok(SessionStatus::from_i32(session.session_status_id).is_alive())
    }

    fn stored_notifications(
        &self,
        session_id: i64,
        invitee_id: i64,
        recipient_is_inviter: bool,
    ) -> OpResult<Vec<Notification>> {
        let mut request = self
            .client
            .get(self.url("/tables/notification"))
            .header(APPLICATION_KEY_HEADER, &self.application_key)
            .query(&[("sessionId", session_id.to_string())]);

        request = if recipient_is_inviter {
            request.query(&[("recipient", "0")])
        } else {
            request.query(&[
                ("recipient", "1".to_string()),
                ("inviteeId", invitee_id.to_string()),
            ])
        };

        let response = request.send().map_err(transport)?;
        decode_row(response)
    }
}

fn transport(err: reqwest::Error) -> OpFailure {
    OpFailure::Retryable(err.to_string())
}

fn decode_row<T: serde::de::DeserializeOwned>(response: reqwest::blocking::Response) -> OpResult<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(decode_failure(status, response));
    }
    response
        .json()
        .map_err(|err| OpFailure::Retryable(format!("malformed response body: {err}")))
}

fn decode_unit(response: reqwest::blocking::Response) -> OpResult<()> {
    let status = response.status();
    if !status.is_success() {
        return Err(decode_failure(status, response));
    }
    Ok(())
}

/// Pulls the backend error token out of a failed response. The token rides
/// either bare in the body or as `{"error": "ERR_..."}`.
fn decode_failure(status: reqwest::StatusCode, response: reqwest::blocking::Response) -> OpFailure {
    let body = response.text().unwrap_or_default();
    let token = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| {
            value
                .get("error")
                .and_then(|e| e.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| body.trim().trim_matches('"').to_string());

    if token.is_empty() {
        warn!(%status, "backend error response carried no token");
        return OpFailure::Backend(ResponseCode::Unknown(format!("http {status}")));
    }

    OpFailure::Backend(ResponseCode::parse_token(&token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn http_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// One-shot HTTP server: answers the first connection with `response`.
    fn serve_once(response: String) -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buffer = [0u8; 8192];
                let _ = stream.read(&mut buffer);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (format!("http://{addr}"), server)
    }

    fn client(base_url: &str) -> HttpSyncClient {
        HttpSyncClient::new(base_url, "k3y", 2, Arc::new(SystemClock)).expect("client")
    }

    fn new_session() -> NewSession {
        NewSession {
            channel: "https://push.example/device".to_string(),
            latitude: 51.50,
            longitude: -0.12,
            short_device_id: "ABCD1234".to_string(),
            name: "Ana".to_string(),
            address: String::new(),
        }
    }

    #[test]
    fn start_session_returns_the_assigned_id() {
        let body = r#"{
            "id": 42,
            "Timestamp": "2026-08-08T12:00:00Z",
            "Name": "Ana",
            "Channel": "https://push.example/device",
            "Latitude": 51.5,
            "Longitude": -0.12,
            "Address": "",
            "Device": 2,
            "ShortDeviceId": "ABCD1234",
            "RequestMessageId": 1,
            "SessionStatusId": 1,
            "RequestDataId": -1,
            "RequestData": ""
        }"#;
        let (base_url, server) = serve_once(http_response("201 Created", body));

        let handle = client(&base_url)
            .start_session(&new_session())
            .expect("insert succeeds");
        assert_eq!(handle.session_id, 42);
        server.join().expect("server");
    }

    #[test]
    fn backend_error_token_in_json_body_maps_to_its_code() {
        let (base_url, server) = serve_once(http_response(
            "400 Bad Request",
            r#"{"error":"ERR_TOO_MANY_INVITEES"}"#,
        ));

        let request = JoinRequest {
            session_id: 42,
            channel: "https://push.example/device".to_string(),
            latitude: 51.49,
            longitude: -0.11,
            inviter_short_device_id: "ABCD1234".to_string(),
            name: "Bob".to_string(),
            address: String::new(),
        };
        let failure = client(&base_url)
            .register_invitee(&request)
            .expect_err("rejected");
        assert_eq!(
            failure,
            OpFailure::Backend(ResponseCode::TooManyInvitees)
        );
        server.join().expect("server");
    }

    #[test]
    fn bare_error_token_in_body_also_maps() {
        let (base_url, server) = serve_once(http_response(
            "404 Not Found",
            "\"ERR_SESSION_NOT_FOUND\"",
        ));

        let update = SessionUpdate {
            session_id: 42,
            short_device_id: "ABCD1234".to_string(),
            channel: "https://push.example/device".to_string(),
            latitude: 51.50,
            longitude: -0.12,
            name: "Ana".to_string(),
            address: String::new(),
        };
        let failure = client(&base_url)
            .cancel_session(&update)
            .expect_err("rejected");
        assert_eq!(
            failure,
            OpFailure::Backend(ResponseCode::SessionNotFound)
        );
        server.join().expect("server");
    }

    #[test]
    fn transport_trouble_is_retryable() {
        // Nothing is listening here.
        let failure = client("http://127.0.0.1:9")
            .start_session(&new_session())
            .expect_err("no server");
        assert!(matches!(failure, OpFailure::Retryable(_)));
    }

    #[test]
    fn unassigned_session_id_short_circuits_liveness() {
        // No server needed: the call must not touch the network.
        let alive = client("http://127.0.0.1:9")
            .is_session_alive(UNASSIGNED_ID)
            .expect("local answer");
        assert!(!alive);
    }
}
